//! Region and target migration between providers.
//!
//! Migration is driven by the source provider. It copies data to the
//! destination and only removes the source once the destination has
//! confirmed a durable copy:
//!
//! ```text
//! migrate_region:  export ──▶ dest create_write_persist ──▶ [remove source]
//! migrate_target:  sync ──▶ stream chunks ──▶ dest verify + attach ──▶ [detach + delete source]
//! ```
//!
//! A failure before the destination confirms leaves the source untouched. A
//! region whose source cannot be removed after copying has its copy removed,
//! so the caller never ends up with two live regions it did not ask for.
//! Writes issued against a target while it is being migrated are not fenced;
//! callers must quiesce the target first.

mod coordinator;
mod receiver;

pub use coordinator::MigrationCoordinator;
pub use receiver::TargetReceiver;

use crate::error::Result;
use crate::ident::{RegionId, TargetId};
use crate::types::{Endpoint, ProviderId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// One ordered piece of a pool file streamed to a destination provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetChunk {
    /// Identifies one transfer; chunks of different transfers never mix.
    pub transfer_id: Uuid,
    /// Position of this chunk, starting at 0.
    pub sequence: u64,
    /// Pool file name at the destination.
    pub file_name: String,
    /// Destination directory.
    pub root: PathBuf,
    /// Byte offset of `data` within the pool file.
    pub offset: u64,
    pub data: Vec<u8>,
    /// Set on the last chunk.
    pub is_final: bool,
    /// Whole file length, meaningful on the last chunk.
    pub total_len: u64,
    /// CRC-32 of the whole file, meaningful on the last chunk.
    pub checksum: u32,
}

/// Destination-side operations a migration needs.
#[async_trait]
pub trait MigrationPeer: Send + Sync {
    /// Create, fill and persist a region on the peer.
    async fn create_write_persist(
        &self,
        target: TargetId,
        capacity: u64,
        data: Vec<u8>,
    ) -> Result<RegionId>;

    /// Remove a region on the peer; used to undo a copy.
    async fn remove(&self, target: TargetId, region: &RegionId) -> Result<()>;

    /// Deliver one chunk of a target; the final chunk returns the attached id.
    async fn send_target_chunk(&self, chunk: TargetChunk) -> Result<Option<TargetId>>;

    /// Tell the peer to discard a partially received target.
    async fn abort_target_transfer(&self, transfer_id: Uuid) -> Result<()>;
}

/// Opens a [`MigrationPeer`] for a remote provider.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, endpoint: Endpoint, provider_id: ProviderId) -> Result<Arc<dyn MigrationPeer>>;
}
