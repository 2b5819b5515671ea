//! Client-side proxy for one remote provider.

use crate::client::Client;
use crate::error::{Error, NetworkError, Result};
use crate::ident::{RegionId, TargetId};
use crate::migration::{MigrationPeer, TargetChunk};
use crate::network::connection::ConnectionPool;
use crate::network::rpc::{Message, Operation, Payload, ProviderRequest, ReadSink, Reply};
use crate::provider::expect_region;
use crate::transfer::{BulkAccess, BulkRef, TransferPath, TransferPolicy};
use crate::types::{Endpoint, ProviderId};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Initial batch size when probing without a known target count.
const PROBE_INITIAL_BATCH: usize = 32;

/// Binds an endpoint and a provider id.
///
/// Clones share the connection pool and the eager limit. The handle holds no
/// per-operation state, so it may be used from many tasks at once.
#[derive(Clone)]
pub struct ProviderHandle {
    client: Client,
    endpoint: Endpoint,
    provider_id: ProviderId,
    pool: Arc<ConnectionPool>,
    policy: Arc<TransferPolicy>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("endpoint", &self.endpoint)
            .field("provider_id", &self.provider_id)
            .field("eager_limit", &self.policy.eager_limit())
            .finish()
    }
}

impl ProviderHandle {
    pub(crate) fn new(client: Client, endpoint: Endpoint, provider_id: ProviderId) -> Self {
        let pool = client.connection(endpoint);
        let config = client.config();
        let policy = Arc::new(TransferPolicy::new(config.eager_limit, config.max_message_size));
        Self {
            client,
            endpoint,
            provider_id,
            pool,
            policy,
        }
    }

    /// Remote service endpoint.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Remote provider id.
    pub fn provider_id(&self) -> ProviderId {
        self.provider_id
    }

    /// Current eager limit in bytes.
    pub fn eager_limit(&self) -> u64 {
        self.policy.eager_limit()
    }

    /// Change the eager limit for subsequent operations. Local only.
    pub fn set_eager_limit(&self, limit: u64) {
        self.policy.set_eager_limit(limit);
    }

    async fn call(&self, op: Operation) -> Result<Reply> {
        self.call_within(op, self.client.config().rpc_timeout).await
    }

    async fn call_within(&self, op: Operation, timeout: Duration) -> Result<Reply> {
        let request_id = self.client.next_request_id();
        let msg = Message::Request(ProviderRequest {
            request_id,
            provider_id: self.provider_id,
            op,
        });

        match self.pool.call_with_timeout(&msg, timeout).await? {
            Message::Response(resp) if resp.request_id == request_id => resp.result.map_err(Into::into),
            Message::Response(resp) => Err(NetworkError::UnexpectedMessage(format!(
                "response to request {} while waiting for {request_id}",
                resp.request_id
            ))
            .into()),
            other => Err(NetworkError::UnexpectedMessage(format!("{other:?}")).into()),
        }
    }

    /// Enumerate targets of the provider.
    ///
    /// With `None`, asks for 32 and doubles the request while the answer comes
    /// back full, so the complete set is returned whatever its size.
    pub async fn probe(&self, max_targets: Option<usize>) -> Result<Vec<TargetId>> {
        if let Some(max) = max_targets {
            return self.probe_once(max).await;
        }

        let mut batch = PROBE_INITIAL_BATCH;
        loop {
            let ids = self.probe_once(batch).await?;
            if ids.len() < batch {
                return Ok(ids);
            }
            batch = batch.saturating_mul(2);
        }
    }

    async fn probe_once(&self, max: usize) -> Result<Vec<TargetId>> {
        match self
            .call(Operation::Probe {
                max_targets: max as u64,
            })
            .await?
        {
            Reply::Targets(ids) => Ok(ids),
            other => Err(other.unexpected("Targets")),
        }
    }

    /// Allocate a region of `capacity` bytes.
    pub async fn create(&self, target: TargetId, capacity: u64) -> Result<RegionId> {
        expect_region(self.call(Operation::Create { target, capacity }).await?)
    }

    /// Write `data` at `offset`, inline or through a bulk buffer depending on
    /// the eager limit.
    pub async fn write(&self, target: TargetId, region: &RegionId, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.policy.choose(data.len() as u64);
        debug!(region = %region, bytes = data.len(), path = %path, "write");
        let reply = match path {
            TransferPath::Eager => {
                self.call(Operation::Write {
                    target,
                    region: region.clone(),
                    offset,
                    payload: Payload::Inline(data.to_vec()),
                })
                .await?
            }
            TransferPath::Bulk => {
                let exposed = self.client.expose(data.to_vec(), BulkAccess::ReadOnly);
                self.call(Operation::Write {
                    target,
                    region: region.clone(),
                    offset,
                    payload: Payload::Bulk(exposed.bulk_ref()),
                })
                .await?
            }
        };
        expect_done(reply)
    }

    /// Flush `[offset, offset + size)` of a region.
    pub async fn persist(&self, target: TargetId, region: &RegionId, offset: u64, size: u64) -> Result<()> {
        expect_done(
            self.call(Operation::Persist {
                target,
                region: region.clone(),
                offset,
                size,
            })
            .await?,
        )
    }

    /// Persist from `offset` up to the region's current size.
    ///
    /// The size comes from [`get_size`](Self::get_size), so this fails with
    /// `Unsupported` when the provider does not track sizes.
    pub async fn persist_to_end(&self, target: TargetId, region: &RegionId, offset: u64) -> Result<()> {
        let size = self.remaining(target, region, offset).await?;
        self.persist(target, region, offset, size).await
    }

    /// Create a region of `capacity` bytes holding `data`, all or nothing.
    pub async fn create_write_persist(&self, target: TargetId, capacity: u64, data: &[u8]) -> Result<RegionId> {
        let path = self.policy.choose(data.len() as u64);
        debug!(target_id = %target, bytes = data.len(), path = %path, "create_write_persist");
        match path {
            TransferPath::Eager => expect_region(
                self.call(Operation::CreateWritePersist {
                    target,
                    capacity,
                    payload: Payload::Inline(data.to_vec()),
                })
                .await?,
            ),
            TransferPath::Bulk => {
                let exposed = self.client.expose(data.to_vec(), BulkAccess::ReadOnly);
                expect_region(
                    self.call(Operation::CreateWritePersist {
                        target,
                        capacity,
                        payload: Payload::Bulk(exposed.bulk_ref()),
                    })
                    .await?,
                )
            }
        }
    }

    /// Persisted size of a region.
    pub async fn get_size(&self, target: TargetId, region: &RegionId) -> Result<u64> {
        match self
            .call(Operation::GetSize {
                target,
                region: region.clone(),
            })
            .await?
        {
            Reply::Size(size) => Ok(size),
            other => Err(other.unexpected("Size")),
        }
    }

    /// Read `size` bytes at `offset`.
    pub async fn read(&self, target: TargetId, region: &RegionId, offset: u64, size: u64) -> Result<Vec<u8>> {
        let path = self.policy.choose(size);
        debug!(region = %region, bytes = size, path = %path, "read");
        match path {
            TransferPath::Eager => {
                let reply = self
                    .call(Operation::Read {
                        target,
                        region: region.clone(),
                        offset,
                        size,
                        sink: ReadSink::Inline,
                    })
                    .await?;
                match reply {
                    Reply::Data(data) => Ok(data),
                    other => Err(other.unexpected("Data")),
                }
            }
            TransferPath::Bulk => {
                // Have the provider bounds-check the range before the buffer
                // is allocated: an empty read at the end offset fails exactly
                // when the full read would.
                let end = offset
                    .checked_add(size)
                    .ok_or_else(|| Error::out_of_bounds(offset, size, u64::MAX))?;
                self.call(Operation::Read {
                    target,
                    region: region.clone(),
                    offset: end,
                    size: 0,
                    sink: ReadSink::Inline,
                })
                .await?;

                let exposed = self.client.expose(receive_buffer(offset, size)?, BulkAccess::WriteOnly);
                let reply = self
                    .call(Operation::Read {
                        target,
                        region: region.clone(),
                        offset,
                        size,
                        sink: ReadSink::Bulk(exposed.bulk_ref()),
                    })
                    .await?;
                match reply {
                    Reply::BytesRead(n) => {
                        let mut data = exposed.to_vec();
                        data.truncate(n as usize);
                        Ok(data)
                    }
                    other => Err(other.unexpected("BytesRead")),
                }
            }
        }
    }

    /// Read from `offset` up to the region's persisted size.
    ///
    /// Needs size tracking on the provider, like
    /// [`persist_to_end`](Self::persist_to_end).
    pub async fn read_to_end(&self, target: TargetId, region: &RegionId, offset: u64) -> Result<Vec<u8>> {
        let size = self.remaining(target, region, offset).await?;
        self.read(target, region, offset, size).await
    }

    async fn remaining(&self, target: TargetId, region: &RegionId, offset: u64) -> Result<u64> {
        let size = self.get_size(target, region).await?;
        size.checked_sub(offset)
            .ok_or_else(|| Error::out_of_bounds(offset, 0, size))
    }

    /// Remove a region.
    pub async fn remove(&self, target: TargetId, region: &RegionId) -> Result<()> {
        expect_done(
            self.call(Operation::Remove {
                target,
                region: region.clone(),
            })
            .await?,
        )
    }

    /// Write the bytes of an already exposed buffer, always on the bulk path.
    pub async fn proxy_write(&self, target: TargetId, region: &RegionId, offset: u64, bulk: &BulkRef) -> Result<()> {
        expect_done(
            self.call(Operation::Write {
                target,
                region: region.clone(),
                offset,
                payload: Payload::Bulk(bulk.clone()),
            })
            .await?,
        )
    }

    /// Read into an already exposed buffer. Returns the number of bytes pushed.
    pub async fn proxy_read(&self, target: TargetId, region: &RegionId, offset: u64, bulk: &BulkRef) -> Result<u64> {
        match self
            .call(Operation::Read {
                target,
                region: region.clone(),
                offset,
                size: bulk.size,
                sink: ReadSink::Bulk(bulk.clone()),
            })
            .await?
        {
            Reply::BytesRead(n) => Ok(n),
            other => Err(other.unexpected("BytesRead")),
        }
    }

    /// Create a region sized to `bulk` and fill it from the exposed buffer.
    pub async fn proxy_create_write_persist(&self, target: TargetId, bulk: &BulkRef) -> Result<RegionId> {
        expect_region(
            self.call(Operation::CreateWritePersist {
                target,
                capacity: bulk.size,
                payload: Payload::Bulk(bulk.clone()),
            })
            .await?,
        )
    }

    /// Move a region to `dest_target` on another provider. Returns the new
    /// region id at the destination.
    ///
    /// Bounded by the client's migration timeout rather than the RPC timeout.
    /// A `Timeout` error does not mean the migration stopped; the provider may
    /// still finish it.
    pub async fn migrate_region(
        &self,
        target: TargetId,
        region: &RegionId,
        dest: Endpoint,
        dest_provider: ProviderId,
        dest_target: TargetId,
        remove_source: bool,
    ) -> Result<RegionId> {
        let op = Operation::MigrateRegion {
            target,
            region: region.clone(),
            dest,
            dest_provider,
            dest_target,
            remove_source,
        };
        expect_region(
            self.call_within(op, self.client.config().migration_timeout)
                .await?,
        )
    }

    /// Move a whole target into `dest_root` on another provider. Returns once
    /// the destination has attached it.
    ///
    /// Same timeout rules as [`migrate_region`](Self::migrate_region): after a
    /// `Timeout` the source may still be detached and deleted once the copy
    /// completes, so check with [`probe`](Self::probe) before retrying.
    pub async fn migrate_target(
        &self,
        target: TargetId,
        dest: Endpoint,
        dest_provider: ProviderId,
        dest_root: impl Into<PathBuf>,
        remove_source: bool,
    ) -> Result<TargetId> {
        let op = Operation::MigrateTarget {
            target,
            dest,
            dest_provider,
            dest_root: dest_root.into(),
            remove_source,
        };
        match self
            .call_within(op, self.client.config().migration_timeout)
            .await?
        {
            Reply::Target(id) => Ok(id),
            other => Err(other.unexpected("Target")),
        }
    }
}

/// Zeroed buffer for a bulk read of `size` bytes.
///
/// A size no allocation can satisfy is reported as out of bounds rather than
/// aborting the process.
fn receive_buffer(offset: u64, size: u64) -> Result<Vec<u8>> {
    let oob = || Error::out_of_bounds(offset, size, isize::MAX as u64);
    let len = usize::try_from(size).map_err(|_| oob())?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| oob())?;
    buf.resize(len, 0);
    Ok(buf)
}

fn expect_done(reply: Reply) -> Result<()> {
    match reply {
        Reply::Done => Ok(()),
        other => Err(other.unexpected("Done")),
    }
}

#[async_trait]
impl MigrationPeer for ProviderHandle {
    async fn create_write_persist(&self, target: TargetId, capacity: u64, data: Vec<u8>) -> Result<RegionId> {
        ProviderHandle::create_write_persist(self, target, capacity, &data).await
    }

    async fn remove(&self, target: TargetId, region: &RegionId) -> Result<()> {
        ProviderHandle::remove(self, target, region).await
    }

    async fn send_target_chunk(&self, chunk: TargetChunk) -> Result<Option<TargetId>> {
        match self.call(Operation::TargetChunk(chunk)).await? {
            Reply::Target(id) => Ok(Some(id)),
            Reply::Done => Ok(None),
            other => Err(other.unexpected("Target or Done")),
        }
    }

    async fn abort_target_transfer(&self, transfer_id: Uuid) -> Result<()> {
        expect_done(self.call(Operation::AbortTargetTransfer { transfer_id }).await?)
    }
}
