//! RPC message types and length-prefixed framing.
//!
//! Every message is bincode-encoded and sent as a 4-byte big-endian length
//! followed by the payload.

use crate::error::{Error, NetworkError, Result, WireError};
use crate::ident::{RegionId, TargetId};
use crate::migration::TargetChunk;
use crate::transfer::BulkRef;
use crate::types::{Endpoint, ProviderId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Network message wrapper for all communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Operation addressed to one provider of a service.
    Request(ProviderRequest),

    /// Result of a provider request.
    Response(ProviderResponse),

    /// Read bytes from an exposed bulk buffer.
    BulkPull {
        handle: u64,
        offset: u64,
        size: u64,
    },

    /// Bytes pulled from a bulk buffer.
    BulkData(std::result::Result<Vec<u8>, WireError>),

    /// Write bytes into an exposed bulk buffer.
    BulkPush {
        handle: u64,
        offset: u64,
        data: Vec<u8>,
    },

    /// Acknowledgement of a bulk push.
    BulkAck(std::result::Result<(), WireError>),

    /// Ask a service to stop.
    Shutdown,

    /// Answer to a shutdown request.
    ShutdownAck(std::result::Result<(), WireError>),
}

/// Request routed to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Unique request ID for correlation.
    pub request_id: u64,

    /// Provider the request is addressed to.
    pub provider_id: ProviderId,

    /// The operation to execute.
    pub op: Operation,
}

/// Response to a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The request ID this is responding to.
    pub request_id: u64,

    /// Operation outcome.
    pub result: std::result::Result<Reply, WireError>,
}

impl ProviderResponse {
    /// Build a response from a local result.
    pub fn from_result(request_id: u64, result: &Result<Reply>) -> Self {
        let result = match result {
            Ok(reply) => Ok(reply.clone()),
            Err(e) => Err(WireError::from(e)),
        };
        Self { request_id, result }
    }
}

/// Source of bytes for a write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// Bytes carried in the request.
    Inline(Vec<u8>),
    /// Bytes to pull from an exposed buffer.
    Bulk(BulkRef),
}

impl Payload {
    /// Number of bytes the payload carries.
    pub fn len(&self) -> u64 {
        match self {
            Payload::Inline(data) => data.len() as u64,
            Payload::Bulk(bulk) => bulk.size,
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Destination of bytes for a read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReadSink {
    /// Return the bytes in the response.
    Inline,
    /// Push the bytes into an exposed buffer.
    Bulk(BulkRef),
}

/// Provider operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    /// Enumerate up to `max_targets` attached targets.
    Probe { max_targets: u64 },

    /// Allocate a region.
    Create { target: TargetId, capacity: u64 },

    /// Write into a region.
    Write {
        target: TargetId,
        region: RegionId,
        offset: u64,
        payload: Payload,
    },

    /// Flush a byte range of a region.
    Persist {
        target: TargetId,
        region: RegionId,
        offset: u64,
        size: u64,
    },

    /// Create, fill and persist a region in one step.
    CreateWritePersist {
        target: TargetId,
        capacity: u64,
        payload: Payload,
    },

    /// Persisted size of a region.
    GetSize { target: TargetId, region: RegionId },

    /// Read from a region.
    Read {
        target: TargetId,
        region: RegionId,
        offset: u64,
        size: u64,
        sink: ReadSink,
    },

    /// Remove a region.
    Remove { target: TargetId, region: RegionId },

    /// Move a region to another provider.
    MigrateRegion {
        target: TargetId,
        region: RegionId,
        dest: Endpoint,
        dest_provider: ProviderId,
        dest_target: TargetId,
        remove_source: bool,
    },

    /// Move a whole target to another provider.
    MigrateTarget {
        target: TargetId,
        dest: Endpoint,
        dest_provider: ProviderId,
        dest_root: PathBuf,
        remove_source: bool,
    },

    /// One piece of an incoming target.
    TargetChunk(TargetChunk),

    /// Discard a partially received target.
    AbortTargetTransfer { transfer_id: uuid::Uuid },
}

impl Operation {
    /// Short name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Probe { .. } => "probe",
            Operation::Create { .. } => "create",
            Operation::Write { .. } => "write",
            Operation::Persist { .. } => "persist",
            Operation::CreateWritePersist { .. } => "create_write_persist",
            Operation::GetSize { .. } => "get_size",
            Operation::Read { .. } => "read",
            Operation::Remove { .. } => "remove",
            Operation::MigrateRegion { .. } => "migrate_region",
            Operation::MigrateTarget { .. } => "migrate_target",
            Operation::TargetChunk(_) => "target_chunk",
            Operation::AbortTargetTransfer { .. } => "abort_target_transfer",
        }
    }
}

/// Successful operation results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Targets(Vec<TargetId>),
    Region(RegionId),
    Done,
    Size(u64),
    Data(Vec<u8>),
    BytesRead(u64),
    Target(TargetId),
}

impl Reply {
    fn variant(&self) -> &'static str {
        match self {
            Reply::Targets(_) => "Targets",
            Reply::Region(_) => "Region",
            Reply::Done => "Done",
            Reply::Size(_) => "Size",
            Reply::Data(_) => "Data",
            Reply::BytesRead(_) => "BytesRead",
            Reply::Target(_) => "Target",
        }
    }

    /// Error for a reply of the wrong shape.
    pub fn unexpected(&self, expected: &str) -> Error {
        NetworkError::UnexpectedMessage(format!("expected {expected} reply, got {}", self.variant()))
            .into()
    }
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| NetworkError::Serialization(e.to_string()).into())
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<Message> {
    bincode::deserialize(data).map_err(|e| NetworkError::Deserialization(e.to_string()).into())
}

/// Frame a message with length prefix for TCP transmission.
pub fn frame_message(msg: &Message) -> Result<Vec<u8>> {
    let data = encode_message(msg)?;
    let len = u32::try_from(data.len())
        .map_err(|_| NetworkError::SendFailed("message too large".to_string()))?;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Write one framed message.
pub async fn write_message<W>(stream: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(msg)?;
    stream.write_all(&framed).await.map_err(NetworkError::Io)?;
    stream.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

/// Read one framed message.
///
/// Returns `None` when the peer closed the connection cleanly between frames.
pub async fn read_message<R>(stream: &mut R, max_message_size: usize) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_message_size {
        return Err(NetworkError::ReceiveFailed(format!(
            "message of {len} bytes exceeds limit of {max_message_size}"
        ))
        .into());
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => NetworkError::ConnectionClosed,
        _ => NetworkError::Io(e),
    })?;

    decode_message(&data).map(Some)
}
