//! Remote access to exposed memory buffers.
//!
//! A client exposes a local buffer in its [`BulkRegistry`] and receives an
//! [`ExposedBuffer`] guard. The buffer stays reachable through the client's
//! bulk listener until the guard is dropped. Requests refer to it with a
//! [`BulkRef`]; the provider then pulls from or pushes into the buffer in
//! chunks over a separate connection, so a long transfer never occupies the
//! request channel.

use crate::error::{Error, NetworkError, Result, WireError};
use crate::network::connection::ConnectionPool;
use crate::network::rpc::Message;
use crate::network::server::MessageHandler;
use crate::types::Endpoint;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Remote access granted on an exposed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl BulkAccess {
    fn readable(self) -> bool {
        matches!(self, BulkAccess::ReadOnly | BulkAccess::ReadWrite)
    }

    fn writable(self) -> bool {
        matches!(self, BulkAccess::WriteOnly | BulkAccess::ReadWrite)
    }
}

/// Handle to one exposed buffer within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkHandle {
    pub id: u64,
    pub size: u64,
    pub access: BulkAccess,
}

/// Reference to a byte range of an exposed buffer on some endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRef {
    /// Bulk listener serving the buffer.
    pub origin: Endpoint,
    pub handle: BulkHandle,
    /// Start of the range within the buffer.
    pub offset: u64,
    /// Length of the range.
    pub size: u64,
}

impl BulkRef {
    /// Reference `size` bytes at `offset` of an exposed buffer.
    pub fn new(origin: Endpoint, handle: BulkHandle, offset: u64, size: u64) -> Result<Self> {
        match offset.checked_add(size) {
            Some(end) if end <= handle.size => Ok(Self {
                origin,
                handle,
                offset,
                size,
            }),
            _ => Err(Error::out_of_bounds(offset, size, handle.size)),
        }
    }
}

#[derive(Debug)]
struct BufferEntry {
    data: RwLock<Vec<u8>>,
    access: BulkAccess,
}

/// Buffers currently exposed for remote access.
#[derive(Debug, Default)]
pub struct BulkRegistry {
    buffers: DashMap<u64, Arc<BufferEntry>>,
    next_id: AtomicU64,
}

impl BulkRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `data` for remote access from `origin` until the guard drops.
    pub fn expose(self: &Arc<Self>, origin: Endpoint, data: Vec<u8>, access: BulkAccess) -> ExposedBuffer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = BulkHandle {
            id,
            size: data.len() as u64,
            access,
        };
        let entry = Arc::new(BufferEntry {
            data: RwLock::new(data),
            access,
        });
        self.buffers.insert(id, entry.clone());
        debug!(handle = id, size = handle.size, ?access, "Buffer exposed");

        ExposedBuffer {
            registry: self.clone(),
            entry,
            handle,
            origin,
        }
    }

    /// Number of buffers currently exposed.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffer is exposed.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn entry(&self, id: u64) -> Result<Arc<BufferEntry>> {
        self.buffers
            .get(&id)
            .map(|e| e.clone())
            .ok_or(Error::BulkHandleNotFound(id))
    }

    /// Copy `size` bytes at `offset` out of a readable buffer.
    pub fn read(&self, id: u64, offset: u64, size: u64) -> Result<Vec<u8>> {
        let entry = self.entry(id)?;
        if !entry.access.readable() {
            return Err(Error::Unsupported(format!("bulk buffer {id} is not readable")));
        }
        let data = entry.data.read();
        let range = byte_range(offset, size, data.len())?;
        Ok(data[range].to_vec())
    }

    /// Copy `bytes` into a writable buffer at `offset`.
    pub fn write(&self, id: u64, offset: u64, bytes: &[u8]) -> Result<()> {
        let entry = self.entry(id)?;
        if !entry.access.writable() {
            return Err(Error::Unsupported(format!("bulk buffer {id} is not writable")));
        }
        let mut data = entry.data.write();
        let range = byte_range(offset, bytes.len() as u64, data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }
}

fn byte_range(offset: u64, size: u64, len: usize) -> Result<std::ops::Range<usize>> {
    let limit = len as u64;
    match offset.checked_add(size) {
        Some(end) if end <= limit => Ok(offset as usize..end as usize),
        _ => Err(Error::out_of_bounds(offset, size, limit)),
    }
}

/// Scoped exposure of a buffer; unregisters it on drop.
#[derive(Debug)]
pub struct ExposedBuffer {
    registry: Arc<BulkRegistry>,
    entry: Arc<BufferEntry>,
    handle: BulkHandle,
    origin: Endpoint,
}

impl ExposedBuffer {
    /// Handle of the exposed buffer.
    pub fn handle(&self) -> BulkHandle {
        self.handle
    }

    /// Endpoint serving the buffer.
    pub fn origin(&self) -> Endpoint {
        self.origin
    }

    /// Size of the buffer in bytes.
    pub fn len(&self) -> u64 {
        self.handle.size
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.handle.size == 0
    }

    /// Reference to the whole buffer.
    pub fn bulk_ref(&self) -> BulkRef {
        BulkRef {
            origin: self.origin,
            handle: self.handle,
            offset: 0,
            size: self.handle.size,
        }
    }

    /// Reference to `size` bytes at `offset`.
    pub fn slice(&self, offset: u64, size: u64) -> Result<BulkRef> {
        BulkRef::new(self.origin, self.handle, offset, size)
    }

    /// Copy of the current buffer contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.entry.data.read().clone()
    }
}

impl Drop for ExposedBuffer {
    fn drop(&mut self) {
        self.registry.buffers.remove(&self.handle.id);
        debug!(handle = self.handle.id, "Buffer released");
    }
}

/// Serves pulls and pushes against a registry.
pub struct BulkHandler {
    registry: Arc<BulkRegistry>,
}

impl BulkHandler {
    pub fn new(registry: Arc<BulkRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MessageHandler for BulkHandler {
    async fn handle(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::BulkPull {
                handle,
                offset,
                size,
            } => {
                let result = self.registry.read(handle, offset, size);
                Some(Message::BulkData(result.map_err(|e| WireError::from(&e))))
            }
            Message::BulkPush {
                handle,
                offset,
                data,
            } => {
                let result = self.registry.write(handle, offset, &data);
                Some(Message::BulkAck(result.map_err(|e| WireError::from(&e))))
            }
            other => {
                warn!(message = ?other, "Unexpected message on bulk listener");
                let e = Error::Unsupported("bulk listener only serves pull and push".into());
                Some(Message::BulkAck(Err(WireError::from(&e))))
            }
        }
    }
}

/// Pull the bytes referenced by `bulk` from its origin.
pub async fn pull(pool: &ConnectionPool, bulk: &BulkRef, chunk_size: usize) -> Result<Vec<u8>> {
    let chunk = chunk_size.max(1) as u64;
    let total = usize::try_from(bulk.size)
        .map_err(|_| Error::out_of_bounds(bulk.offset, bulk.size, bulk.handle.size))?;
    let mut out = Vec::with_capacity(total);

    let mut done = 0u64;
    while done < bulk.size {
        let size = chunk.min(bulk.size - done);
        let msg = Message::BulkPull {
            handle: bulk.handle.id,
            offset: bulk.offset + done,
            size,
        };
        match pool.call(&msg).await? {
            Message::BulkData(Ok(data)) if data.len() as u64 == size => out.extend_from_slice(&data),
            Message::BulkData(Ok(data)) => {
                return Err(NetworkError::ReceiveFailed(format!(
                    "short bulk pull: {} of {size} bytes",
                    data.len()
                ))
                .into())
            }
            Message::BulkData(Err(e)) => return Err(e.into()),
            other => {
                return Err(NetworkError::UnexpectedMessage(format!("{other:?}")).into());
            }
        }
        done += size;
    }

    debug!(origin = %bulk.origin, handle = bulk.handle.id, bytes = bulk.size, "Bulk pull complete");
    Ok(out)
}

/// Push `data` into the buffer range referenced by `bulk`.
pub async fn push(pool: &ConnectionPool, bulk: &BulkRef, data: &[u8], chunk_size: usize) -> Result<()> {
    if data.len() as u64 > bulk.size {
        return Err(Error::out_of_bounds(0, data.len() as u64, bulk.size));
    }

    for (i, piece) in data.chunks(chunk_size.max(1)).enumerate() {
        let msg = Message::BulkPush {
            handle: bulk.handle.id,
            offset: bulk.offset + (i * chunk_size.max(1)) as u64,
            data: piece.to_vec(),
        };
        match pool.call(&msg).await? {
            Message::BulkAck(Ok(())) => {}
            Message::BulkAck(Err(e)) => return Err(e.into()),
            other => {
                return Err(NetworkError::UnexpectedMessage(format!("{other:?}")).into());
            }
        }
    }

    debug!(origin = %bulk.origin, handle = bulk.handle.id, bytes = data.len(), "Bulk push complete");
    Ok(())
}
