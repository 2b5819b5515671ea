//! Eager versus bulk path selection.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a payload travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    /// Inline in the RPC message.
    Eager,
    /// Through an exposed bulk buffer.
    Bulk,
}

impl fmt::Display for TransferPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferPath::Eager => write!(f, "eager"),
            TransferPath::Bulk => write!(f, "bulk"),
        }
    }
}

/// Bytes of a framed request or reply reserved for everything but the payload.
pub const FRAME_OVERHEAD: u64 = 4096;

/// Byte threshold deciding between the eager and bulk paths.
///
/// The limit is local to one provider handle and never negotiated with the
/// server. Updates are visible to later calls; there is no isolation between
/// a concurrent reader and writer of the limit.
///
/// A payload that would not fit in one frame always goes bulk, whatever the
/// eager limit says.
#[derive(Debug)]
pub struct TransferPolicy {
    eager_limit: AtomicU64,
    frame_budget: u64,
}

impl TransferPolicy {
    /// Create a policy with the given eager limit for frames of at most
    /// `max_message_size` bytes.
    pub fn new(eager_limit: u64, max_message_size: usize) -> Self {
        Self {
            eager_limit: AtomicU64::new(eager_limit),
            frame_budget: (max_message_size as u64).saturating_sub(FRAME_OVERHEAD),
        }
    }

    /// Current eager limit in bytes.
    pub fn eager_limit(&self) -> u64 {
        self.eager_limit.load(Ordering::Relaxed)
    }

    /// Change the eager limit for subsequent operations.
    pub fn set_eager_limit(&self, limit: u64) {
        self.eager_limit.store(limit, Ordering::Relaxed);
    }

    /// Largest payload that can travel inline.
    pub fn frame_budget(&self) -> u64 {
        self.frame_budget
    }

    /// Path for a payload of `size` bytes.
    pub fn choose(&self, size: u64) -> TransferPath {
        if size <= self.eager_limit() && size <= self.frame_budget {
            TransferPath::Eager
        } else {
            TransferPath::Bulk
        }
    }
}
