//! Persistent pools and the regions inside them.
//!
//! - [`pool`]: creating and opening pool files
//! - [`format`]: on-disk layout of pool and extent headers
//! - [`allocator`]: free-space management within a pool
//! - [`region`]: the region state machine over one open pool

pub mod allocator;
pub mod format;
pub mod pool;
pub mod region;

pub use pool::{make_pool, open_pool, PoolFile, DEFAULT_POOL_MODE};
pub use region::{RegionExport, RegionStore};
