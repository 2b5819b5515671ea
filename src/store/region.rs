//! Per-target region store.
//!
//! A [`RegionStore`] owns one open pool file. It allocates regions as extents
//! in the pool's data area and runs the region state machine:
//!
//! ```text
//! Allocated ──write──▶ Written ──persist──▶ Persisted ──remove──▶ Removed
//!                        ▲  │                  │
//!                        └──┴──── write ───────┘
//! ```
//!
//! `write` and `persist` may repeat in any order; `Removed` is terminal.
//!
//! # Concurrency
//!
//! Each region has its own mutex, held for the duration of one operation, so
//! operations on one region are atomic with respect to each other while
//! different regions proceed independently. The allocator has a separate
//! mutex held only while extents are carved out or given back. File I/O is
//! positional, so no lock guards a shared file cursor.
//!
//! # Region ids
//!
//! A region id is 16 bytes: the region's sequence number followed by its
//! extent offset, both little-endian. Sequence numbers are never reused within
//! a pool, so the id of a removed region never resolves again even when its
//! space is reallocated.

use crate::error::{Error, FormatError, Result};
use crate::ident::{RegionId, TargetId, REGION_ID_LEN};
use crate::store::allocator::{Allocation, Allocator, Release};
use crate::store::format::{
    extent_len_for, ExtentHeader, ExtentState, PoolHeader, DATA_OFFSET, EXTENT_HEADER_SIZE,
    POOL_HEADER_SIZE,
};
use crate::store::pool::PoolFile;
use crate::testing::failpoint::FailpointRegistry;
use crate::types::RegionInfo;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Region content exported for migration.
#[derive(Debug, Clone)]
pub struct RegionExport {
    /// Allocated capacity of the source region.
    pub capacity: u64,
    /// Persisted bytes when size tracking is on, otherwise the full capacity.
    pub data: Vec<u8>,
}

/// One live region.
#[derive(Debug)]
struct RegionSlot {
    sequence: u64,
    /// Extent offset relative to the data area.
    offset: u64,
    extent_len: u64,
    capacity: u64,
    state: Mutex<SlotState>,
}

#[derive(Debug)]
struct SlotState {
    persisted_size: u64,
    removed: bool,
}

impl RegionSlot {
    fn id(&self) -> RegionId {
        encode_region_id(self.sequence, self.offset)
    }

    /// File offset of the first region byte.
    fn body_offset(&self) -> u64 {
        DATA_OFFSET + self.offset + EXTENT_HEADER_SIZE
    }

    fn header(&self, persisted_size: u64) -> ExtentHeader {
        let mut header = ExtentHeader::live(self.sequence, self.extent_len, self.capacity);
        header.persisted_size = persisted_size;
        header
    }
}

fn encode_region_id(sequence: u64, offset: u64) -> RegionId {
    let mut raw = [0u8; REGION_ID_LEN];
    raw[0..8].copy_from_slice(&sequence.to_le_bytes());
    raw[8..16].copy_from_slice(&offset.to_le_bytes());
    RegionId::from_raw(raw.to_vec())
}

fn decode_region_id(id: &RegionId) -> Result<(u64, u64)> {
    let raw = id.as_bytes();
    if raw.len() != REGION_ID_LEN {
        return Err(Error::MalformedIdentifier(format!(
            "region id has {} bytes, expected {REGION_ID_LEN}",
            raw.len()
        )));
    }
    let mut seq = [0u8; 8];
    let mut off = [0u8; 8];
    seq.copy_from_slice(&raw[0..8]);
    off.copy_from_slice(&raw[8..16]);
    Ok((u64::from_le_bytes(seq), u64::from_le_bytes(off)))
}

/// Checks `offset + size <= limit` without overflow.
fn check_range(offset: u64, size: u64, limit: u64) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(Error::out_of_bounds(offset, size, limit)),
    }
}

/// Region allocation and the write/persist/read/remove state machine for one target.
#[derive(Debug)]
pub struct RegionStore {
    target_id: TargetId,
    path: PathBuf,
    file: File,
    capacity: u64,
    size_tracking: bool,

    /// Live regions keyed by extent offset.
    regions: DashMap<u64, Arc<RegionSlot>>,

    /// Free-space map plus the pool header it mirrors.
    allocator: Mutex<(Allocator, PoolHeader)>,

    next_sequence: AtomicU64,

    failpoints: Option<Arc<FailpointRegistry>>,
}

impl RegionStore {
    /// Open a store over a pool, recovering all regions recorded in it.
    pub fn open(pool: PoolFile, size_tracking: bool) -> Result<Self> {
        let PoolFile { file, path, header } = pool;
        let mut allocator = Allocator::new(header.capacity, header.high_water);
        let regions = DashMap::new();
        let mut max_sequence = 0u64;
        let mut pos = 0u64;
        let mut buf = [0u8; EXTENT_HEADER_SIZE as usize];

        while pos < header.high_water {
            if header.high_water - pos < EXTENT_HEADER_SIZE {
                return Err(FormatError::Corrupt(format!("trailing bytes at extent offset {pos}")).into());
            }
            file.read_exact_at(&mut buf, DATA_OFFSET + pos)?;
            let extent = ExtentHeader::from_bytes(&buf, pos)?;
            let end = pos
                .checked_add(extent.extent_len)
                .filter(|end| *end <= header.high_water)
                .ok_or_else(|| {
                    FormatError::Corrupt(format!("extent at {pos} overruns high water"))
                })?;

            max_sequence = max_sequence.max(extent.sequence);
            match extent.state {
                ExtentState::Live => {
                    let slot = RegionSlot {
                        sequence: extent.sequence,
                        offset: pos,
                        extent_len: extent.extent_len,
                        capacity: extent.capacity,
                        state: Mutex::new(SlotState {
                            persisted_size: extent.persisted_size,
                            removed: false,
                        }),
                    };
                    regions.insert(pos, Arc::new(slot));
                }
                ExtentState::Free => allocator.insert_free(pos, extent.extent_len),
            }
            pos = end;
        }

        info!(
            target_id = %header.target_id,
            path = %path.display(),
            regions = regions.len(),
            high_water = header.high_water,
            "Region store opened"
        );

        Ok(Self {
            target_id: header.target_id,
            path,
            file,
            capacity: header.capacity,
            size_tracking,
            regions,
            allocator: Mutex::new((allocator, header)),
            next_sequence: AtomicU64::new(max_sequence + 1),
            failpoints: None,
        })
    }

    /// Attach a failpoint registry.
    pub fn with_failpoints(mut self, failpoints: Option<Arc<FailpointRegistry>>) -> Self {
        self.failpoints = failpoints;
        self
    }

    /// Checks `name` and its target-scoped form `name:<target id>`.
    fn fail(&self, name: &str) -> Result<()> {
        match &self.failpoints {
            Some(registry) => {
                registry.check(name)?;
                registry.check(&format!("{name}:{}", self.target_id))
            }
            None => Ok(()),
        }
    }

    /// Id of the target this store belongs to.
    pub fn target_id(&self) -> TargetId {
        self.target_id
    }

    /// Path of the backing pool file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data-area capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Whether persisted sizes are tracked.
    pub fn size_tracking(&self) -> bool {
        self.size_tracking
    }

    /// Bytes not allocated to regions.
    pub fn free_bytes(&self) -> u64 {
        self.allocator.lock().0.free_bytes()
    }

    /// Number of live regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Enumerate live regions.
    pub fn list_regions(&self) -> Vec<RegionInfo> {
        let mut out: Vec<RegionInfo> = self
            .regions
            .iter()
            .filter_map(|entry| {
                let slot = entry.value();
                let state = slot.state.lock();
                (!state.removed).then(|| RegionInfo {
                    id: slot.id(),
                    capacity: slot.capacity,
                    persisted_size: state.persisted_size,
                })
            })
            .collect();
        out.sort_by_key(|info| decode_region_id(&info.id).map(|(_, off)| off).unwrap_or(0));
        out
    }

    fn lookup(&self, id: &RegionId) -> Result<Arc<RegionSlot>> {
        let (sequence, offset) = decode_region_id(id)?;
        self.regions
            .get(&offset)
            .filter(|slot| slot.sequence == sequence)
            .map(|slot| slot.clone())
            .ok_or_else(|| Error::RegionNotFound(id.clone()))
    }

    fn write_extent_header(&self, offset: u64, header: &ExtentHeader) -> Result<()> {
        self.file.write_all_at(&header.to_bytes(), DATA_OFFSET + offset)?;
        Ok(())
    }

    fn write_pool_header(&self, header: &PoolHeader) -> Result<()> {
        let bytes: [u8; POOL_HEADER_SIZE] = header.to_bytes();
        self.file.write_all_at(&bytes, 0)?;
        Ok(())
    }

    /// Publish a fresh allocation on disk: split remainder, live header, high water.
    ///
    /// Until the live header lands, the old free header at `allocation.offset`
    /// still spans the remainder, so a crash in between leaves a valid chain.
    fn publish(&self, allocation: &Allocation, header: &mut PoolHeader, live: &ExtentHeader, high_water: u64) -> Result<()> {
        if let Some((offset, len)) = allocation.remainder {
            self.write_extent_header(offset, &ExtentHeader::free(0, len))?;
        }
        self.fail("region_store::publish")?;
        self.write_extent_header(allocation.offset, live)?;
        if allocation.grew {
            header.high_water = high_water;
            self.write_pool_header(header)?;
        }
        Ok(())
    }

    /// Allocate a new region of `capacity` bytes.
    pub fn create(&self, capacity: u64) -> Result<RegionId> {
        self.fail("region_store::create")?;

        let extent_len = extent_len_for(capacity).ok_or(Error::OutOfSpace {
            requested: capacity,
            available: 0,
        })?;

        let slot = {
            let mut guard = self.allocator.lock();
            let (allocator, header) = &mut *guard;
            let allocation = allocator.allocate(extent_len).ok_or_else(|| Error::OutOfSpace {
                requested: capacity,
                available: allocator.largest_free().saturating_sub(EXTENT_HEADER_SIZE),
            })?;

            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            let slot = RegionSlot {
                sequence,
                offset: allocation.offset,
                extent_len: allocation.len,
                capacity,
                state: Mutex::new(SlotState {
                    persisted_size: 0,
                    removed: false,
                }),
            };

            let previous_high_water = header.high_water;
            if let Err(e) = self.publish(&allocation, header, &slot.header(0), allocator.high_water()) {
                allocator.rollback(&allocation);
                header.high_water = previous_high_water;
                return Err(e);
            }
            Arc::new(slot)
        };

        let id = slot.id();
        self.regions.insert(slot.offset, slot);
        debug!(target_id = %self.target_id, region = %id, capacity, "Region created");
        Ok(id)
    }

    /// Write `data` at `offset` within a region.
    pub fn write(&self, id: &RegionId, offset: u64, data: &[u8]) -> Result<()> {
        let slot = self.lookup(id)?;
        let state = slot.state.lock();
        if state.removed {
            return Err(Error::RegionNotFound(id.clone()));
        }
        check_range(offset, data.len() as u64, slot.capacity)?;
        self.fail("region_store::write")?;

        self.file.write_all_at(data, slot.body_offset() + offset)?;
        debug!(target_id = %self.target_id, region = %id, offset, bytes = data.len(), "Region written");
        Ok(())
    }

    /// Flush `[offset, offset + size)` of a region to durable storage.
    ///
    /// Persisting is idempotent and may be repeated after further writes.
    pub fn persist(&self, id: &RegionId, offset: u64, size: u64) -> Result<()> {
        let slot = self.lookup(id)?;
        let mut state = slot.state.lock();
        if state.removed {
            return Err(Error::RegionNotFound(id.clone()));
        }
        check_range(offset, size, slot.capacity)?;
        self.fail("region_store::persist")?;

        if self.size_tracking {
            let end = offset + size;
            if end > state.persisted_size {
                self.write_extent_header(slot.offset, &slot.header(end))?;
                self.file.sync_data()?;
                state.persisted_size = end;
                debug!(target_id = %self.target_id, region = %id, persisted_size = end, "Region persisted");
                return Ok(());
            }
        }

        self.file.sync_data()?;
        debug!(target_id = %self.target_id, region = %id, offset, size, "Region persisted");
        Ok(())
    }

    /// Create a region, write `data` at offset 0 and persist it, all or nothing.
    ///
    /// If any step fails the new region is removed again before the error is
    /// returned.
    pub fn create_write_persist(&self, capacity: u64, data: &[u8]) -> Result<RegionId> {
        check_range(0, data.len() as u64, capacity)?;
        let id = self.create(capacity)?;

        let result = self
            .write(&id, 0, data)
            .and_then(|_| self.persist(&id, 0, data.len() as u64));

        if let Err(e) = result {
            warn!(
                target_id = %self.target_id,
                region = %id,
                error = %e,
                "create_write_persist failed, rolling back region"
            );
            if let Err(rollback) = self.remove(&id) {
                warn!(region = %id, error = %rollback, "Rollback of partial region failed");
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Persisted size of a region. Requires size tracking.
    pub fn get_size(&self, id: &RegionId) -> Result<u64> {
        if !self.size_tracking {
            return Err(Error::Unsupported("size tracking is disabled".into()));
        }
        let slot = self.lookup(id)?;
        let state = slot.state.lock();
        if state.removed {
            return Err(Error::RegionNotFound(id.clone()));
        }
        Ok(state.persisted_size)
    }

    /// Read exactly `size` bytes at `offset`.
    ///
    /// The range must lie within the capacity and, with size tracking, within
    /// the persisted size.
    pub fn read(&self, id: &RegionId, offset: u64, size: u64) -> Result<Vec<u8>> {
        let slot = self.lookup(id)?;
        let state = slot.state.lock();
        if state.removed {
            return Err(Error::RegionNotFound(id.clone()));
        }
        check_range(offset, size, slot.capacity)?;
        if self.size_tracking {
            check_range(offset, size, state.persisted_size)?;
        }
        self.fail("region_store::read")?;

        let len = usize::try_from(size).map_err(|_| Error::out_of_bounds(offset, size, slot.capacity))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, slot.body_offset() + offset)?;
        Ok(buf)
    }

    /// Snapshot a region's content for migration.
    pub fn export(&self, id: &RegionId) -> Result<RegionExport> {
        let slot = self.lookup(id)?;
        let state = slot.state.lock();
        if state.removed {
            return Err(Error::RegionNotFound(id.clone()));
        }
        let len = if self.size_tracking {
            state.persisted_size
        } else {
            slot.capacity
        };
        let len = usize::try_from(len).map_err(|_| Error::Internal("region too large to export".into()))?;
        let mut data = vec![0u8; len];
        self.file.read_exact_at(&mut data, slot.body_offset())?;
        Ok(RegionExport {
            capacity: slot.capacity,
            data,
        })
    }

    /// Remove a region and reclaim its space.
    ///
    /// Removing a region that is already gone fails with `NotFound`, the same
    /// as for an id that never existed.
    pub fn remove(&self, id: &RegionId) -> Result<()> {
        let slot = self.lookup(id)?;
        {
            let mut state = slot.state.lock();
            if state.removed {
                return Err(Error::RegionNotFound(id.clone()));
            }
            self.fail("region_store::remove")?;
            self.write_extent_header(slot.offset, &ExtentHeader::free(slot.sequence, slot.extent_len))?;
            state.removed = true;
        }

        self.regions
            .remove_if(&slot.offset, |_, current| current.sequence == slot.sequence);

        let mut guard = self.allocator.lock();
        let (allocator, header) = &mut *guard;
        match allocator.release(slot.offset, slot.extent_len) {
            Release::Free { offset, len } => {
                if offset != slot.offset || len != slot.extent_len {
                    self.write_extent_header(offset, &ExtentHeader::free(slot.sequence, len))?;
                }
            }
            Release::Truncated { high_water } => {
                header.high_water = high_water;
                self.write_pool_header(header)?;
            }
        }

        debug!(target_id = %self.target_id, region = %id, "Region removed");
        Ok(())
    }

    /// Flush all data and metadata of the pool.
    pub fn sync(&self) -> Result<()> {
        self.fail("region_store::sync")?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Total length of the backing pool file.
    pub fn pool_len(&self) -> u64 {
        DATA_OFFSET + self.capacity
    }

    /// Read raw pool bytes, used to stream a whole target.
    pub fn read_pool(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len as u64, self.pool_len())?;
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }
}
