//! First-fit extent allocator for a pool's data area.
//!
//! Offsets are relative to the start of the data area. Space in
//! `[0, high_water)` is tiled by extents; everything beyond `high_water` up to
//! `capacity` is untouched.

use crate::store::format::EXTENT_HEADER_SIZE;
use std::collections::BTreeMap;

/// Result of a successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Offset of the new extent.
    pub offset: u64,
    /// Length of the new extent (may exceed the request when a free extent
    /// was too small to split).
    pub len: u64,
    /// Free extent split off behind the allocation, if any.
    pub remainder: Option<(u64, u64)>,
    /// Whether the allocation moved the high-water mark.
    pub grew: bool,
}

/// Outcome of releasing an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The released space is now this free extent (possibly merged with neighbours).
    Free { offset: u64, len: u64 },
    /// The released space touched the high-water mark, which moved back.
    Truncated { high_water: u64 },
}

/// Free-space bookkeeping.
#[derive(Debug)]
pub struct Allocator {
    capacity: u64,
    high_water: u64,
    free: BTreeMap<u64, u64>,
}

impl Allocator {
    /// Create an allocator over `capacity` bytes with `high_water` already used.
    pub fn new(capacity: u64, high_water: u64) -> Self {
        Self {
            capacity,
            high_water: high_water.min(capacity),
            free: BTreeMap::new(),
        }
    }

    /// Current high-water mark.
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Total bytes not covered by live extents.
    pub fn free_bytes(&self) -> u64 {
        let in_table: u64 = self.free.values().sum();
        self.capacity - self.high_water + in_table
    }

    /// Largest extent that could currently be allocated.
    pub fn largest_free(&self) -> u64 {
        let tail = self.capacity - self.high_water;
        self.free.values().copied().max().unwrap_or(0).max(tail)
    }

    /// Record a free extent discovered while scanning a pool.
    pub fn insert_free(&mut self, offset: u64, len: u64) {
        self.free.insert(offset, len);
    }

    /// Allocate an extent of exactly `len` bytes (already aligned).
    pub fn allocate(&mut self, len: u64) -> Option<Allocation> {
        let found = self
            .free
            .iter()
            .find(|(_, free_len)| **free_len >= len)
            .map(|(offset, free_len)| (*offset, *free_len));

        if let Some((offset, free_len)) = found {
            self.free.remove(&offset);
            let rest = free_len - len;
            if rest >= EXTENT_HEADER_SIZE {
                let remainder = (offset + len, rest);
                self.free.insert(remainder.0, remainder.1);
                return Some(Allocation {
                    offset,
                    len,
                    remainder: Some(remainder),
                    grew: false,
                });
            }
            return Some(Allocation {
                offset,
                len: free_len,
                remainder: None,
                grew: false,
            });
        }

        let end = self.high_water.checked_add(len)?;
        if end > self.capacity {
            return None;
        }
        let offset = self.high_water;
        self.high_water = end;
        Some(Allocation {
            offset,
            len,
            remainder: None,
            grew: true,
        })
    }

    /// Undo an allocation that was never published.
    pub fn rollback(&mut self, allocation: &Allocation) {
        if let Some((offset, _)) = allocation.remainder {
            self.free.remove(&offset);
        }
        let len = allocation.len + allocation.remainder.map_or(0, |(_, l)| l);
        if allocation.grew {
            self.high_water -= len;
        } else {
            self.free.insert(allocation.offset, len);
        }
    }

    /// Release an extent, merging it with adjacent free extents.
    pub fn release(&mut self, offset: u64, len: u64) -> Release {
        let mut start = offset;
        let mut end = offset + len;

        // Merge with the free extent immediately before.
        if let Some((&prev_off, &prev_len)) = self.free.range(..start).next_back() {
            if prev_off + prev_len == start {
                self.free.remove(&prev_off);
                start = prev_off;
            }
        }

        // Merge with the free extent immediately after.
        if let Some(&next_len) = self.free.get(&end) {
            self.free.remove(&end);
            end += next_len;
        }

        if end == self.high_water {
            self.high_water = start;
            return Release::Truncated {
                high_water: self.high_water,
            };
        }

        self.free.insert(start, end - start);
        Release::Free {
            offset: start,
            len: end - start,
        }
    }
}
