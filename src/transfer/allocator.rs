//! Byte-range allocator for the backing data file.
//!
//! Tracks which byte ranges of the data file hold live element bytes. Free
//! ranges are kept in an offset-ordered map and coalesced on release, so the
//! allocator can always report the smallest file length that still covers
//! every used region.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("Cannot allocate a zero-sized region")]
    ZeroSized,

    #[error("Region {0} overlaps a region that is already in use")]
    Overlap(Region),

    #[error("Region {0} is not currently allocated")]
    NotAllocated(Region),
}

/// A half-open byte interval `[start, end)` in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Region {
    pub start: u64,
    pub end: u64,
}

impl Region {
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start + len,
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// First-fit allocator over a single growable file.
///
/// Everything below `end` is either used or listed in `free`. A free range
/// never touches `end`: trailing free space is folded back into the frontier,
/// which keeps `extent()` equal to the highest used end.
#[derive(Debug, Default)]
pub struct RegionAllocator {
    /// Free ranges keyed by start offset, value is the exclusive end.
    free: BTreeMap<u64, u64>,

    /// Allocation frontier.
    end: u64,

    /// Live regions keyed by start offset, value is the exclusive end.
    used: BTreeMap<u64, u64>,

    /// Bytes currently handed out.
    used_bytes: u64,
}

impl RegionAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a region of exactly `size` bytes.
    pub fn allocate(&mut self, size: u64) -> Result<Region, AllocatorError> {
        if size == 0 {
            return Err(AllocatorError::ZeroSized);
        }

        let fit = self
            .free
            .iter()
            .find(|&(&start, &end)| end - start >= size)
            .map(|(&start, &end)| (start, end));

        let region = match fit {
            Some((start, end)) => {
                self.free.remove(&start);
                if end - start > size {
                    self.free.insert(start + size, end);
                }
                Region::new(start, size)
            }
            None => {
                let region = Region::new(self.end, size);
                self.end = region.end;
                region
            }
        };

        self.used.insert(region.start, region.end);
        self.used_bytes += size;
        debug!(start = region.start, size, "Allocated region");
        Ok(region)
    }

    /// Return a region to the free pool, coalescing with its neighbours.
    ///
    /// `region` must be exactly one that was handed out by `allocate` or
    /// `mark_used`; partial or merged ranges are rejected.
    pub fn free(&mut self, region: Region) -> Result<(), AllocatorError> {
        if self.used.get(&region.start) != Some(&region.end) {
            return Err(AllocatorError::NotAllocated(region));
        }
        self.used.remove(&region.start);

        let mut start = region.start;
        let mut end = region.end;

        if let Some((&prev_start, &prev_end)) = self.free.range(..start).next_back() {
            if prev_end == start {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(&next_end) = self.free.get(&end) {
            self.free.remove(&end);
            end = next_end;
        }

        if end == self.end {
            self.end = start;
        } else {
            self.free.insert(start, end);
        }

        self.used_bytes -= region.len();
        debug!(start = region.start, size = region.len(), "Freed region");
        Ok(())
    }

    /// Mark a known region as used without searching for space.
    ///
    /// Used when rebuilding state from a persisted index: the region must lie
    /// entirely in free space or beyond the current frontier.
    pub fn mark_used(&mut self, region: Region) -> Result<(), AllocatorError> {
        if region.is_empty() {
            return Err(AllocatorError::ZeroSized);
        }

        if region.start >= self.end {
            if region.start > self.end {
                self.free.insert(self.end, region.start);
            }
            self.end = region.end;
        } else {
            let (free_start, free_end) = self
                .free
                .range(..=region.start)
                .next_back()
                .map(|(&s, &e)| (s, e))
                .filter(|&(_, e)| e >= region.end)
                .ok_or(AllocatorError::Overlap(region))?;

            self.free.remove(&free_start);
            if free_start < region.start {
                self.free.insert(free_start, region.start);
            }
            if region.end < free_end {
                self.free.insert(region.end, free_end);
            }
        }

        self.used.insert(region.start, region.end);
        self.used_bytes += region.len();
        Ok(())
    }

    /// Minimal file length covering every used region.
    pub fn extent(&self) -> u64 {
        self.end
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    /// Free bytes below the frontier (fragmentation).
    pub fn free_bytes(&self) -> u64 {
        self.end - self.used_bytes
    }

    pub fn used_regions(&self) -> usize {
        self.used.len()
    }

    /// Forget every region.
    pub fn clear(&mut self) {
        self.free.clear();
        self.used.clear();
        self.end = 0;
        self.used_bytes = 0;
    }
}
