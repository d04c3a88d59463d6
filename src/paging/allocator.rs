//! Page allocation management
//!
//! Tracks free/used page ranges over a bounded address space.
//! Allocation is first-fit. `unfree` is the inverse of `free` and is
//! only used during recovery to re-mark ranges allocated without
//! going through the ordinary alloc path.
//!
//! Invariant: allocated and free ranges partition `[0, limit)`.
//!
//! All operations are internally serialized; contention is expected
//! to be low relative to data operations.

use std::fmt;
use std::sync::Mutex;

use super::errors::{PagingError, PagingResult};
use super::ranges::Ranges;
use super::PageId;

/// First-fit page allocator over a bounded address space.
pub struct Allocator {
    free: Mutex<Ranges>,
    limit: u32,
}

impl Allocator {
    /// Creates an allocator with all of `[0, limit)` free.
    pub fn new(limit: u32) -> Self {
        let mut ranges = Ranges::new();
        ranges.add(0, limit);
        Self {
            free: Mutex::new(ranges),
            limit,
        }
    }

    /// Allocates `count` contiguous pages, first-fit.
    pub fn alloc(&self, count: u32) -> PagingResult<PageId> {
        let mut free = self.free.lock().unwrap();
        match free.first_fit(count) {
            Some(start) => {
                free.remove(start, count);
                Ok(start)
            }
            None => Err(PagingError::out_of_space(count)),
        }
    }

    /// Returns `[page, page + count)` to the free set.
    ///
    /// The caller guarantees the range is currently allocated.
    pub fn free(&self, page: PageId, count: u32) {
        self.free.lock().unwrap().add(page, count);
    }

    /// Re-marks `[page, page + count)` as allocated.
    ///
    /// Recovery only. The range may already be allocated (a batch
    /// replay can rediscover pages the free list never released), in
    /// which case this is a no-op for the missing portion.
    pub fn unfree(&self, page: PageId, count: u32) {
        self.free.lock().unwrap().remove(page, count);
    }

    /// Returns true when `page` is currently allocated.
    pub fn is_allocated(&self, page: PageId) -> bool {
        !self.free.lock().unwrap().contains(page)
    }

    /// The page-address-space bound.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// A copy of the current free ranges.
    pub fn free_ranges(&self) -> Ranges {
        self.free.lock().unwrap().clone()
    }

    /// Bulk-imports free ranges. Used at recovery.
    pub fn set_free_ranges(&self, ranges: &Ranges) {
        self.free.lock().unwrap().copy_from(ranges);
    }

    /// Resets to a fully free address space.
    pub fn clear(&self) {
        let mut free = self.free.lock().unwrap();
        free.clear();
        free.add(0, self.limit);
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("limit", &self.limit)
            .field("free", &*self.free.lock().unwrap())
            .finish()
    }
}
