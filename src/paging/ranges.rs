//! Page-id range sets
//!
//! `Ranges` is the representation of the free page list: an ordered
//! set of disjoint, coalesced `[start, end)` ranges. The allocator
//! scans it first-fit, and the persisted free list is an encoded copy
//! of it.
//!
//! Encoded form (little-endian): range count (u32), then one
//! (start: u32, end: u32) pair per range, then a trailing CRC32 over
//! everything before it.

use std::collections::BTreeMap;
use std::fmt;

use super::checksum::{compute_checksum, verify_checksum};
use super::errors::{PagingError, PagingResult};
use super::PageId;

/// An ordered set of disjoint `[start, end)` page-id ranges.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Ranges {
    /// start -> end (exclusive); invariant: disjoint and coalesced.
    ranges: BTreeMap<PageId, PageId>,
}

impl Ranges {
    /// Creates an empty range set.
    pub fn new() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }

    /// Adds `[start, start + count)`, coalescing with overlapping or
    /// adjacent ranges.
    pub fn add(&mut self, start: PageId, count: u32) {
        if count == 0 {
            return;
        }
        let mut new_start = start;
        let mut new_end = start + count;

        // Absorb the predecessor if it touches the new range.
        if let Some((&prev_start, &prev_end)) = self.ranges.range(..=start).next_back() {
            if prev_end >= new_start {
                new_start = prev_start;
                new_end = new_end.max(prev_end);
                self.ranges.remove(&prev_start);
            }
        }

        // Absorb successors swallowed or touched by the new range.
        let followers: Vec<(PageId, PageId)> = self
            .ranges
            .range(new_start..=new_end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in followers {
            new_end = new_end.max(e);
            self.ranges.remove(&s);
        }

        self.ranges.insert(new_start, new_end);
    }

    /// Removes `[start, start + count)`. Portions that are not present
    /// are ignored; a removal in the middle of a range splits it.
    pub fn remove(&mut self, start: PageId, count: u32) {
        if count == 0 {
            return;
        }
        let remove_end = start + count;

        let overlapping: Vec<(PageId, PageId)> = self
            .ranges
            .range(..remove_end)
            .filter(|&(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect();

        for (s, e) in overlapping {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start);
            }
            if e > remove_end {
                self.ranges.insert(remove_end, e);
            }
        }
    }

    /// Returns true when `page` is inside one of the ranges.
    pub fn contains(&self, page: PageId) -> bool {
        self.ranges
            .range(..=page)
            .next_back()
            .map(|(_, &end)| page < end)
            .unwrap_or(false)
    }

    /// Returns true when the whole `[start, start + count)` range is present.
    pub fn contains_range(&self, start: PageId, count: u32) -> bool {
        self.ranges
            .range(..=start)
            .next_back()
            .map(|(_, &end)| start + count <= end)
            .unwrap_or(false)
    }

    /// Total number of pages across all ranges.
    pub fn size(&self) -> u64 {
        self.ranges.iter().map(|(&s, &e)| u64::from(e - s)).sum()
    }

    /// Returns true when no pages are present.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterates `(start, end)` pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (PageId, PageId)> + '_ {
        self.ranges.iter().map(|(&s, &e)| (s, e))
    }

    /// Start of the first range with at least `count` pages, if any.
    pub fn first_fit(&self, count: u32) -> Option<PageId> {
        self.ranges
            .iter()
            .find(|(&s, &e)| e - s >= count)
            .map(|(&s, _)| s)
    }

    /// Replaces the contents of this set with a copy of `other`.
    pub fn copy_from(&mut self, other: &Ranges) {
        self.ranges = other.ranges.clone();
    }

    /// Removes all ranges.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Encodes the range set with a trailing CRC32.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.ranges.len() * 8 + 4);
        buf.extend_from_slice(&(self.ranges.len() as u32).to_le_bytes());
        for (&start, &end) in &self.ranges {
            buf.extend_from_slice(&start.to_le_bytes());
            buf.extend_from_slice(&end.to_le_bytes());
        }
        let checksum = compute_checksum(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Decodes an encoded range set, verifying its checksum.
    pub fn decode(data: &[u8]) -> PagingResult<Self> {
        if data.len() < 8 {
            return Err(PagingError::data_corruption("free list record too short"));
        }
        let payload_len = data.len() - 4;
        let expected = u32::from_le_bytes([
            data[payload_len],
            data[payload_len + 1],
            data[payload_len + 2],
            data[payload_len + 3],
        ]);
        if !verify_checksum(&data[..payload_len], expected) {
            return Err(PagingError::data_corruption(
                "free list record checksum mismatch",
            ));
        }

        let count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if payload_len != 4 + count * 8 {
            return Err(PagingError::data_corruption(
                "free list record length mismatch",
            ));
        }

        let mut ranges = Ranges::new();
        let mut offset = 4;
        for _ in 0..count {
            let start = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]);
            let end = u32::from_le_bytes([
                data[offset + 4],
                data[offset + 5],
                data[offset + 6],
                data[offset + 7],
            ]);
            if end <= start {
                return Err(PagingError::data_corruption("free list range inverted"));
            }
            ranges.add(start, end - start);
            offset += 8;
        }
        Ok(ranges)
    }
}

impl fmt::Debug for Ranges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.ranges.iter().map(|(&s, &e)| s..e))
            .finish()
    }
}
