//! Committed transaction records
//!
//! A `Commit` aggregates the page updates of one or more committed
//! transactions into a single revision-stamped unit. Consecutive
//! transactions that commit while the same batch is open are merged
//! into one commit; `head` advances with each merge while `base`
//! stays at the first merged revision.
//!
//! Merging collapses redundant work: an allocation followed by a free
//! cancels out entirely, a re-staged raw write frees the obsolete
//! shadow, and a newer deferred put simply replaces the older value
//! before either is ever encoded.

use std::collections::HashMap;

use crate::paging::{Allocator, PageId, PagingError, PagingResult};

use super::update::Update;

/// The updates of one or more consecutive committed transactions.
#[derive(Debug, Default)]
pub struct Commit {
    /// First revision merged into this commit.
    base: i64,
    /// Last revision merged into this commit.
    head: i64,
    updates: HashMap<PageId, Update>,
    /// Open snapshots anchored at this commit. Guarded by the chain
    /// lock of the owning batch chain.
    snapshot_refs: usize,
}

impl Commit {
    pub fn new(revision: i64, updates: HashMap<PageId, Update>) -> Self {
        Self {
            base: revision,
            head: revision,
            updates,
            snapshot_refs: 0,
        }
    }

    pub fn base(&self) -> i64 {
        self.base
    }

    pub fn head(&self) -> i64 {
        self.head
    }

    pub fn updates(&self) -> &HashMap<PageId, Update> {
        &self.updates
    }

    pub fn updates_mut(&mut self) -> &mut HashMap<PageId, Update> {
        &mut self.updates
    }

    pub fn update_for(&self, page: PageId) -> Option<&Update> {
        self.updates.get(&page)
    }

    pub fn snapshot_refs(&self) -> usize {
        self.snapshot_refs
    }

    pub fn add_snapshot_ref(&mut self) {
        self.snapshot_refs += 1;
    }

    pub fn drop_snapshot_ref(&mut self) {
        debug_assert!(self.snapshot_refs > 0);
        self.snapshot_refs -= 1;
    }

    /// Fails with an optimistic conflict if any page in `pages` was
    /// updated by this commit.
    pub fn conflict_check<'a>(
        &self,
        pages: impl IntoIterator<Item = &'a PageId>,
    ) -> PagingResult<()> {
        for page in pages {
            if self.updates.contains_key(page) {
                return Err(PagingError::optimistic_conflict(*page));
            }
        }
        Ok(())
    }

    /// Merges the updates of the transaction committed at `revision`
    /// into this commit.
    pub fn merge(
        &mut self,
        allocator: &Allocator,
        revision: i64,
        updates: HashMap<PageId, Update>,
    ) -> PagingResult<()> {
        debug_assert_eq!(revision, self.head + 1);
        self.head = revision;
        for (page, update) in updates {
            self.merge_update(allocator, page, update)?;
        }
        Ok(())
    }

    fn merge_update(
        &mut self,
        allocator: &Allocator,
        page: PageId,
        mut update: Update,
    ) -> PagingResult<()> {
        let previous = match self.updates.get(&page) {
            Some(p) => p,
            None => {
                self.updates.insert(page, update);
                return Ok(());
            }
        };

        if update.is_freed() {
            if previous.is_freed() {
                return Err(PagingError::illegal_state(format!(
                    "page {page} freed twice in one commit window"
                )));
            }
            if previous.is_allocated() {
                // Allocation followed by a free cancels out.
                self.updates.remove(&page);
                allocator.free(page, 1);
                return Ok(());
            }
            if let Some(shadow) = previous.shadow() {
                // Obsolete staging page.
                allocator.free(shadow, 1);
            }
            self.updates.insert(page, update);
        } else if update.is_allocated() && !update.is_shadowed() && update.deferred().is_none() {
            if !previous.is_freed() {
                return Err(PagingError::illegal_state(format!(
                    "allocation of page {page} can only follow a free"
                )));
            }
            // Free followed by a reallocation: the page stays live and
            // the new owner writes fresh content.
            self.updates.insert(page, update);
        } else if update.is_shadowed() {
            if previous.is_freed() {
                return Err(PagingError::illegal_state(format!(
                    "write to freed page {page}"
                )));
            }
            if previous.is_allocated() {
                update.mark_allocated();
            }
            if let Some(shadow) = previous.shadow() {
                allocator.free(shadow, 1);
            }
            self.updates.insert(page, update);
        } else if update.deferred().is_some() {
            if previous.is_freed() {
                return Err(PagingError::illegal_state(format!(
                    "update of freed page {page}"
                )));
            }
            if previous.is_shadowed() && previous.deferred().is_none() {
                return Err(PagingError::illegal_state(format!(
                    "deferred update of page {page} may not follow a raw write"
                )));
            }
            if previous.is_allocated() {
                update.mark_allocated();
            }
            // A newer deferred value replaces the older one before
            // either is encoded.
            self.updates.insert(page, update);
        } else {
            return Err(PagingError::illegal_state(format!(
                "unexpected update state for page {page}"
            )));
        }
        Ok(())
    }

    /// Sanity check run before a batch is stored: no update may key a
    /// page that another update uses as its shadow.
    pub fn still_sane(&self) -> PagingResult<()> {
        for update in self.updates.values() {
            if let Some(shadow) = update.shadow() {
                if self.updates.contains_key(&shadow) {
                    return Err(PagingError::illegal_state(format!(
                        "shadow page {shadow} is itself updated in the same commit"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Encodes base, head and the persistent part of each update.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.base.to_le_bytes());
        buf.extend_from_slice(&self.head.to_le_bytes());
        buf.extend_from_slice(&(self.updates.len() as u32).to_le_bytes());
        // Sorted for a deterministic record.
        let mut pages: Vec<_> = self.updates.keys().copied().collect();
        pages.sort_unstable();
        for page in pages {
            buf.extend_from_slice(&page.to_le_bytes());
            self.updates[&page].encode_into(buf);
        }
    }

    pub fn decode(data: &[u8]) -> PagingResult<(Self, usize)> {
        if data.len() < 20 {
            return Err(PagingError::data_corruption("commit record too short"));
        }
        let base = i64::from_le_bytes(data[0..8].try_into().unwrap());
        let head = i64::from_le_bytes(data[8..16].try_into().unwrap());
        let count = u32::from_le_bytes(data[16..20].try_into().unwrap()) as usize;
        let mut offset = 20;
        let mut updates = HashMap::with_capacity(count);
        for _ in 0..count {
            if data.len() < offset + 4 {
                return Err(PagingError::data_corruption("commit record truncated"));
            }
            let page = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
            offset += 4;
            let (update, used) = Update::decode(&data[offset..])?;
            offset += used;
            updates.insert(page, update);
        }
        Ok((
            Self {
                base,
                head,
                updates,
                snapshot_refs: 0,
            },
            offset,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(page: PageId, update: Update) -> HashMap<PageId, Update> {
        let mut m = HashMap::new();
        m.insert(page, update);
        m
    }

    #[test]
    fn test_alloc_then_free_cancels() {
        let allocator = Allocator::new(100);
        let page = allocator.alloc(1).unwrap();
        let mut commit = Commit::new(0, one(page, Update::allocated()));
        commit
            .merge(&allocator, 1, one(page, Update::freed()))
            .unwrap();
        assert!(commit.updates().is_empty());
        assert!(!allocator.is_allocated(page));
        assert_eq!(commit.head(), 1);
        assert_eq!(commit.base(), 0);
    }

    #[test]
    fn test_free_of_shadowed_page_releases_shadow() {
        let allocator = Allocator::new(100);
        let shadow = allocator.alloc(1).unwrap();
        let mut commit = Commit::new(0, one(7, Update::shadowed(shadow)));
        commit.merge(&allocator, 1, one(7, Update::freed())).unwrap();
        assert!(!allocator.is_allocated(shadow));
        assert!(commit.update_for(7).unwrap().is_freed());
    }

    #[test]
    fn test_double_free_is_illegal() {
        let allocator = Allocator::new(100);
        let mut commit = Commit::new(0, one(7, Update::freed()));
        let err = commit
            .merge(&allocator, 1, one(7, Update::freed()))
            .unwrap_err();
        assert_eq!(err.code().code(), "PAGE_ILLEGAL_STATE");
    }

    #[test]
    fn test_restaged_write_frees_old_shadow() {
        let allocator = Allocator::new(100);
        let old = allocator.alloc(1).unwrap();
        let new = allocator.alloc(1).unwrap();
        let mut commit = Commit::new(0, one(7, Update::shadowed(old)));
        commit
            .merge(&allocator, 1, one(7, Update::shadowed(new)))
            .unwrap();
        assert!(!allocator.is_allocated(old));
        assert!(allocator.is_allocated(new));
        assert_eq!(commit.update_for(7).unwrap().shadow(), Some(new));
    }

    #[test]
    fn test_write_after_alloc_keeps_allocated_flag() {
        let allocator = Allocator::new(100);
        let shadow = allocator.alloc(1).unwrap();
        let mut commit = Commit::new(0, one(3, Update::allocated()));
        commit
            .merge(&allocator, 1, one(3, Update::shadowed(shadow)))
            .unwrap();
        let merged = commit.update_for(3).unwrap();
        assert!(merged.is_allocated());
        assert_eq!(merged.shadow(), Some(shadow));
    }

    #[test]
    fn test_write_to_freed_page_is_illegal() {
        let allocator = Allocator::new(100);
        let mut commit = Commit::new(0, one(3, Update::freed()));
        let err = commit
            .merge(&allocator, 1, one(3, Update::shadowed(9)))
            .unwrap_err();
        assert_eq!(err.code().code(), "PAGE_ILLEGAL_STATE");
    }

    #[test]
    fn test_conflict_check_flags_overlap() {
        let commit = Commit::new(0, one(5, Update::freed()));
        assert!(commit.conflict_check([4, 6].iter()).is_ok());
        let err = commit.conflict_check([5].iter()).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_still_sane_rejects_updated_shadow() {
        let mut updates = one(3, Update::shadowed(9));
        updates.insert(9, Update::freed());
        let commit = Commit::new(0, updates);
        assert!(commit.still_sane().is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut updates = one(3, Update::shadowed(9));
        updates.insert(4, Update::allocated());
        updates.insert(5, Update::freed());
        let mut commit = Commit::new(7, updates);
        commit.head = 9;

        let mut buf = Vec::new();
        commit.encode_into(&mut buf);
        let (decoded, used) = Commit::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded.base(), 7);
        assert_eq!(decoded.head(), 9);
        assert_eq!(decoded.updates().len(), 3);
        assert_eq!(decoded.update_for(3).unwrap().shadow(), Some(9));
        assert!(decoded.update_for(4).unwrap().is_allocated());
        assert!(decoded.update_for(5).unwrap().is_freed());
    }
}
