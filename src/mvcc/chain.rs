//! The batch chain
//!
//! An ordered sequence of batches, oldest first, ending in the single
//! open batch that accepts new commits. Batches get stable sequence
//! numbers when created; a batch is looked up by subtracting the
//! front's sequence, so releases from the front never invalidate a
//! snapshot's anchor.
//!
//! The chain itself is not synchronized. [`super::super::store`]
//! wraps it in the chain mutex and holds that lock across every call
//! here, including snapshot reads and batch performs.

use std::collections::{HashMap, VecDeque};

use crate::paging::{Allocator, PageId, PagingResult};

use super::batch::{Batch, BatchState};
use super::commit::Commit;
use super::snapshot::{Resolved, Snapshot, SnapshotAnchor};
use super::update::Update;

pub struct BatchChain {
    /// Oldest first; the back is always the open batch.
    batches: VecDeque<Batch>,
    next_seq: u64,
}

impl BatchChain {
    /// A fresh chain at head revision `head` (-1 for an empty store).
    pub fn new(head: i64) -> Self {
        let mut batches = VecDeque::new();
        batches.push_back(Batch::new(0, head));
        Self {
            batches,
            next_seq: 1,
        }
    }

    /// Rebuilds the chain from batches recovered off disk, oldest
    /// first, and opens a fresh batch after them. `base` is the
    /// durable base revision; it carries the head when every batch
    /// was already performed and released before the shutdown.
    pub fn from_recovered(base: i64, recovered: Vec<Batch>) -> Self {
        let mut batches: VecDeque<Batch> = VecDeque::new();
        let mut next_seq = 0;
        let mut head = base;
        for mut batch in recovered {
            debug_assert_eq!(batch.seq(), next_seq);
            head = batch.head();
            batch.set_state(BatchState::Stored);
            next_seq += 1;
            batches.push_back(batch);
        }
        batches.push_back(Batch::new(next_seq, head));
        Self {
            batches,
            next_seq: next_seq + 1,
        }
    }

    pub fn open_batch(&self) -> &Batch {
        self.batches.back().expect("chain always has an open batch")
    }

    pub fn open_batch_mut(&mut self) -> &mut Batch {
        self.batches
            .back_mut()
            .expect("chain always has an open batch")
    }

    /// Latest committed revision, -1 when nothing has committed.
    pub fn head_revision(&self) -> i64 {
        self.open_batch().head()
    }

    pub fn get(&self, seq: u64) -> Option<&Batch> {
        let front = self.batches.front()?.seq();
        self.batches.get((seq.checked_sub(front)?) as usize)
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut Batch> {
        let front = self.batches.front()?.seq();
        self.batches.get_mut((seq.checked_sub(front)?) as usize)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Batch> {
        self.batches.iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut Batch> {
        self.batches.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Merges the updates of a committing transaction, assigning the
    /// next revision. Updates join the open batch's last commit unless
    /// a snapshot is anchored at it, in which case a fresh commit is
    /// appended so the anchored view stays frozen.
    pub fn commit(
        &mut self,
        allocator: &Allocator,
        updates: HashMap<PageId, Update>,
    ) -> PagingResult<i64> {
        let revision = self.head_revision() + 1;
        let open = self.open_batch_mut();
        match open.commits_mut().last_mut() {
            Some(last) if last.snapshot_refs() == 0 => {
                last.merge(allocator, revision, updates)?;
            }
            _ => {
                open.commits_mut().push(Commit::new(revision, updates));
            }
        }
        open.set_head(revision);
        Ok(revision)
    }

    /// Fails with an optimistic conflict if any commit after the
    /// snapshot's anchor updated one of `pages`.
    pub fn conflict_check(&self, snapshot: &Snapshot, pages: &[PageId]) -> PagingResult<()> {
        let anchor = snapshot.anchor;
        for batch in &self.batches {
            if batch.seq() < anchor.batch_seq {
                continue;
            }
            let skip = if batch.seq() == anchor.batch_seq {
                anchor.commit_index.map(|i| i + 1).unwrap_or(0)
            } else {
                0
            };
            for commit in &batch.commits()[skip..] {
                commit.conflict_check(pages.iter())?;
            }
        }
        Ok(())
    }

    /// Walks commits visible to the snapshot, newest first, yielding
    /// the first update found for `page`. Stops at performed batches,
    /// whose updates are already at true locations.
    fn visible_update(&self, anchor: SnapshotAnchor, page: PageId) -> Option<&Update> {
        let commit_index = anchor.commit_index?;
        let front = self.batches.front()?.seq();
        let mut batch_idx = (anchor.batch_seq - front) as usize;
        let mut commit_end = commit_index + 1;
        loop {
            let batch = &self.batches[batch_idx];
            if batch.state() != BatchState::Performed {
                for commit in batch.commits()[..commit_end].iter().rev() {
                    if let Some(update) = commit.update_for(page) {
                        return Some(update);
                    }
                }
            }
            if batch_idx == 0 {
                return None;
            }
            batch_idx -= 1;
            commit_end = self.batches[batch_idx].commits().len();
        }
    }

    /// Maps `page` to the location holding the bytes the snapshot
    /// should read.
    pub fn translate(&self, snapshot: &Snapshot, page: PageId) -> PageId {
        match self.visible_update(snapshot.anchor, page) {
            Some(update) => update.translate(page),
            None => page,
        }
    }

    /// Resolves an object read of `page` against the chain.
    pub fn resolve(&self, snapshot: &Snapshot, page: PageId) -> Resolved {
        match self.visible_update(snapshot.anchor, page) {
            Some(update) if update.is_freed() => Resolved::Freed,
            Some(update) => match update.deferred() {
                Some(deferred) => Resolved::Deferred(deferred.clone()),
                None => Resolved::Location(update.translate(page)),
            },
            None => Resolved::Unresolved,
        }
    }

    /// Opens a snapshot anchored at the newest commit, pinning every
    /// batch from the oldest not-yet-performed one through the open
    /// batch. A stored batch the snapshot can still resolve through
    /// must not perform underneath it: performing frees the staged
    /// shadow pages the snapshot's translations point at.
    pub fn open_snapshot(&mut self) -> Snapshot {
        let open_seq = self.open_batch().seq();
        let anchor = self
            .batches
            .iter()
            .rev()
            .find(|b| !b.is_empty())
            .map(|b| SnapshotAnchor {
                batch_seq: b.seq(),
                commit_index: Some(b.commits().len() - 1),
                head_revision: b.head(),
            })
            .unwrap_or(SnapshotAnchor {
                batch_seq: open_seq,
                commit_index: None,
                head_revision: self.head_revision(),
            });

        let pinned_from = self
            .batches
            .iter()
            .find(|b| b.state() != BatchState::Performed)
            .map(|b| b.seq())
            .unwrap_or(open_seq)
            .min(anchor.batch_seq);
        for batch in self.batches.iter_mut() {
            if batch.seq() >= pinned_from {
                batch.pin();
            }
        }
        if let Some(index) = anchor.commit_index {
            let batch = self.get_mut(anchor.batch_seq).expect("anchor batch");
            batch.commits_mut()[index].add_snapshot_ref();
        }
        Snapshot {
            anchor,
            pinned_from,
            pinned_to: open_seq,
        }
    }

    /// Releases a snapshot's pins. The pinned batches are still in the
    /// chain: releases only happen from the front, and pinned batches
    /// cannot be released.
    pub fn close_snapshot(&mut self, snapshot: Snapshot) {
        if let Some(index) = snapshot.anchor.commit_index {
            let batch = self
                .get_mut(snapshot.anchor.batch_seq)
                .expect("anchor batch outlives its snapshot");
            batch.commits_mut()[index].drop_snapshot_ref();
        }
        for seq in snapshot.pinned_from..=snapshot.pinned_to {
            self.get_mut(seq)
                .expect("pinned batch outlives its snapshot")
                .unpin();
        }
    }

    /// Seals the open batch for storing and opens a new one. Returns
    /// the sealed batch's sequence, or `None` if there was nothing to
    /// seal.
    pub fn seal_open_batch(&mut self) -> Option<u64> {
        if self.open_batch().is_empty() {
            return None;
        }
        let head = self.head_revision();
        let sealed = self.open_batch_mut();
        sealed.set_state(BatchState::Storing);
        let sealed_seq = sealed.seq();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.batches.push_back(Batch::new(seq, head));
        Some(sealed_seq)
    }

    /// Sequences of batches waiting to be written out, oldest first.
    pub fn storing_batches(&self) -> Vec<u64> {
        self.batches
            .iter()
            .filter(|b| b.state() == BatchState::Storing)
            .map(|b| b.seq())
            .collect()
    }

    /// The next batch that is durable, unpinned and ready to have its
    /// updates applied. Performing is strictly front-to-back.
    pub fn next_performable(&self) -> Option<u64> {
        for batch in &self.batches {
            match batch.state() {
                BatchState::Performed => continue,
                BatchState::Stored if batch.snapshots() == 0 => return Some(batch.seq()),
                _ => return None,
            }
        }
        None
    }

    /// Pops performed, unpinned batches off the front. The open batch
    /// is never released.
    pub fn release_performed(&mut self) -> Vec<Batch> {
        let mut released = Vec::new();
        while self.batches.len() > 1 {
            let front = self.batches.front().expect("non-empty");
            if front.state() == BatchState::Performed && front.snapshots() == 0 {
                released.push(self.batches.pop_front().expect("non-empty"));
            } else {
                break;
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::update::PageCodec;
    use crate::paging::{PageIo, PagingResult};
    use std::sync::Arc;

    struct StrCodec;

    impl PageCodec for StrCodec {
        type Value = String;

        fn store(
            &self,
            _io: &mut dyn PageIo,
            _page: PageId,
            _value: &String,
        ) -> PagingResult<Vec<PageId>> {
            Ok(Vec::new())
        }

        fn load(&self, _io: &mut dyn PageIo, _page: PageId) -> PagingResult<String> {
            Ok(String::new())
        }

        fn linked_pages(&self, _io: &mut dyn PageIo, _page: PageId) -> PagingResult<Vec<PageId>> {
            Ok(Vec::new())
        }
    }

    fn put(page: PageId, value: &str) -> HashMap<PageId, Update> {
        let codec = Arc::new(StrCodec);
        let mut update = Update::new();
        update.defer_put(&codec, Arc::new(value.to_string()));
        let mut m = HashMap::new();
        m.insert(page, update);
        m
    }

    fn value_of(resolved: Resolved) -> Option<String> {
        match resolved {
            Resolved::Deferred(d) => d
                .value
                .as_ref()
                .and_then(|v| v.downcast_ref::<String>())
                .cloned(),
            _ => None,
        }
    }

    #[test]
    fn test_revisions_are_consecutive() {
        let allocator = Allocator::new(100);
        let mut chain = BatchChain::new(-1);
        assert_eq!(chain.commit(&allocator, put(1, "a")).unwrap(), 0);
        assert_eq!(chain.commit(&allocator, put(2, "b")).unwrap(), 1);
        assert_eq!(chain.head_revision(), 1);
    }

    #[test]
    fn test_consecutive_commits_merge_into_one_commit() {
        let allocator = Allocator::new(100);
        let mut chain = BatchChain::new(-1);
        chain.commit(&allocator, put(1, "a")).unwrap();
        chain.commit(&allocator, put(2, "b")).unwrap();
        assert_eq!(chain.open_batch().commits().len(), 1);
    }

    #[test]
    fn test_anchored_commit_is_not_merged_into() {
        let allocator = Allocator::new(100);
        let mut chain = BatchChain::new(-1);
        chain.commit(&allocator, put(1, "a")).unwrap();
        let snapshot = chain.open_snapshot();
        chain.commit(&allocator, put(2, "b")).unwrap();
        assert_eq!(chain.open_batch().commits().len(), 2);
        // The anchored view does not see the later commit.
        assert!(matches!(chain.resolve(&snapshot, 2), Resolved::Unresolved));
        chain.close_snapshot(snapshot);
    }

    #[test]
    fn test_snapshot_sees_committed_value() {
        let allocator = Allocator::new(100);
        let mut chain = BatchChain::new(-1);
        chain.commit(&allocator, put(1, "hello")).unwrap();
        let snapshot = chain.open_snapshot();
        chain.commit(&allocator, put(1, "changed")).unwrap();
        assert_eq!(
            value_of(chain.resolve(&snapshot, 1)).unwrap(),
            "hello".to_string()
        );
        chain.close_snapshot(snapshot);
        let fresh = chain.open_snapshot();
        assert_eq!(
            value_of(chain.resolve(&fresh, 1)).unwrap(),
            "changed".to_string()
        );
        chain.close_snapshot(fresh);
    }

    #[test]
    fn test_empty_chain_snapshot_resolves_nothing() {
        let mut chain = BatchChain::new(-1);
        let snapshot = chain.open_snapshot();
        assert_eq!(snapshot.anchor().commit_index, None);
        assert!(matches!(chain.resolve(&snapshot, 0), Resolved::Unresolved));
        assert_eq!(chain.translate(&snapshot, 5), 5);
        chain.close_snapshot(snapshot);
    }

    #[test]
    fn test_translate_follows_shadow() {
        let allocator = Allocator::new(100);
        let mut chain = BatchChain::new(-1);
        let mut updates = HashMap::new();
        updates.insert(4u32, Update::shadowed(20));
        chain.commit(&allocator, updates).unwrap();
        let snapshot = chain.open_snapshot();
        assert_eq!(chain.translate(&snapshot, 4), 20);
        assert_eq!(chain.translate(&snapshot, 5), 5);
        chain.close_snapshot(snapshot);
    }

    #[test]
    fn test_conflict_check_after_anchor() {
        let allocator = Allocator::new(100);
        let mut chain = BatchChain::new(-1);
        chain.commit(&allocator, put(1, "a")).unwrap();
        let snapshot = chain.open_snapshot();
        chain.commit(&allocator, put(5, "b")).unwrap();
        assert!(chain.conflict_check(&snapshot, &[1]).is_ok());
        let err = chain.conflict_check(&snapshot, &[5]).unwrap_err();
        assert!(err.is_conflict());
        chain.close_snapshot(snapshot);
    }

    #[test]
    fn test_seal_and_perform_ordering() {
        let allocator = Allocator::new(100);
        let mut chain = BatchChain::new(-1);
        assert_eq!(chain.seal_open_batch(), None);
        chain.commit(&allocator, put(1, "a")).unwrap();
        let sealed = chain.seal_open_batch().unwrap();
        assert_eq!(chain.storing_batches(), vec![sealed]);
        // Not performable until stored.
        assert_eq!(chain.next_performable(), None);
        chain.get_mut(sealed).unwrap().set_state(BatchState::Stored);
        assert_eq!(chain.next_performable(), Some(sealed));
    }

    #[test]
    fn test_pinned_batch_is_not_performable_or_released() {
        let allocator = Allocator::new(100);
        let mut chain = BatchChain::new(-1);
        chain.commit(&allocator, put(1, "a")).unwrap();
        let snapshot = chain.open_snapshot();
        let sealed = chain.seal_open_batch().unwrap();
        chain.get_mut(sealed).unwrap().set_state(BatchState::Stored);
        assert_eq!(chain.next_performable(), None);
        chain.close_snapshot(snapshot);
        assert_eq!(chain.next_performable(), Some(sealed));
        chain
            .get_mut(sealed)
            .unwrap()
            .set_state(BatchState::Performed);
        let released = chain.release_performed();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].seq(), sealed);
    }

    #[test]
    fn test_snapshot_pins_older_stored_batch_it_reads_through() {
        let allocator = Allocator::new(100);
        let mut chain = BatchChain::new(-1);
        let mut updates = HashMap::new();
        updates.insert(7u32, Update::shadowed(40));
        chain.commit(&allocator, updates).unwrap();
        let sealed = chain.seal_open_batch().unwrap();
        chain.get_mut(sealed).unwrap().set_state(BatchState::Stored);
        chain.commit(&allocator, put(1, "later")).unwrap();

        // The snapshot anchors at the open batch but still resolves
        // page 7 through the stored batch's shadow.
        let snapshot = chain.open_snapshot();
        assert_eq!(chain.translate(&snapshot, 7), 40);
        assert_eq!(chain.next_performable(), None);
        chain.close_snapshot(snapshot);
        assert_eq!(chain.next_performable(), Some(sealed));
    }

    #[test]
    fn test_release_preserves_seq_lookup() {
        let allocator = Allocator::new(100);
        let mut chain = BatchChain::new(-1);
        chain.commit(&allocator, put(1, "a")).unwrap();
        let first = chain.seal_open_batch().unwrap();
        chain.commit(&allocator, put(2, "b")).unwrap();
        let second = chain.seal_open_batch().unwrap();
        chain.get_mut(first).unwrap().set_state(BatchState::Stored);
        chain
            .get_mut(first)
            .unwrap()
            .set_state(BatchState::Performed);
        chain.release_performed();
        assert!(chain.get(first).is_none());
        assert_eq!(chain.get(second).unwrap().seq(), second);
    }

    #[test]
    fn test_freed_page_resolves_freed() {
        let allocator = Allocator::new(100);
        let mut chain = BatchChain::new(-1);
        let mut updates = HashMap::new();
        updates.insert(3u32, Update::freed());
        chain.commit(&allocator, updates).unwrap();
        let snapshot = chain.open_snapshot();
        assert!(matches!(chain.resolve(&snapshot, 3), Resolved::Freed));
        chain.close_snapshot(snapshot);
    }
}
