//! Crash recovery
//!
//! Reopening an existing file reconstructs the state the last
//! successful sync made durable:
//!
//! 1. Decode the redundant header (falling back to its second copy).
//! 2. Load the persisted free list and seed the allocator from it.
//! 3. Walk batch records backward from the optimistic pointer; if a
//!    record fails to parse (torn write of an unsynced batch),
//!    discard everything and restart from the pessimistic pointer,
//!    which only ever names synced records.
//! 4. Re-mark the pages the free list cannot list as allocated yet:
//!    the free list extent itself, each batch record extent, and each
//!    recovered update's shadow, allocated and freed pages (freed
//!    pages only return to the allocator when their batch releases).
//! 5. Rebuild the chain from the recovered batches and run a normal
//!    flush cycle, which re-performs them and re-syncs.
//!
//! Anything newer than the last stored batch is gone; that is the
//! contract of an unflushed commit.

use crate::mvcc::{Batch, BatchChain};
use crate::paging::{read_extent, PageId, PagingError, PagingResult, Ranges};

use super::header::Header;
use super::tx_page_file::StoreInner;

impl StoreInner {
    pub(crate) fn recover(&self) -> PagingResult<()> {
        let mut housekeeping = self.housekeeping.lock().unwrap();
        let header = Header::load(&self.file)?;
        if header.page_size != self.config.page_size {
            return Err(PagingError::illegal_state(format!(
                "file has page size {}, store opened with {}",
                header.page_size, self.config.page_size
            )));
        }

        self.allocator.clear();
        if let Some(free_list_page) = header.free_list_page {
            let encoded = read_extent(&self.file, free_list_page)?;
            let ranges = Ranges::decode(&encoded)?;
            self.allocator.set_free_ranges(&ranges);
            housekeeping.stored_free_list = ranges;
            for page in self.record_extent_pages(free_list_page)? {
                self.allocator.unfree(page, 1);
            }
        } else {
            housekeeping.stored_free_list = self.allocator.free_ranges();
        }

        let (recovered, visited) = match self.load_batch_records(&header, header.optimistic_page) {
            Ok(walk) => walk,
            Err(optimistic_failure) => {
                if header.pessimistic_page == header.optimistic_page {
                    return Err(optimistic_failure);
                }
                self.load_batch_records(&header, header.pessimistic_page)?
            }
        };

        // Every record the header can still reach must stay allocated,
        // including ones older than the baseline that a pinned snapshot
        // kept around.
        for record_page in visited {
            for page in self.record_extent_pages(record_page)? {
                self.allocator.unfree(page, 1);
            }
        }
        for batch in &recovered {
            for commit in batch.commits() {
                for (&page, update) in commit.updates() {
                    if let Some(shadow) = update.shadow() {
                        self.allocator.unfree(shadow, 1);
                    }
                    if update.is_allocated() {
                        self.allocator.unfree(page, 1);
                    }
                    // Freed pages return to the allocator when their
                    // batch is released, not before; the persisted free
                    // list already lists them, so take them back out
                    // until the replay releases them again.
                    if update.is_freed() {
                        self.allocator.unfree(page, 1);
                    }
                }
            }
        }

        housekeeping.header = header;
        housekeeping.last_batch_page = recovered
            .last()
            .and_then(|b| b.page())
            .or(header.optimistic_page);
        *self.chain.lock().unwrap() = BatchChain::from_recovered(header.base_revision, recovered);
        drop(housekeeping);

        // Re-perform and re-sync what the crash interrupted.
        self.flush_cycle()
    }

    /// Walks batch records backward from `start` until reaching the
    /// durable base revision, returning them oldest-first with chain
    /// sequences assigned, along with the extent head of every record
    /// the walk read.
    fn load_batch_records(
        &self,
        header: &Header,
        start: Option<PageId>,
    ) -> PagingResult<(Vec<Batch>, Vec<PageId>)> {
        let mut loaded = Vec::new();
        let mut visited = Vec::new();
        let mut pointer = start;
        while let Some(page) = pointer {
            let record = read_extent(&self.file, page)?;
            let mut batch = Batch::decode(0, &record)?;
            visited.push(page);
            if batch.head() <= header.base_revision {
                break;
            }
            batch.set_page(page);
            pointer = if batch.base() <= header.base_revision {
                None
            } else {
                batch.previous()
            };
            loaded.push(batch);
        }
        loaded.reverse();

        // The walk must land exactly on the durable baseline and the
        // records must chain without gaps.
        let mut expected_base = header.base_revision;
        for (seq, batch) in loaded.iter_mut().enumerate() {
            if batch.base() != expected_base {
                return Err(PagingError::data_corruption(format!(
                    "batch chain gap: expected base revision {expected_base}, found {}",
                    batch.base()
                )));
            }
            expected_base = batch.head();
            batch.set_seq(seq as u64);
        }
        Ok((loaded, visited))
    }
}
