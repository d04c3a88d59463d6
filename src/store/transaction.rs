//! Transactions
//!
//! A transaction buffers its page updates privately until commit.
//! The first touch of any page opens the transaction's snapshot,
//! pinning the committed view it will read from. At commit the
//! buffered updates are conflict-checked against commits that landed
//! after the snapshot anchor and merged into the open batch; on
//! conflict the transaction rolls itself back and the caller retries.
//!
//! A transaction is single-threaded by construction; different
//! threads run their own transactions concurrently.

use std::any::Any;
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use crate::mvcc::{PageCodec, Resolved, Snapshot, Update};
use crate::paging::{PageId, PageIo, PagingError, PagingResult};

use super::tx_page_file::StoreInner;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceMode {
    Read,
    Write,
    ReadWrite,
}

/// A multi-page buffer checked out with [`Transaction::slice`].
/// Writable slices are written back by [`Transaction::unslice`];
/// read slices are simply dropped there.
pub struct Slice {
    page: PageId,
    count: u32,
    writable: bool,
    data: Vec<u8>,
}

impl Slice {
    pub fn page(&self) -> PageId {
        self.page
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

pub struct Transaction {
    store: Arc<StoreInner>,
    snapshot: Option<Snapshot>,
    updates: HashMap<PageId, Update>,
    flush_callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

impl Transaction {
    pub(crate) fn new(store: Arc<StoreInner>) -> Self {
        Self {
            store,
            snapshot: None,
            updates: HashMap::new(),
            flush_callbacks: Vec::new(),
        }
    }

    /// True while the transaction has staged no updates.
    pub fn is_read_only(&self) -> bool {
        self.updates.is_empty()
    }

    /// Revision this transaction reads at, once its snapshot is open.
    pub fn head_revision(&mut self) -> i64 {
        self.ensure_snapshot();
        self.snapshot.as_ref().expect("snapshot open").head_revision()
    }

    fn ensure_snapshot(&mut self) {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.store.open_snapshot());
        }
    }

    /// Allocates a page. The allocation is undone by rollback.
    pub fn alloc(&mut self) -> PagingResult<PageId> {
        self.alloc_pages(1)
    }

    /// Allocates `count` contiguous pages, returning the first.
    pub fn alloc_pages(&mut self, count: u32) -> PagingResult<PageId> {
        self.ensure_snapshot();
        let start = self.store.allocator.alloc(count)?;
        for page in start..start + count {
            self.updates.insert(page, Update::allocated());
        }
        Ok(start)
    }

    /// Frees a page. For a page allocated by this transaction the two
    /// operations cancel immediately, so a rolled-back alloc+free pair
    /// leaves the allocator exactly as it was.
    pub fn free(&mut self, page: PageId) -> PagingResult<()> {
        self.ensure_snapshot();
        match self.updates.get(&page) {
            Some(u) if u.is_freed() => Err(PagingError::illegal_state(format!(
                "page {page} already freed in this transaction"
            ))),
            Some(u) if u.is_allocated() && u.shadow().is_none() => {
                self.updates.remove(&page);
                self.store.allocator.free(page, 1);
                Ok(())
            }
            Some(u) => {
                if let Some(shadow) = u.shadow() {
                    self.store.allocator.free(shadow, 1);
                }
                self.updates.insert(page, Update::freed());
                Ok(())
            }
            None => {
                self.updates.insert(page, Update::freed());
                Ok(())
            }
        }
    }

    /// Frees `count` contiguous pages starting at `page`.
    pub fn free_pages(&mut self, page: PageId, count: u32) -> PagingResult<()> {
        for page in page..page + count {
            self.free(page)?;
        }
        Ok(())
    }

    /// Reads raw bytes through this transaction's view: its own
    /// staged writes first, then the snapshot, then the true page.
    pub fn read(&mut self, page: PageId, buf: &mut [u8]) -> PagingResult<()> {
        if let Some(update) = self.updates.get(&page) {
            if update.is_freed() {
                return Err(PagingError::illegal_state(format!(
                    "read of page {page} freed in this transaction"
                )));
            }
            return self.store.file.read(update.translate(page), buf);
        }
        self.ensure_snapshot();
        let snapshot = self.snapshot.as_ref().expect("snapshot open");
        let location = self.store.translate(snapshot, page);
        self.store.file.read(location, buf)
    }

    /// Stages a raw byte write. The first write of a pre-existing
    /// page allocates a shadow; pages allocated by this transaction
    /// are written in place.
    pub fn write(&mut self, page: PageId, data: &[u8]) -> PagingResult<()> {
        self.ensure_snapshot();
        match self.updates.get(&page) {
            Some(u) if u.is_freed() => Err(PagingError::illegal_state(format!(
                "write to page {page} freed in this transaction"
            ))),
            Some(u) if u.deferred().is_some() => Err(PagingError::illegal_state(format!(
                "raw write to page {page} after an object update"
            ))),
            Some(u) => self.store.file.write(u.translate(page), data),
            None => {
                let shadow = self.store.allocator.alloc(1)?;
                self.updates.insert(page, Update::shadowed(shadow));
                self.store.file.write(shadow, data)
            }
        }
    }

    /// Checks out `count` pages starting at `page` as one buffer.
    pub fn slice(&mut self, mode: SliceMode, page: PageId, count: u32) -> PagingResult<Slice> {
        let page_size = self.store.file.page_size() as usize;
        let mut data = vec![0u8; page_size * count as usize];
        if mode != SliceMode::Write {
            for i in 0..count {
                let start = i as usize * page_size;
                self.read(page + i, &mut data[start..start + page_size])?;
            }
        }
        Ok(Slice {
            page,
            count,
            writable: mode != SliceMode::Read,
            data,
        })
    }

    /// Returns a slice; writable slices are staged back page by page.
    pub fn unslice(&mut self, slice: Slice) -> PagingResult<()> {
        if slice.writable {
            let page_size = self.store.file.page_size() as usize;
            for i in 0..slice.count {
                let start = i as usize * page_size;
                self.write(slice.page + i, &slice.data[start..start + page_size])?;
            }
        }
        Ok(())
    }

    /// Loads the value stored at `page`, favoring this transaction's
    /// pending value, then the snapshot view, then the read cache.
    /// `Ok(None)` means the value was cleared.
    pub fn get<C: PageCodec>(
        &mut self,
        codec: &Arc<C>,
        page: PageId,
    ) -> PagingResult<Option<Arc<C::Value>>> {
        if let Some(update) = self.updates.get(&page) {
            if update.is_freed() {
                return Err(PagingError::illegal_state(format!(
                    "get of page {page} freed in this transaction"
                )));
            }
            if let Some(deferred) = update.deferred() {
                return deferred.value.clone().map(downcast::<C::Value>).transpose();
            }
            // Raw local write; decode through the translated view.
            return Ok(Some(Arc::new(codec.load(self, page)?)));
        }
        self.ensure_snapshot();
        let snapshot = self.snapshot.as_ref().expect("snapshot open");
        match self.store.resolve(snapshot, page) {
            Resolved::Freed => Err(PagingError::illegal_state(format!(
                "get of freed page {page}"
            ))),
            Resolved::Deferred(deferred) => {
                deferred.value.map(downcast::<C::Value>).transpose()
            }
            Resolved::Location(_) => Ok(Some(Arc::new(codec.load(self, page)?))),
            Resolved::Unresolved => {
                if let Some(cached) = self.store.cache.get(page) {
                    return Ok(Some(downcast::<C::Value>(cached)?));
                }
                let value = Arc::new(codec.load(self, page)?);
                self.store
                    .cache
                    .insert(page, value.clone() as Arc<dyn Any + Send + Sync>);
                Ok(Some(value))
            }
        }
    }

    /// Records a deferred object write. The value stays in memory
    /// until the owning batch is stored, so later puts or clears of
    /// the same page collapse for free.
    pub fn put<C: PageCodec>(
        &mut self,
        codec: &Arc<C>,
        page: PageId,
        value: C::Value,
    ) -> PagingResult<()> {
        self.ensure_snapshot();
        match self.updates.get(&page) {
            Some(u) if u.is_freed() => {
                return Err(PagingError::illegal_state(format!(
                    "put to page {page} freed in this transaction"
                )))
            }
            Some(u) if u.is_shadowed() && u.deferred().is_none() => {
                return Err(PagingError::illegal_state(format!(
                    "object update of page {page} after a raw write"
                )))
            }
            _ => {}
        }
        self.updates
            .entry(page)
            .or_insert_with(Update::new)
            .defer_put(codec, Arc::new(value));
        Ok(())
    }

    /// Removes the value stored at `page`, freeing any overflow
    /// extent pages the stored record links to. The page itself stays
    /// allocated.
    pub fn clear<C: PageCodec>(&mut self, codec: &Arc<C>, page: PageId) -> PagingResult<()> {
        self.ensure_snapshot();
        let pending_value = match self.updates.get(&page) {
            Some(u) if u.is_freed() => {
                return Err(PagingError::illegal_state(format!(
                    "clear of page {page} freed in this transaction"
                )))
            }
            Some(u) if u.is_shadowed() && u.deferred().is_none() => {
                return Err(PagingError::illegal_state(format!(
                    "object update of page {page} after a raw write"
                )))
            }
            Some(u) => u.deferred().is_some(),
            None => false,
        };
        if !pending_value {
            // The stored record is still the visible one; release its
            // overflow pages.
            for linked in codec.linked_pages(self, page)? {
                self.free(linked)?;
            }
        }
        self.updates
            .entry(page)
            .or_insert_with(Update::new)
            .defer_remove(codec);
        Ok(())
    }

    /// Registers `callback` to run once this transaction's commit is
    /// durable on disk. Dropped if the transaction rolls back or its
    /// commit fails.
    pub fn on_flush(&mut self, callback: Box<dyn FnOnce() + Send>) {
        self.flush_callbacks.push(callback);
    }

    /// Blocks until everything committed so far is durable.
    pub fn flush(&self) -> PagingResult<()> {
        self.store.flush_blocking()
    }

    /// Commits the buffered updates. On an optimistic conflict (or
    /// any other failure) the staged resources are released and the
    /// error returned; the transaction is then clean for a retry.
    pub fn commit(&mut self) -> PagingResult<()> {
        let snapshot = self.snapshot.take();
        let updates = mem::take(&mut self.updates);
        let callbacks = mem::take(&mut self.flush_callbacks);
        let Some(snapshot) = snapshot else {
            for callback in callbacks {
                self.store.attach_on_stored(callback);
            }
            return Ok(());
        };
        let result = if updates.is_empty() {
            Ok(())
        } else {
            self.store.commit_updates(&snapshot, updates).map(|_| ())
        };
        self.store.close_snapshot(snapshot);
        if result.is_ok() {
            for callback in callbacks {
                self.store.attach_on_stored(callback);
            }
        }
        result
    }

    /// Releases everything this transaction staged: allocations are
    /// undone, shadows freed, the snapshot closed. Safe to call
    /// repeatedly; a rolled-back transaction is reusable.
    pub fn rollback(&mut self) {
        let updates = mem::take(&mut self.updates);
        self.store.release_updates(updates);
        self.flush_callbacks.clear();
        if let Some(snapshot) = self.snapshot.take() {
            self.store.close_snapshot(snapshot);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.rollback();
    }
}

/// Codecs see the transaction itself as their page I/O surface, so
/// every read and allocation they make is transactional.
impl PageIo for Transaction {
    fn page_size(&self) -> u32 {
        self.store.file.page_size()
    }

    fn pages(&self, byte_len: u32) -> u32 {
        self.store.file.pages(byte_len)
    }

    fn read(&mut self, page: PageId, buf: &mut [u8]) -> PagingResult<()> {
        Transaction::read(self, page, buf)
    }

    fn write(&mut self, page: PageId, data: &[u8]) -> PagingResult<()> {
        Transaction::write(self, page, data)
    }

    fn alloc(&mut self) -> PagingResult<PageId> {
        Transaction::alloc(self)
    }

    fn free(&mut self, page: PageId) -> PagingResult<()> {
        Transaction::free(self, page)
    }
}

fn downcast<V: Send + Sync + 'static>(value: Arc<dyn Any + Send + Sync>) -> PagingResult<Arc<V>> {
    value
        .downcast::<V>()
        .map_err(|_| PagingError::illegal_state("stored value does not match the codec type"))
}
