//! The transactional page file orchestrator
//!
//! Owns the batch chain and drives batches through their lifecycle:
//! sealing the open batch, materializing deferred updates, writing
//! batch records, syncing, performing staged updates onto true page
//! locations, persisting the free list, and reclaiming released
//! batch storage.
//!
//! Lock discipline: two coarse mutexes. The housekeeping mutex
//! serializes lifecycle I/O (store/sync/perform/release); the chain
//! mutex guards the batch chain, commits and snapshots. Housekeeping
//! may take the chain lock, never the reverse. The allocator and the
//! page file serialize internally and are leaf locks.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::mvcc::{BatchChain, BatchState, ReadCache, Resolved, Snapshot, Update};
use crate::paging::{
    extent_pages, free_extent, write_extent, Allocator, PageFile, PageId, PagingError,
    PagingResult, Ranges, RawPageIo,
};

use super::config::StoreConfig;
use super::header::Header;
use super::transaction::Transaction;
use super::worker::{FlushWorker, WorkerMessage};

/// State mutated only under the housekeeping mutex.
pub(crate) struct Housekeeping {
    pub(crate) header: Header,
    /// Free ranges as of the durable base revision. Batch records,
    /// shadows and the free list extent itself stay listed free here;
    /// recovery re-marks them allocated while replaying.
    pub(crate) stored_free_list: Ranges,
    /// Record page of the most recently written batch, linked as the
    /// next batch's `previous`.
    pub(crate) last_batch_page: Option<PageId>,
    /// Error from a background flush, surfaced on the next explicit
    /// flush.
    pub(crate) deferred_error: Option<PagingError>,
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) file: PageFile,
    pub(crate) allocator: Allocator,
    pub(crate) cache: ReadCache,
    pub(crate) housekeeping: Mutex<Housekeeping>,
    pub(crate) chain: Mutex<BatchChain>,
    /// Present when a background flush worker is running.
    pub(crate) worker_sender: Mutex<Option<mpsc::Sender<WorkerMessage>>>,
}

/// An embedded, transactional, MVCC page store over a single file.
pub struct TxPageFile {
    inner: Arc<StoreInner>,
    worker: Option<FlushWorker>,
}

impl TxPageFile {
    /// Opens the store described by `config`, creating a fresh file
    /// or recovering an existing one.
    pub fn open(config: StoreConfig) -> PagingResult<Self> {
        config.validate()?;
        let file = PageFile::open(&config.path, config.page_size)?;
        let inner = StoreInner {
            allocator: Allocator::new(config.max_pages),
            cache: ReadCache::new(config.cache_size),
            housekeeping: Mutex::new(Housekeeping {
                header: Header::new(config.page_size),
                stored_free_list: Ranges::new(),
                last_batch_page: None,
                deferred_error: None,
            }),
            chain: Mutex::new(BatchChain::new(-1)),
            worker_sender: Mutex::new(None),
            file,
            config,
        };
        if inner.file.is_new() {
            inner.reset()?;
        } else {
            inner.recover()?;
        }
        let inner = Arc::new(inner);
        let worker = if inner.config.use_worker {
            let worker = FlushWorker::spawn(inner.clone());
            *inner.worker_sender.lock().unwrap() = Some(worker.sender());
            Some(worker)
        } else {
            None
        };
        Ok(Self { inner, worker })
    }

    /// Starts a transaction.
    pub fn tx(&self) -> Transaction {
        Transaction::new(self.inner.clone())
    }

    /// Seals the open batch and blocks until it is durable and
    /// performed.
    pub fn flush(&self) -> PagingResult<()> {
        self.inner.flush_blocking()
    }

    /// Registers `callback` to run once everything committed so far
    /// is durable, then triggers a flush without waiting for it.
    pub fn flush_with(&self, callback: Box<dyn FnOnce() + Send>) {
        self.inner.flush_with(callback)
    }

    /// Latest committed revision, -1 for an empty store.
    pub fn head_revision(&self) -> i64 {
        self.inner.chain.lock().unwrap().head_revision()
    }

    pub fn page_size(&self) -> u32 {
        self.inner.file.page_size()
    }

    /// Number of pages needed to hold `byte_len` bytes.
    pub fn pages(&self, byte_len: u32) -> u32 {
        self.inner.file.pages(byte_len)
    }
}

impl std::fmt::Debug for TxPageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxPageFile")
            .field("path", &self.inner.file.path())
            .field("page_size", &self.inner.file.page_size())
            .field("head_revision", &self.head_revision())
            .field("worker", &self.worker.is_some())
            .finish()
    }
}

impl Drop for TxPageFile {
    fn drop(&mut self) {
        *self.inner.worker_sender.lock().unwrap() = None;
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

impl StoreInner {
    /// Initializes a fresh, empty store.
    pub(crate) fn reset(&self) -> PagingResult<()> {
        let mut housekeeping = self.housekeeping.lock().unwrap();
        let mut chain = self.chain.lock().unwrap();
        *chain = BatchChain::new(-1);
        self.allocator.clear();
        self.cache.clear();
        housekeeping.header = Header::new(self.config.page_size);
        housekeeping.stored_free_list = self.allocator.free_ranges();
        housekeeping.last_batch_page = None;
        housekeeping.header.store(&self.file)?;
        self.sync()
    }

    pub(crate) fn open_snapshot(&self) -> Snapshot {
        self.chain.lock().unwrap().open_snapshot()
    }

    pub(crate) fn close_snapshot(&self, snapshot: Snapshot) {
        self.chain.lock().unwrap().close_snapshot(snapshot);
    }

    /// Location holding the bytes `snapshot` should read for `page`.
    pub(crate) fn translate(&self, snapshot: &Snapshot, page: PageId) -> PageId {
        self.chain.lock().unwrap().translate(snapshot, page)
    }

    pub(crate) fn resolve(&self, snapshot: &Snapshot, page: PageId) -> Resolved {
        self.chain.lock().unwrap().resolve(snapshot, page)
    }

    /// Commits a transaction's updates: conflict-checks them against
    /// commits after the snapshot anchor and merges them into the
    /// open batch. Returns the assigned revision.
    pub(crate) fn commit_updates(
        &self,
        snapshot: &Snapshot,
        updates: HashMap<PageId, Update>,
    ) -> PagingResult<i64> {
        let needs_flush;
        let revision;
        {
            let mut chain = self.chain.lock().unwrap();
            let pages: Vec<PageId> = updates.keys().copied().collect();
            if let Err(e) = chain.conflict_check(snapshot, &pages) {
                drop(chain);
                self.release_updates(updates);
                return Err(e);
            }
            revision = chain.commit(&self.allocator, updates)?;
            needs_flush = chain
                .open_batch()
                .commits()
                .iter()
                .map(|c| c.updates().len())
                .sum::<usize>()
                >= self.config.batch_limit;
        }
        if needs_flush {
            self.trigger_flush();
        }
        Ok(revision)
    }

    /// Undoes the staged side effects of updates that will never
    /// commit: shadows and fresh allocations go back to the
    /// allocator.
    pub(crate) fn release_updates(&self, updates: HashMap<PageId, Update>) {
        for (page, update) in updates {
            if let Some(shadow) = update.shadow() {
                self.allocator.free(shadow, 1);
            }
            if update.is_allocated() {
                self.allocator.free(page, 1);
            }
        }
    }

    /// Kicks off a flush without waiting: on the worker when one is
    /// running, inline otherwise. Inline errors are deferred to the
    /// next blocking flush.
    pub(crate) fn trigger_flush(&self) {
        let sender = self.worker_sender.lock().unwrap().clone();
        match sender {
            Some(sender) => {
                let _ = sender.send(WorkerMessage::Flush(None));
            }
            None => {
                if let Err(e) = self.flush_cycle() {
                    self.housekeeping.lock().unwrap().deferred_error = Some(e);
                }
            }
        }
    }

    pub(crate) fn flush_blocking(&self) -> PagingResult<()> {
        if let Some(e) = self.housekeeping.lock().unwrap().deferred_error.take() {
            return Err(e);
        }
        let sender = self.worker_sender.lock().unwrap().clone();
        match sender {
            Some(sender) => {
                let (ack_tx, ack_rx) = mpsc::channel();
                sender
                    .send(WorkerMessage::Flush(Some(ack_tx)))
                    .map_err(|_| PagingError::illegal_state("flush worker is gone"))?;
                ack_rx
                    .recv()
                    .map_err(|_| PagingError::illegal_state("flush worker is gone"))?
            }
            None => self.flush_cycle(),
        }
    }

    /// Attaches `callback` to the newest batch still headed for disk,
    /// to run once that batch is durable. Runs it immediately when
    /// everything committed so far already is. Returns whether it was
    /// attached.
    pub(crate) fn attach_on_stored(&self, callback: Box<dyn FnOnce() + Send>) -> bool {
        let run_now = {
            let mut chain = self.chain.lock().unwrap();
            let target = chain
                .iter_mut()
                .rev()
                .find(|b| !b.is_empty() && b.state() <= BatchState::Storing);
            match target {
                Some(batch) => {
                    batch.push_on_stored(callback);
                    None
                }
                None => Some(callback),
            }
        };
        match run_now {
            Some(callback) => {
                callback();
                false
            }
            None => true,
        }
    }

    pub(crate) fn flush_with(&self, callback: Box<dyn FnOnce() + Send>) {
        if self.attach_on_stored(callback) {
            self.trigger_flush();
        }
    }

    /// Syncs the file unless the configuration traded durability away.
    fn sync(&self) -> PagingResult<()> {
        if self.config.sync {
            self.file.sync()?;
        }
        Ok(())
    }

    /// One full lifecycle pass: seal, store, sync, perform, persist
    /// the free list and header, sync, release.
    pub(crate) fn flush_cycle(&self) -> PagingResult<()> {
        let mut housekeeping = self.housekeeping.lock().unwrap();
        let stored_any = self.store_batches(&mut housekeeping)?;
        if stored_any {
            self.sync()?;
        }
        let callbacks = self.mark_stored();
        let performed_any = self.perform_batches(&mut housekeeping)?;
        if stored_any || performed_any {
            let old_free_list = self.write_checkpoint(&mut housekeeping, performed_any)?;
            self.sync()?;
            // Only now is it safe to reuse pages the old header still
            // pointed at.
            if let Some(old) = old_free_list {
                free_extent(&self.file, &self.allocator, old)?;
            }
            self.release_batches()?;
        }
        drop(housekeeping);
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    /// Seals the open batch and writes every sealed-but-unwritten
    /// batch record. Returns whether anything was written.
    fn store_batches(&self, housekeeping: &mut Housekeeping) -> PagingResult<bool> {
        let mut chain = self.chain.lock().unwrap();
        chain.seal_open_batch();
        let pending = chain.storing_batches();
        if pending.is_empty() {
            return Ok(false);
        }
        for seq in pending {
            let batch = chain.get_mut(seq).expect("storing batch in chain");
            if batch.page().is_some() {
                continue;
            }
            self.materialize_batch_updates(batch)?;
            batch.set_previous(housekeeping.last_batch_page);
            let record = batch.encode();
            let page = write_extent(&self.file, &self.allocator, &record)?;
            batch.set_page(page);
            housekeeping.last_batch_page = Some(page);
        }
        // The optimistic pointer may name a record that is not yet
        // synced; recovery falls back to the pessimistic pointer when
        // it finds a torn record.
        housekeeping.header.optimistic_page = housekeeping.last_batch_page;
        housekeeping.header.store(&self.file)?;
        Ok(true)
    }

    /// Writes out deferred values and accounts their extent pages as
    /// allocations in the owning commit.
    fn materialize_batch_updates(&self, batch: &mut crate::mvcc::Batch) -> PagingResult<()> {
        for commit in batch.commits_mut() {
            commit.still_sane()?;
            let pages: Vec<PageId> = commit.updates().keys().copied().collect();
            let mut linked = Vec::new();
            for page in pages {
                let deferred = {
                    let update = commit.updates_mut().get_mut(&page).expect("listed page");
                    let Some(deferred) = update.deferred().cloned() else {
                        continue;
                    };
                    if deferred.value.is_some()
                        && !update.is_allocated()
                        && update.shadow().is_none()
                    {
                        update.set_shadow(self.allocator.alloc(1)?);
                    }
                    deferred.value.as_ref().map(|v| {
                        (deferred.codec.clone(), v.clone(), update.translate(page))
                    })
                };
                if let Some((codec, value, target)) = deferred {
                    let mut io = RawPageIo::new(&self.file, &self.allocator);
                    linked.extend(codec.store_value(&mut io, target, value.as_ref())?);
                }
            }
            for page in linked {
                commit.updates_mut().insert(page, Update::allocated());
            }
        }
        Ok(())
    }

    /// Marks written batches durable and collects their flush
    /// callbacks. Call after a sync.
    fn mark_stored(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        let mut chain = self.chain.lock().unwrap();
        let mut callbacks = Vec::new();
        for batch in chain.iter_mut() {
            if batch.state() == BatchState::Storing && batch.page().is_some() {
                batch.set_state(BatchState::Stored);
                callbacks.extend(batch.take_on_stored());
            }
        }
        callbacks
    }

    /// Applies stored, unpinned batches front-to-back: shadow pages
    /// are copied onto true locations, the stored free list is
    /// updated, and the read cache is repopulated or invalidated.
    fn perform_batches(&self, housekeeping: &mut Housekeeping) -> PagingResult<bool> {
        let mut chain = self.chain.lock().unwrap();
        let mut performed_any = false;
        while let Some(seq) = chain.next_performable() {
            let batch = chain.get_mut(seq).expect("performable batch in chain");
            batch.set_state(BatchState::Performing);
            for commit in batch.commits_mut() {
                for (&page, update) in commit.updates_mut().iter_mut() {
                    // Shadows and freed pages go back to the allocator
                    // only at release, once the checkpoint that stops
                    // referencing this batch has synced. Until then a
                    // crash replays the batch and rereads them.
                    if let Some(shadow) = update.shadow() {
                        let staged = self.file.read_pages(shadow, 1)?;
                        self.file.write(page, &staged)?;
                    }
                    if update.is_allocated() {
                        housekeeping.stored_free_list.remove(page, 1);
                    }
                    if update.is_freed() {
                        housekeeping.stored_free_list.add(page, 1);
                        self.cache.remove(page);
                        continue;
                    }
                    match update.take_deferred() {
                        Some(deferred) => match deferred.value {
                            Some(value) => self.cache.insert(page, value),
                            None => self.cache.remove(page),
                        },
                        None if update.is_shadowed() => self.cache.remove(page),
                        None => {}
                    }
                }
            }
            let batch = chain.get_mut(seq).expect("performable batch in chain");
            batch.set_state(BatchState::Performed);
            housekeeping.header.base_revision = batch.head();
            performed_any = true;
        }
        Ok(performed_any)
    }

    /// Persists the free list (when performing changed it) and writes
    /// the header with advanced recovery pointers. Returns the
    /// superseded free list extent; the caller frees it after the
    /// header is synced.
    fn write_checkpoint(
        &self,
        housekeeping: &mut Housekeeping,
        free_list_changed: bool,
    ) -> PagingResult<Option<PageId>> {
        let old_free_list = housekeeping.header.free_list_page;
        if free_list_changed {
            let encoded = housekeeping.stored_free_list.encode();
            let page = write_extent(&self.file, &self.allocator, &encoded)?;
            housekeeping.header.free_list_page = Some(page);
        }

        // Recovery pointers must not name batches about to be
        // released; those records are reclaimed right after the sync.
        {
            let chain = self.chain.lock().unwrap();
            let mut releasable = true;
            let mut retained_page = None;
            for batch in chain.iter() {
                if releasable && batch.state() == BatchState::Performed && batch.snapshots() == 0 {
                    continue;
                }
                releasable = false;
                if let Some(page) = batch.page() {
                    retained_page = Some(page);
                }
            }
            housekeeping.header.optimistic_page = retained_page;
            housekeeping.header.pessimistic_page = retained_page;
        }
        housekeeping.header.store(&self.file)?;

        Ok(if free_list_changed { old_free_list } else { None })
    }

    /// Pops released batches off the chain front and reclaims their
    /// record extents, shadow pages and freed pages. Call only after
    /// the header no longer points at the batch: a crash before that
    /// sync replays the batch from its record and rereads the shadows.
    fn release_batches(&self) -> PagingResult<()> {
        let released = self.chain.lock().unwrap().release_performed();
        for batch in released {
            for commit in batch.commits() {
                for (&page, update) in commit.updates() {
                    if let Some(shadow) = update.shadow() {
                        self.allocator.free(shadow, 1);
                    }
                    if update.is_freed() {
                        self.allocator.free(page, 1);
                    }
                }
            }
            if let Some(page) = batch.page() {
                free_extent(&self.file, &self.allocator, page)?;
            }
        }
        Ok(())
    }

    /// Pages occupied by the record extent at `head`; used by
    /// recovery to re-mark them allocated.
    pub(crate) fn record_extent_pages(&self, head: PageId) -> PagingResult<Vec<PageId>> {
        extent_pages(&self.file, head)
    }
}
