//! Store configuration

use std::path::PathBuf;

use crate::paging::{PagingError, PagingResult};

/// Configuration for opening a [`super::TxPageFile`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Path of the backing file.
    pub path: PathBuf,
    /// Fixed page size in bytes. Power of two, at least 64.
    pub page_size: u32,
    /// Upper bound on the page address space.
    pub max_pages: u32,
    /// Auto-flush threshold: the open batch is sealed once it holds
    /// this many updated pages.
    pub batch_limit: usize,
    /// Whether stores fsync before a batch counts as durable.
    /// Disabling trades crash safety for throughput.
    pub sync: bool,
    /// Run flushes on a background worker thread instead of inline on
    /// the committing thread.
    pub use_worker: bool,
    /// Read cache capacity in decoded values. Zero disables caching.
    pub cache_size: usize,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            page_size: 512,
            max_pages: u32::MAX / 2,
            batch_limit: 1024,
            sync: true,
            use_worker: false,
            cache_size: 1024,
        }
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn use_worker(mut self, use_worker: bool) -> Self {
        self.use_worker = use_worker;
        self
    }

    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn validate(&self) -> PagingResult<()> {
        if self.page_size < 64 || !self.page_size.is_power_of_two() {
            return Err(PagingError::illegal_state(format!(
                "page size must be a power of two of at least 64, got {}",
                self.page_size
            )));
        }
        if self.max_pages == 0 {
            return Err(PagingError::illegal_state("max_pages must be nonzero"));
        }
        if self.batch_limit == 0 {
            return Err(PagingError::illegal_state("batch_limit must be nonzero"));
        }
        Ok(())
    }
}
