//! Paging substrate
//!
//! The leaf layer of the store: error taxonomy, checksums, the free
//! range set, the first-fit allocator, raw single-file page I/O, and
//! extent chains for records larger than one page.
//!
//! Nothing in this module knows about transactions or MVCC; the
//! `mvcc` and `store` layers are built on top of it.

mod allocator;
mod checksum;
mod errors;
mod extent;
mod file;
mod ranges;

pub use allocator::Allocator;
pub use checksum::{compute_checksum, verify_checksum};
pub use errors::{PagingError, PagingErrorCode, PagingResult, Severity};
pub use extent::{extent_pages, free_extent, read_extent, unfree_extent, write_extent};
pub use file::{PageFile, HEADER_REGION_SIZE};
pub use ranges::Ranges;

/// Identifies a page. Pages are fixed-size and addressed densely from
/// zero; existence (allocated vs free) is tracked only by the
/// [`Allocator`], never by page contents.
pub type PageId = u32;

/// Object-safe raw page operations, the surface codecs encode and
/// decode through. Implemented by [`RawPageIo`] (direct file access,
/// used when deferred updates are materialized and when the read
/// cache loads) and by transactions (shadowed access).
pub trait PageIo {
    /// The fixed page size in bytes.
    fn page_size(&self) -> u32;

    /// Number of pages needed to hold `byte_len` bytes.
    fn pages(&self, byte_len: u32) -> u32;

    /// Reads starting at the first byte of `page`.
    fn read(&mut self, page: PageId, buf: &mut [u8]) -> PagingResult<()>;

    /// Writes starting at the first byte of `page`.
    fn write(&mut self, page: PageId, data: &[u8]) -> PagingResult<()>;

    /// Allocates one page.
    fn alloc(&mut self) -> PagingResult<PageId>;

    /// Frees one page.
    fn free(&mut self, page: PageId) -> PagingResult<()>;
}

/// Direct [`PageIo`] over the raw file and the global allocator,
/// bypassing any transaction. Only the perform/load paths use this;
/// user code goes through a transaction.
pub struct RawPageIo<'a> {
    file: &'a PageFile,
    allocator: &'a Allocator,
}

impl<'a> RawPageIo<'a> {
    pub fn new(file: &'a PageFile, allocator: &'a Allocator) -> Self {
        Self { file, allocator }
    }
}

impl PageIo for RawPageIo<'_> {
    fn page_size(&self) -> u32 {
        self.file.page_size()
    }

    fn pages(&self, byte_len: u32) -> u32 {
        self.file.pages(byte_len)
    }

    fn read(&mut self, page: PageId, buf: &mut [u8]) -> PagingResult<()> {
        self.file.read(page, buf)
    }

    fn write(&mut self, page: PageId, data: &[u8]) -> PagingResult<()> {
        self.file.write(page, data)
    }

    fn alloc(&mut self) -> PagingResult<PageId> {
        self.allocator.alloc(1)
    }

    fn free(&mut self, page: PageId) -> PagingResult<()> {
        self.allocator.free(page, 1);
        Ok(())
    }
}
