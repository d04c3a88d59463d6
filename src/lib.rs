//! pagedb - an embedded, transactional, MVCC page store over a
//! single flat file
//!
//! Callers (typically index structures) get a page-granular
//! read/write surface with snapshot isolation, optimistic conflict
//! detection and crash-safe recovery, without a separate write-ahead
//! log process. Committed updates are staged in shadow pages, grouped
//! into durable batches, and copied onto their true locations once no
//! open snapshot still needs the old contents.
//!
//! ```no_run
//! use pagedb::{StoreConfig, TxPageFile};
//!
//! # fn main() -> pagedb::PagingResult<()> {
//! let store = TxPageFile::open(StoreConfig::new("data.db").page_size(512))?;
//! let mut tx = store.tx();
//! let page = tx.alloc()?;
//! tx.write(page, b"hello")?;
//! tx.commit()?;
//! store.flush()?;
//! # Ok(())
//! # }
//! ```

pub mod mvcc;
pub mod paging;
pub mod store;

pub use paging::{PageId, PageIo, PagingError, PagingErrorCode, PagingResult, Severity};
pub use mvcc::PageCodec;
pub use store::{Slice, SliceMode, StoreConfig, Transaction, TxPageFile};
