//! The transactional page store
//!
//! Public surface of the crate: open a [`TxPageFile`] from a
//! [`StoreConfig`], start [`Transaction`]s against it, and flush for
//! durability. Everything else (batch lifecycle, recovery, the
//! header) is internal plumbing over the `mvcc` and `paging` layers.

mod config;
mod header;
mod recovery;
mod transaction;
mod tx_page_file;
mod worker;

pub use config::StoreConfig;
pub use header::Header;
pub use transaction::{Slice, SliceMode, Transaction};
pub use tx_page_file::TxPageFile;
