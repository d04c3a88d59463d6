//! Multi-version concurrency control
//!
//! The in-memory machinery between transactions and the paging
//! substrate:
//!
//! - `Update` - one staged page mutation, raw or deferred
//! - `Commit` - merged updates of consecutive committed transactions
//! - `Batch` - the durability unit, a group of commits
//! - `BatchChain` - ordered batches ending in the single open batch
//! - `Snapshot` - a pinned read horizon over the chain
//! - `ReadCache` - decoded values of fully performed pages
//!
//! Committed state becomes visible in memory the moment it enters the
//! open batch; durability and application to true page locations
//! happen later, batch by batch, without blocking new commits.

mod batch;
mod chain;
mod commit;
mod read_cache;
mod snapshot;
mod update;

pub use batch::{Batch, BatchState};
pub use chain::BatchChain;
pub use commit::Commit;
pub use read_cache::ReadCache;
pub use snapshot::{Resolved, Snapshot, SnapshotAnchor};
pub use update::{
    Deferred, PageCodec, Update, PAGE_ALLOCATED, PAGE_FREED, PAGE_PUT, PAGE_REMOVE,
};
