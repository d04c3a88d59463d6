//! Snapshot handles
//!
//! A snapshot fixes a read horizon: the last commit that existed when
//! the snapshot was opened. Reads through the snapshot walk the batch
//! chain backward from that anchor, so later commits are invisible,
//! and every batch from the oldest not-yet-performed one onward is
//! pinned so no staged page the snapshot can still reach is performed
//! over while the snapshot is open.
//!
//! Snapshots are created and released only by the batch chain, under
//! its lock; the handle itself is inert data.

use crate::paging::PageId;

use super::update::Deferred;

/// Where in the chain a snapshot's read horizon sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotAnchor {
    /// Batch holding the anchor commit.
    pub batch_seq: u64,
    /// Index of the anchor commit within that batch. `None` when the
    /// chain held no commits at all when the snapshot opened.
    pub commit_index: Option<usize>,
    /// Revision visible to this snapshot.
    pub head_revision: i64,
}

/// An open snapshot. Must be returned to the chain to release its
/// pins.
#[derive(Debug)]
pub struct Snapshot {
    pub(crate) anchor: SnapshotAnchor,
    /// Batches `pinned_from..=pinned_to` had their pin count raised.
    pub(crate) pinned_from: u64,
    pub(crate) pinned_to: u64,
}

impl Snapshot {
    pub fn anchor(&self) -> SnapshotAnchor {
        self.anchor
    }

    /// Revision this snapshot reads at.
    pub fn head_revision(&self) -> i64 {
        self.anchor.head_revision
    }
}

/// Outcome of resolving a page against the unperformed chain.
#[derive(Debug)]
pub enum Resolved {
    /// A deferred update still in memory; its value (or remove) is
    /// authoritative.
    Deferred(Deferred),
    /// An update exists and its bytes live at this location.
    Location(PageId),
    /// The page was freed by a commit visible to the snapshot.
    Freed,
    /// No visible update in the chain; the true page location and the
    /// read cache are authoritative.
    Unresolved,
}
