//! Durability batches
//!
//! Commits are grouped into batches, the unit of durable write-out.
//! A batch moves through a strict lifecycle:
//!
//! - `Open`: accepting merges from committing transactions
//! - `Storing`: its record is being written as an extent chain
//! - `Stored`: record written and synced; the batch survives a crash
//! - `Performing`: staged updates are being copied to true locations
//! - `Performed`: all updates applied; awaiting release once no open
//!   snapshot pins it
//!
//! Batch records on disk form a backward-linked list through their
//! `previous` extent heads, which is what recovery walks.

use std::fmt;

use crate::paging::{verify_checksum, PageId, PagingError, PagingResult};

use super::commit::Commit;

const NO_PAGE: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchState {
    Open,
    Storing,
    Stored,
    Performing,
    Performed,
}

/// One durability unit: the commits for revisions `(base, head]`.
pub struct Batch {
    seq: u64,
    state: BatchState,
    /// Extent head of this batch's stored record.
    page: Option<PageId>,
    /// Extent head of the previous batch's record, linked into our
    /// record so recovery can walk backward.
    previous: Option<PageId>,
    /// Set when the batch was reconstructed from disk; its commits
    /// carry no deferred values and its updates are already
    /// materialized.
    recovered: bool,
    commits: Vec<Commit>,
    /// Open snapshots pinning this batch. Guarded by the chain lock.
    snapshots: usize,
    /// Head revision of the store when this batch was opened.
    base: i64,
    /// Last revision merged into this batch; equals `base` while
    /// empty.
    head: i64,
    /// Run once the batch reaches `Stored` and is synced.
    on_stored: Vec<Box<dyn FnOnce() + Send>>,
}

impl Batch {
    pub fn new(seq: u64, base: i64) -> Self {
        Self {
            seq,
            state: BatchState::Open,
            page: None,
            previous: None,
            recovered: false,
            commits: Vec::new(),
            snapshots: 0,
            base,
            head: base,
            on_stored: Vec::new(),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Assigns the chain sequence. Only recovery renumbers batches,
    /// after loading them oldest-first.
    pub fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn set_state(&mut self, state: BatchState) {
        debug_assert!(state >= self.state);
        self.state = state;
    }

    pub fn page(&self) -> Option<PageId> {
        self.page
    }

    pub fn set_page(&mut self, page: PageId) {
        self.page = Some(page);
    }

    pub fn previous(&self) -> Option<PageId> {
        self.previous
    }

    pub fn set_previous(&mut self, previous: Option<PageId>) {
        self.previous = previous;
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    pub fn base(&self) -> i64 {
        self.base
    }

    pub fn head(&self) -> i64 {
        self.head
    }

    pub fn set_head(&mut self, head: i64) {
        debug_assert!(head >= self.head);
        self.head = head;
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn commits_mut(&mut self) -> &mut Vec<Commit> {
        &mut self.commits
    }

    pub fn snapshots(&self) -> usize {
        self.snapshots
    }

    pub fn pin(&mut self) {
        self.snapshots += 1;
    }

    pub fn unpin(&mut self) {
        debug_assert!(self.snapshots > 0);
        self.snapshots -= 1;
    }

    pub fn push_on_stored(&mut self, callback: Box<dyn FnOnce() + Send>) {
        self.on_stored.push(callback);
    }

    /// Takes the callbacks to run now that the batch is durable.
    pub fn take_on_stored(&mut self) -> Vec<Box<dyn FnOnce() + Send>> {
        std::mem::take(&mut self.on_stored)
    }

    /// Encodes the batch record: head, base, previous link, commits,
    /// and a CRC32 trailer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.head.to_le_bytes());
        buf.extend_from_slice(&self.base.to_le_bytes());
        let previous = self.previous.map(|p| p as i32).unwrap_or(NO_PAGE);
        buf.extend_from_slice(&previous.to_le_bytes());
        buf.extend_from_slice(&(self.commits.len() as u32).to_le_bytes());
        for commit in &self.commits {
            commit.encode_into(&mut buf);
        }
        let crc = crate::paging::compute_checksum(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a batch record read back from disk. The result is
    /// marked recovered and enters the chain already `Stored`.
    pub fn decode(seq: u64, data: &[u8]) -> PagingResult<Self> {
        if data.len() < 28 {
            return Err(PagingError::data_corruption("batch record too short"));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let crc = u32::from_le_bytes(trailer.try_into().unwrap());
        if !verify_checksum(body, crc) {
            return Err(PagingError::data_corruption(
                "batch record checksum mismatch",
            ));
        }
        let head = i64::from_le_bytes(body[0..8].try_into().unwrap());
        let base = i64::from_le_bytes(body[8..16].try_into().unwrap());
        let previous = i32::from_le_bytes(body[16..20].try_into().unwrap());
        let count = u32::from_le_bytes(body[20..24].try_into().unwrap()) as usize;
        let mut offset = 24;
        let mut commits = Vec::with_capacity(count);
        for _ in 0..count {
            let (commit, used) = Commit::decode(&body[offset..])?;
            offset += used;
            commits.push(commit);
        }
        if offset != body.len() {
            return Err(PagingError::data_corruption(
                "batch record has trailing bytes",
            ));
        }
        Ok(Self {
            seq,
            state: BatchState::Stored,
            page: None,
            previous: if previous < 0 {
                None
            } else {
                Some(previous as PageId)
            },
            recovered: true,
            commits,
            snapshots: 0,
            base,
            head,
            on_stored: Vec::new(),
        })
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("seq", &self.seq)
            .field("state", &self.state)
            .field("base", &self.base)
            .field("head", &self.head)
            .field("commits", &self.commits.len())
            .field("snapshots", &self.snapshots)
            .field("page", &self.page)
            .field("previous", &self.previous)
            .field("recovered", &self.recovered)
            .finish()
    }
}
