//! Per-page pending mutation records
//!
//! To provide snapshot isolation and atomic multi-page commits,
//! updates to existing pages are staged in a shadow page. Once the
//! whole batch is durable and no open snapshot still needs the
//! original contents, the shadow is copied over the true location and
//! freed.
//!
//! An `Update` is keyed by the original page location inside a
//! commit's update map; its shadow field is the staging location.
//! Updates to pages allocated inside the same transaction write the
//! final location directly and carry no shadow, since no snapshot can
//! have a view onto a page that did not exist.
//!
//! Object puts stay *deferred*: the value and its codec are held
//! in memory and encoded only when the owning batch is stored. A
//! later put or clear of the same page collapses the earlier one
//! without ever paying for an encode.
//!
//! Invariants:
//! - never simultaneously ALLOCATED and FREED
//! - a freed update has no shadow
//! - a deferred update gets its shadow assigned only at store time

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::paging::{PageId, PageIo, PagingError, PagingResult};

pub const PAGE_ALLOCATED: u8 = 1 << 0;
pub const PAGE_FREED: u8 = 1 << 1;
pub const PAGE_PUT: u8 = 1 << 2;
pub const PAGE_REMOVE: u8 = 1 << 3;

/// Encoder/decoder for one page-resident value type. This is the only
/// coupling between the page store and the marshalling layer: index
/// structures implement it, the store calls back into it when
/// deferred updates are materialized and when the read cache loads.
///
/// `store` writes the value at `page` and returns any extra extent
/// pages it allocated for overflow data; `linked_pages` reports the
/// extent pages reachable from an already-stored record so the store
/// can free them when the record is replaced or removed.
pub trait PageCodec: Send + Sync + 'static {
    type Value: Send + Sync + 'static;

    fn store(
        &self,
        io: &mut dyn PageIo,
        page: PageId,
        value: &Self::Value,
    ) -> PagingResult<Vec<PageId>>;

    fn load(&self, io: &mut dyn PageIo, page: PageId) -> PagingResult<Self::Value>;

    fn linked_pages(&self, io: &mut dyn PageIo, page: PageId) -> PagingResult<Vec<PageId>>;
}

/// Type-erased store half of [`PageCodec`], so updates with different
/// value types can share one update map. Loads and linked-page scans
/// always go through the typed trait; only the materialization of a
/// deferred put is erased.
pub(crate) trait DeferredCodec: Send + Sync {
    fn store_value(
        &self,
        io: &mut dyn PageIo,
        page: PageId,
        value: &(dyn Any + Send + Sync),
    ) -> PagingResult<Vec<PageId>>;
}

impl<C: PageCodec> DeferredCodec for C {
    fn store_value(
        &self,
        io: &mut dyn PageIo,
        page: PageId,
        value: &(dyn Any + Send + Sync),
    ) -> PagingResult<Vec<PageId>> {
        let value = value.downcast_ref::<C::Value>().ok_or_else(|| {
            PagingError::illegal_state("deferred value does not match its codec type")
        })?;
        self.store(io, page, value)
    }
}

/// The in-memory payload of a deferred PUT or REMOVE.
#[derive(Clone)]
pub struct Deferred {
    pub(crate) codec: Arc<dyn DeferredCodec>,
    /// `Some` for a put, `None` for a remove.
    pub(crate) value: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("put", &self.value.is_some())
            .finish()
    }
}

/// A pending mutation of one page.
#[derive(Clone, Debug, Default)]
pub struct Update {
    flags: u8,
    shadow: Option<PageId>,
    deferred: Option<Deferred>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    /// An update recording a fresh allocation.
    pub fn allocated() -> Self {
        let mut u = Self::new();
        u.mark_allocated();
        u
    }

    /// An update recording a free.
    pub fn freed() -> Self {
        let mut u = Self::new();
        u.mark_freed();
        u
    }

    /// An update staging a raw write at `shadow`.
    pub fn shadowed(shadow: PageId) -> Self {
        let mut u = Self::new();
        u.shadow = Some(shadow);
        u
    }

    /// A copy keeping only the persistent part of `other`: the shadow
    /// location and the ALLOCATED/FREED flags. Deferred payloads and
    /// PUT/REMOVE flags are in-memory state and do not survive.
    pub fn persistent_copy(other: &Update) -> Self {
        Self {
            flags: other.flags & (PAGE_ALLOCATED | PAGE_FREED),
            shadow: other.shadow,
            deferred: None,
        }
    }

    pub fn mark_allocated(&mut self) {
        self.flags = (self.flags & !PAGE_FREED) | PAGE_ALLOCATED;
    }

    pub fn mark_freed(&mut self) {
        self.flags = (self.flags & !PAGE_ALLOCATED) | PAGE_FREED;
        self.shadow = None;
        self.deferred = None;
    }

    pub fn is_allocated(&self) -> bool {
        self.flags & PAGE_ALLOCATED != 0
    }

    pub fn is_freed(&self) -> bool {
        self.flags & PAGE_FREED != 0
    }

    pub fn is_put(&self) -> bool {
        self.flags & PAGE_PUT != 0
    }

    pub fn is_remove(&self) -> bool {
        self.flags & PAGE_REMOVE != 0
    }

    pub fn is_shadowed(&self) -> bool {
        self.shadow.is_some()
    }

    pub fn shadow(&self) -> Option<PageId> {
        self.shadow
    }

    pub fn set_shadow(&mut self, page: PageId) {
        self.shadow = Some(page);
    }

    /// The location holding this update's bytes: the shadow if one is
    /// assigned, otherwise the page itself.
    pub fn translate(&self, page: PageId) -> PageId {
        self.shadow.unwrap_or(page)
    }

    pub fn deferred(&self) -> Option<&Deferred> {
        self.deferred.as_ref()
    }

    pub(crate) fn take_deferred(&mut self) -> Option<Deferred> {
        self.deferred.take()
    }

    /// Records a deferred object put.
    pub fn defer_put<C: PageCodec>(&mut self, codec: &Arc<C>, value: Arc<C::Value>) {
        self.flags = (self.flags & !PAGE_REMOVE) | PAGE_PUT;
        self.deferred = Some(Deferred {
            codec: codec.clone() as Arc<dyn DeferredCodec>,
            value: Some(value as Arc<dyn Any + Send + Sync>),
        });
    }

    /// Records a deferred object remove.
    pub fn defer_remove<C: PageCodec>(&mut self, codec: &Arc<C>) {
        self.flags = (self.flags & !PAGE_PUT) | PAGE_REMOVE;
        self.deferred = Some(Deferred {
            codec: codec.clone() as Arc<dyn DeferredCodec>,
            value: None,
        });
    }

    /// Encodes the persistent part: shadow (i32 LE, -1 for none) and
    /// the ALLOCATED/FREED flags.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let shadow = self.shadow.map(|s| s as i32).unwrap_or(-1);
        buf.extend_from_slice(&shadow.to_le_bytes());
        buf.push(self.flags & (PAGE_ALLOCATED | PAGE_FREED));
    }

    pub fn decode(data: &[u8]) -> PagingResult<(Self, usize)> {
        if data.len() < 5 {
            return Err(PagingError::data_corruption("update record too short"));
        }
        let shadow = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let flags = data[4];
        if flags & PAGE_ALLOCATED != 0 && flags & PAGE_FREED != 0 {
            return Err(PagingError::data_corruption(
                "update is both allocated and freed",
            ));
        }
        Ok((
            Self {
                flags,
                shadow: if shadow < 0 { None } else { Some(shadow as PageId) },
                deferred: None,
            },
            5,
        ))
    }
}
