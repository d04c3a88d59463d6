//! Decoded-value read cache
//!
//! Caches decoded page values keyed by true page location, so hot
//! object reads skip both the disk read and the decode. Only fully
//! performed state is cached: staged updates are resolved against the
//! batch chain before the cache is consulted, and the cache is
//! repopulated (puts) or invalidated (removes and raw writes) as each
//! batch is performed.
//!
//! Eviction is least-recently-used via a logical clock; the scan on
//! eviction is linear but the cache is small and eviction is off the
//! common hit path.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use crate::paging::PageId;

type CachedValue = Arc<dyn Any + Send + Sync>;

struct Entry {
    value: CachedValue,
    last_used: u64,
}

struct Inner {
    entries: HashMap<PageId, Entry>,
    clock: u64,
}

pub struct ReadCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl ReadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                clock: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, page: PageId) -> Option<CachedValue> {
        let mut inner = self.inner.lock().unwrap();
        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner.entries.get_mut(&page)?;
        entry.last_used = clock;
        Some(entry.value.clone())
    }

    pub fn insert(&self, page: PageId, value: CachedValue) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.clock += 1;
        let clock = inner.clock;
        inner.entries.insert(
            page,
            Entry {
                value,
                last_used: clock,
            },
        );
        if inner.entries.len() > self.capacity {
            if let Some(&coldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(p, _)| p)
            {
                inner.entries.remove(&coldest);
            }
        }
    }

    pub fn remove(&self, page: PageId) {
        self.inner.lock().unwrap().entries.remove(&page);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }
}
