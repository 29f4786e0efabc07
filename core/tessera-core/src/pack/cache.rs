//! Shared cache of decoded packs.
//!
//! Reads hand out `Arc<Pack>` clones so a cached pack can be used without
//! holding the cache lock. Writers never mutate a cached pack: the merge
//! engine works on its own copy and drops the cached entry once the new
//! version is stored.

use super::Pack;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// LRU cache keyed by pack key. A capacity of 0 disables caching.
pub struct PackCache {
    inner: Option<Mutex<LruCache<u32, Arc<Pack>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PackCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn get(&self, key: u32) -> Option<Arc<Pack>> {
        let found = self.inner.as_ref()?.lock().get(&key).cloned();
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Same as [`get`](Self::get) without touching the LRU order or the
    /// hit counters.
    pub fn peek(&self, key: u32) -> Option<Arc<Pack>> {
        self.inner.as_ref()?.lock().peek(&key).cloned()
    }

    pub fn insert(&self, key: u32, pack: Arc<Pack>) {
        if let Some(inner) = &self.inner {
            inner.lock().put(key, pack);
        }
    }

    pub fn invalidate(&self, key: u32) {
        if let Some(inner) = &self.inner {
            inner.lock().pop(&key);
        }
    }

    pub fn purge(&self) {
        if let Some(inner) = &self.inner {
            inner.lock().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |c| c.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PackCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackCache")
            .field("len", &self.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
