//! Per-table counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters owned by one table and updated without taking the table lock.
#[derive(Debug, Default)]
pub struct TableMetrics {
    pub insert_calls: AtomicU64,
    pub update_calls: AtomicU64,
    pub delete_calls: AtomicU64,
    pub inserted_tuples: AtomicU64,
    pub updated_tuples: AtomicU64,
    pub deleted_tuples: AtomicU64,
    pub tuple_count: AtomicU64,
    pub flush_calls: AtomicU64,
    pub flushed_tuples: AtomicU64,
    pub last_flush_micros: AtomicU64,
    pub packs_count: AtomicU64,
    pub packs_loaded: AtomicU64,
    pub packs_stored: AtomicU64,
    pub pack_splits: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub meta_size: AtomicU64,
    pub journal_tuples: AtomicU64,
    pub tomb_tuples: AtomicU64,
    pub compact_calls: AtomicU64,
    pub compacted_tuples: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_packs: AtomicU64,
}

/// Point-in-time copy of [`TableMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub insert_calls: u64,
    pub update_calls: u64,
    pub delete_calls: u64,
    pub inserted_tuples: u64,
    pub updated_tuples: u64,
    pub deleted_tuples: u64,
    pub tuple_count: u64,
    pub flush_calls: u64,
    pub flushed_tuples: u64,
    pub last_flush_micros: u64,
    pub packs_count: u64,
    pub packs_loaded: u64,
    pub packs_stored: u64,
    pub pack_splits: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub meta_size: u64,
    pub journal_tuples: u64,
    pub tomb_tuples: u64,
    pub compact_calls: u64,
    pub compacted_tuples: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_packs: u64,
}

impl TableMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(counter: &AtomicU64, n: u64) {
        counter.store(n, Ordering::Relaxed);
    }

    pub fn record_flush(&self, tuples: u64, elapsed: Duration) {
        Self::add(&self.flush_calls, 1);
        Self::add(&self.flushed_tuples, tuples);
        Self::set(
            &self.last_flush_micros,
            u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            insert_calls: get(&self.insert_calls),
            update_calls: get(&self.update_calls),
            delete_calls: get(&self.delete_calls),
            inserted_tuples: get(&self.inserted_tuples),
            updated_tuples: get(&self.updated_tuples),
            deleted_tuples: get(&self.deleted_tuples),
            tuple_count: get(&self.tuple_count),
            flush_calls: get(&self.flush_calls),
            flushed_tuples: get(&self.flushed_tuples),
            last_flush_micros: get(&self.last_flush_micros),
            packs_count: get(&self.packs_count),
            packs_loaded: get(&self.packs_loaded),
            packs_stored: get(&self.packs_stored),
            pack_splits: get(&self.pack_splits),
            bytes_read: get(&self.bytes_read),
            bytes_written: get(&self.bytes_written),
            meta_size: get(&self.meta_size),
            journal_tuples: get(&self.journal_tuples),
            tomb_tuples: get(&self.tomb_tuples),
            compact_calls: get(&self.compact_calls),
            compacted_tuples: get(&self.compacted_tuples),
            cache_hits: get(&self.cache_hits),
            cache_misses: get(&self.cache_misses),
            cache_packs: get(&self.cache_packs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let m = TableMetrics::new();
        TableMetrics::add(&m.inserted_tuples, 5);
        TableMetrics::set(&m.tuple_count, 3);
        m.record_flush(5, Duration::from_millis(2));

        let snap = m.snapshot();
        assert_eq!(snap.inserted_tuples, 5);
        assert_eq!(snap.tuple_count, 3);
        assert_eq!(snap.flush_calls, 1);
        assert_eq!(snap.last_flush_micros, 2000);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"flushed_tuples\":5"));
    }
}
