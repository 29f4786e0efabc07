//! In-memory backend using BTreeMap buckets.
//!
//! Used by tests and ephemeral tables. Supports write-failure injection so
//! merge rollback paths can be exercised without a faulty disk.

use crate::error::{TesseraError, TesseraResult};
use crate::storage::{BatchOp, KvBackend, WriteBatch};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const NO_FAILURE: usize = usize::MAX;

pub struct MemoryBackend {
    buckets: RwLock<AHashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
    // number of batches still allowed before `apply` starts failing
    fail_after: AtomicUsize,
    applied: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(AHashMap::new()),
            fail_after: AtomicUsize::new(NO_FAILURE),
            applied: AtomicU64::new(0),
        }
    }

    /// Let `n` more batches succeed, then fail every `apply` call.
    pub fn fail_after(&self, n: usize) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        self.fail_after.store(NO_FAILURE, Ordering::SeqCst);
    }

    /// Number of successfully applied batches.
    pub fn applied_batches(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Number of keys in a bucket.
    pub fn len(&self, bucket: &str) -> usize {
        self.buckets.read().get(bucket).map_or(0, BTreeMap::len)
    }

    fn check_failure(&self) -> TesseraResult<()> {
        let res = self
            .fail_after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                NO_FAILURE => None,
                0 => None,
                n => Some(n - 1),
            });
        match res {
            // budget left (or injection disabled)
            Ok(_) => Ok(()),
            Err(NO_FAILURE) => Ok(()),
            Err(_) => Err(TesseraError::Storage(
                "injected write failure".to_string(),
            )),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, bucket: &str, key: &[u8]) -> TesseraResult<Option<Vec<u8>>> {
        let buckets = self.buckets.read();
        Ok(buckets.get(bucket).and_then(|map| map.get(key).cloned()))
    }

    fn scan(&self, bucket: &str) -> TesseraResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let buckets = self.buckets.read();
        Ok(buckets
            .get(bucket)
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn apply(&self, batch: &WriteBatch) -> TesseraResult<()> {
        self.check_failure()?;
        let mut buckets = self.buckets.write();
        for op in batch.ops() {
            match op {
                BatchOp::Put { bucket, key, value } => {
                    buckets
                        .entry(bucket.clone())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                BatchOp::Delete { bucket, key } => {
                    if let Some(map) = buckets.get_mut(bucket) {
                        map.remove(key);
                    }
                }
            }
        }
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn drop_bucket(&self, bucket: &str) -> TesseraResult<()> {
        self.buckets.write().remove(bucket);
        Ok(())
    }

    fn flush(&self) -> TesseraResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_scan() {
        let backend = MemoryBackend::new();
        backend.put("b", b"2", b"two".to_vec()).unwrap();
        backend.put("b", b"1", b"one".to_vec()).unwrap();

        assert_eq!(backend.get("b", b"1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(backend.get("missing", b"1").unwrap(), None);
        let all = backend.scan("b").unwrap();
        assert_eq!(all[0].0, b"1".to_vec());
        assert_eq!(backend.len("b"), 2);
    }

    #[test]
    fn test_failure_injection() {
        let backend = MemoryBackend::new();
        backend.fail_after(1);
        backend.put("b", b"1", vec![1]).unwrap();
        assert!(backend.put("b", b"2", vec![2]).is_err());
        assert!(backend.put("b", b"3", vec![3]).is_err());
        assert_eq!(backend.len("b"), 1);

        backend.heal();
        backend.put("b", b"2", vec![2]).unwrap();
        assert_eq!(backend.applied_batches(), 2);
    }

    #[test]
    fn test_failed_batch_writes_nothing() {
        let backend = MemoryBackend::new();
        backend.fail_after(0);
        let mut batch = WriteBatch::new();
        batch.put("a", b"k", vec![1]).put("b", b"k", vec![2]);
        assert!(backend.apply(&batch).is_err());
        assert_eq!(backend.len("a") + backend.len("b"), 0);
    }
}
