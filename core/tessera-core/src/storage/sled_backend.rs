//! sled-backed durable storage.
//!
//! Each bucket maps to a sled `Tree`. Batches spanning several buckets are
//! applied in one multi-tree transaction.

use crate::error::{TesseraError, TesseraResult};
use crate::storage::{BatchOp, KvBackend, WriteBatch};
use sled::Transactional;
use sled::transaction::TransactionError;
use std::path::Path;

pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    /// Open a database at the given directory path.
    pub fn open(path: &Path) -> TesseraResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Open a temporary database (for testing). Data is deleted on drop.
    pub fn open_temporary() -> TesseraResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Ok(Self { db })
    }

    fn tree(&self, bucket: &str) -> TesseraResult<sled::Tree> {
        Ok(self.db.open_tree(bucket)?)
    }
}

impl KvBackend for SledBackend {
    fn get(&self, bucket: &str, key: &[u8]) -> TesseraResult<Option<Vec<u8>>> {
        let tree = self.tree(bucket)?;
        Ok(tree.get(key)?.map(|ivec| ivec.to_vec()))
    }

    fn scan(&self, bucket: &str) -> TesseraResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let tree = self.tree(bucket)?;
        let mut result = Vec::new();
        for item in tree.iter() {
            let (k, v) = item?;
            result.push((k.to_vec(), v.to_vec()));
        }
        Ok(result)
    }

    fn apply(&self, batch: &WriteBatch) -> TesseraResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // one tree per distinct bucket, ops refer to trees by slot
        let mut names: Vec<&str> = Vec::new();
        let mut slots = Vec::with_capacity(batch.len());
        for op in batch.ops() {
            let slot = match names.iter().position(|n| *n == op.bucket()) {
                Some(i) => i,
                None => {
                    names.push(op.bucket());
                    names.len() - 1
                }
            };
            slots.push(slot);
        }
        let trees = names
            .iter()
            .map(|n| self.tree(n))
            .collect::<TesseraResult<Vec<_>>>()?;

        let res: Result<(), TransactionError<()>> = trees.as_slice().transaction(|views| {
            for (op, slot) in batch.ops().iter().zip(&slots) {
                let view = &views[*slot];
                match op {
                    BatchOp::Put { key, value, .. } => {
                        view.insert(key.as_slice(), value.as_slice())?;
                    }
                    BatchOp::Delete { key, .. } => {
                        view.remove(key.as_slice())?;
                    }
                }
            }
            Ok(())
        });

        match res {
            Ok(()) => Ok(()),
            Err(TransactionError::Storage(e)) => Err(e.into()),
            Err(TransactionError::Abort(())) => {
                Err(TesseraError::Storage("batch transaction aborted".to_string()))
            }
        }
    }

    fn drop_bucket(&self, bucket: &str) -> TesseraResult<()> {
        self.db.drop_tree(bucket)?;
        Ok(())
    }

    fn flush(&self) -> TesseraResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_across_buckets() {
        let backend = SledBackend::open_temporary().unwrap();
        let mut batch = WriteBatch::new();
        batch
            .put("t_data", b"\0\0\0\x01", b"pack".to_vec())
            .put("t_meta", b"\0\0\0\x01", b"stats".to_vec());
        backend.apply(&batch).unwrap();

        assert_eq!(
            backend.get("t_data", b"\0\0\0\x01").unwrap(),
            Some(b"pack".to_vec())
        );
        assert_eq!(backend.scan("t_meta").unwrap().len(), 1);

        let mut batch = WriteBatch::new();
        batch
            .delete("t_data", b"\0\0\0\x01")
            .delete("t_meta", b"\0\0\0\x01");
        backend.apply(&batch).unwrap();
        assert!(backend.scan("t_data").unwrap().is_empty());
    }

    #[test]
    fn test_drop_bucket() {
        let backend = SledBackend::open_temporary().unwrap();
        backend.put("b", b"k", b"v".to_vec()).unwrap();
        backend.drop_bucket("b").unwrap();
        assert_eq!(backend.get("b", b"k").unwrap(), None);
        // dropping again is fine
        backend.drop_bucket("b").unwrap();
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = SledBackend::open(dir.path()).unwrap();
            backend.put("b", b"k", b"v".to_vec()).unwrap();
            backend.flush().unwrap();
        }
        let backend = SledBackend::open(dir.path()).unwrap();
        assert_eq!(backend.get("b", b"k").unwrap(), Some(b"v".to_vec()));
    }
}
