//! Storage module: key/value backends for packs, statistics and state.
//!
//! Every backend implements the [`KvBackend`] trait. The table layer only
//! depends on this trait.
//!
//! # Layout
//!
//! Each table owns three buckets:
//!
//! - `{name}_data`: pack blobs keyed by big-endian `u32` pack key, plus the
//!   journal and tomb under [`JOURNAL_KEY`] and [`TOMB_KEY`]
//! - `{name}_meta`: per-pack statistics keyed like the data bucket
//! - `{name}_state`: table state and schema

pub mod memory;
pub mod sled_backend;

pub use memory::MemoryBackend;
pub use sled_backend::SledBackend;

use crate::error::TesseraResult;

/// Data-bucket key of the persisted journal.
pub const JOURNAL_KEY: u32 = 0xFFFF_FFFF;

/// Data-bucket key of the persisted tombstone bitmap.
pub const TOMB_KEY: u32 = 0xFFFF_FFFE;

/// Pack keys must stay below this value.
pub const MAX_PACK_KEY: u32 = TOMB_KEY;

pub fn data_bucket(table: &str) -> String {
    format!("{table}_data")
}

pub fn meta_bucket(table: &str) -> String {
    format!("{table}_meta")
}

pub fn state_bucket(table: &str) -> String {
    format!("{table}_state")
}

/// Bucket names of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableBuckets {
    pub data: String,
    pub meta: String,
    pub state: String,
}

impl TableBuckets {
    pub fn new(table: &str) -> Self {
        Self {
            data: data_bucket(table),
            meta: meta_bucket(table),
            state: state_bucket(table),
        }
    }
}

/// Storage key for a pack (big-endian so buckets iterate in key order).
pub fn pack_key(key: u32) -> [u8; 4] {
    key.to_be_bytes()
}

/// Inverse of [`pack_key`]; `None` for keys of another width.
pub fn parse_pack_key(raw: &[u8]) -> Option<u32> {
    let b: [u8; 4] = raw.try_into().ok()?;
    Some(u32::from_be_bytes(b))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        bucket: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        bucket: String,
        key: Vec<u8>,
    },
}

impl BatchOp {
    pub fn bucket(&self) -> &str {
        match self {
            BatchOp::Put { bucket, .. } | BatchOp::Delete { bucket, .. } => bucket,
        }
    }
}

/// An ordered set of writes applied atomically by [`KvBackend::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, bucket: &str, key: &[u8], value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            bucket: bucket.to_string(),
            key: key.to_vec(),
            value,
        });
        self
    }

    pub fn delete(&mut self, bucket: &str, key: &[u8]) -> &mut Self {
        self.ops.push(BatchOp::Delete {
            bucket: bucket.to_string(),
            key: key.to_vec(),
        });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Total payload bytes written by this batch.
    pub fn size(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                BatchOp::Put { key, value, .. } => key.len() + value.len(),
                BatchOp::Delete { key, .. } => key.len(),
            })
            .sum()
    }
}

/// Key/value storage interface.
///
/// # Contract
///
/// - `get`: `None` for missing keys or buckets, never an error.
/// - `scan`: all pairs of a bucket in key order.
/// - `apply`: all operations of a batch become visible together or not at
///   all, across buckets.
/// - `drop_bucket`: removes a bucket and its content; missing buckets are
///   not an error.
/// - `flush`: persists buffered writes.
pub trait KvBackend: Send + Sync {
    fn get(&self, bucket: &str, key: &[u8]) -> TesseraResult<Option<Vec<u8>>>;

    fn scan(&self, bucket: &str) -> TesseraResult<Vec<(Vec<u8>, Vec<u8>)>>;

    fn apply(&self, batch: &WriteBatch) -> TesseraResult<()>;

    fn drop_bucket(&self, bucket: &str) -> TesseraResult<()>;

    fn flush(&self) -> TesseraResult<()>;

    /// Put a single key.
    fn put(&self, bucket: &str, key: &[u8], value: Vec<u8>) -> TesseraResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(bucket, key, value);
        self.apply(&batch)
    }
}
