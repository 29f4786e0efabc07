//! Journal: in-memory write buffer for rows that are not merged yet.
//!
//! Rows are appended to a columnar data pack in arrival order. A separate
//! key list maps every primary key to its data position and is kept sorted
//! by primary key at all times. Deleted keys are collected in a tombstone
//! bitmap; rows that live in the journal are additionally flagged in a
//! per-position bit vector and their pk column value is zeroed.

use crate::error::{TesseraError, TesseraResult};
use crate::pack::Pack;
use crate::schema::{Schema, WireView};
use ahash::AHashMap;
use bitvec::prelude::*;
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

mod persist;

/// Key list growth granularity.
const KEY_BLOCK: usize = 256;

/// One entry of the sorted key list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalKey {
    pub pk: u64,
    /// Position in the data pack.
    pub idx: usize,
}

#[derive(Debug, Clone)]
pub struct Journal {
    data: Pack,
    keys: Vec<JournalKey>,
    tomb: RoaringTreemap,
    deleted: BitVec<u64, Lsb0>,
    maxid: u64,
    maxsize: usize,
}

fn round_size(n: usize) -> usize {
    n.div_ceil(KEY_BLOCK) * KEY_BLOCK
}

impl Journal {
    pub fn new(schema: Arc<Schema>, maxsize: usize) -> Self {
        Self {
            data: Pack::new(schema, maxsize),
            keys: Vec::with_capacity(round_size(maxsize.min(1 << 16))),
            tomb: RoaringTreemap::new(),
            deleted: BitVec::new(),
            maxid: 0,
            maxsize,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.data.schema()
    }

    pub fn data(&self) -> &Pack {
        &self.data
    }

    pub fn keys(&self) -> &[JournalKey] {
        &self.keys
    }

    pub fn tomb(&self) -> &RoaringTreemap {
        &self.tomb
    }

    /// Number of buffered rows, including deleted ones.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.tomb.is_empty()
    }

    pub fn tomb_len(&self) -> u64 {
        self.tomb.len()
    }

    pub fn max_id(&self) -> u64 {
        self.maxid
    }

    pub fn max_size(&self) -> usize {
        self.maxsize
    }

    /// Either the data buffer or the tombstone set reached capacity.
    pub fn is_full(&self) -> bool {
        self.data.len() >= self.maxsize || self.tomb.len() >= self.maxsize as u64
    }

    /// Whether the row at data position `idx` is logically deleted.
    pub fn is_deleted_at(&self, idx: usize) -> bool {
        self.deleted.get(idx).is_some_and(|b| *b)
    }

    /// Whether `pk` is tombstoned.
    pub fn is_deleted(&self, pk: u64) -> bool {
        self.tomb.contains(pk)
    }

    /// Live journal rows, in primary-key order.
    pub fn live_keys(&self) -> impl Iterator<Item = &JournalKey> {
        self.keys.iter().filter(|k| !self.is_deleted_at(k.idx))
    }

    /// Append rows from `buf`, assigning primary keys from `next_seq` on.
    ///
    /// Stops once the journal is full and returns the number of rows taken
    /// together with the unconsumed remainder of `buf`.
    pub fn insert_batch<'a>(
        &mut self,
        buf: &'a [u8],
        next_seq: u64,
    ) -> TesseraResult<(usize, &'a [u8])> {
        let schema = self.data.schema().clone();
        let mut buf = buf;
        let mut new_keys = Vec::new();

        while !buf.is_empty() && self.data.len() < self.maxsize {
            let (view, rest) = WireView::cut(&schema, buf)?;
            let pk = next_seq + new_keys.len() as u64;
            self.data.append_wire(&view)?;
            let idx = self.data.len() - 1;
            if view.pk() != pk {
                self.data.set_pk(idx, pk);
            }
            new_keys.push(JournalKey { pk, idx });
            self.deleted.push(false);
            self.maxid = self.maxid.max(pk);
            buf = rest;
        }

        let count = new_keys.len();
        self.merge_keys(new_keys);
        Ok((count, buf))
    }

    /// Insert or overwrite rows carrying explicit primary keys.
    ///
    /// A row whose key is already buffered is overwritten in place and
    /// undeleted. New keys are appended until the journal is full, in which
    /// case the remainder starting at that row is returned.
    ///
    /// A zero primary key fails the batch with [`TesseraError::NoKey`]. Rows
    /// processed before the offending one stay applied; the returned
    /// remainder starts at the offending row.
    pub fn update_batch<'a>(&mut self, buf: &'a [u8]) -> (usize, &'a [u8], Option<TesseraError>) {
        let schema = self.data.schema().clone();
        let mut buf = buf;
        let mut new_keys: Vec<JournalKey> = Vec::new();
        // keys appended by this batch are not in the sorted list yet
        let mut pending: AHashMap<u64, usize> = AHashMap::new();
        let mut count = 0;
        let mut err = None;

        while !buf.is_empty() {
            let (view, rest) = match WireView::cut(&schema, buf) {
                Ok(v) => v,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            };
            let pk = view.pk();
            if pk == 0 {
                err = Some(TesseraError::NoKey);
                break;
            }

            let found = self.pk_index(pk, 0).0.or_else(|| pending.get(&pk).copied());
            let res = match found {
                Some(idx) => {
                    self.undelete(pk);
                    self.data.set_wire(idx, &view)
                }
                None => {
                    if self.data.len() >= self.maxsize {
                        break;
                    }
                    // the key may live in a stored pack and have been deleted
                    self.tomb.remove(pk);
                    let res = self.data.append_wire(&view);
                    if res.is_ok() {
                        let idx = self.data.len() - 1;
                        pending.insert(pk, idx);
                        new_keys.push(JournalKey { pk, idx });
                        self.deleted.push(false);
                        self.maxid = self.maxid.max(pk);
                    }
                    res
                }
            };
            if let Err(e) = res {
                err = Some(e);
                break;
            }
            count += 1;
            buf = rest;
        }

        new_keys.sort_unstable_by_key(|k| k.pk);
        self.merge_keys(new_keys);
        (count, buf, err)
    }

    /// Tombstone every key in `pks`. Returns how many keys were not
    /// tombstoned before.
    pub fn delete_batch(&mut self, pks: &RoaringTreemap) -> u64 {
        let before = self.tomb.len();
        let mut hint = 0;
        for pk in pks.iter() {
            if pk == 0 {
                continue;
            }
            let (idx, next) = self.pk_index(pk, hint);
            hint = next;
            if let Some(idx) = idx
                && !self.is_deleted_at(idx)
            {
                self.data.set_pk(idx, 0);
                self.deleted.set(idx, true);
            }
        }
        self.tomb |= pks;
        self.tomb.remove(0);
        self.tomb.len() - before
    }

    /// Binary search for `pk` in the key list from position `hint`.
    ///
    /// Returns the data position, even for deleted rows, and the key-list
    /// position to use as the hint for the next larger key.
    pub fn pk_index(&self, pk: u64, hint: usize) -> (Option<usize>, usize) {
        if pk > self.maxid || hint >= self.keys.len() {
            return (None, self.keys.len());
        }
        let i = hint + self.keys[hint..].partition_point(|k| k.pk < pk);
        match self.keys.get(i) {
            Some(k) if k.pk == pk => (Some(k.idx), i),
            _ => (None, i),
        }
    }

    fn undelete(&mut self, pk: u64) {
        if !self.tomb.contains(pk) {
            return;
        }
        if let (Some(idx), _) = self.pk_index(pk, 0) {
            self.deleted.set(idx, false);
            self.data.set_pk(idx, pk);
        }
        self.tomb.remove(pk);
    }

    /// Merge `new_keys` (sorted, disjoint from the current keys) into the
    /// key list without a full sort.
    pub(crate) fn merge_keys(&mut self, new_keys: Vec<JournalKey>) {
        if new_keys.is_empty() {
            return;
        }
        let need = self.keys.len() + new_keys.len();
        if need > self.keys.capacity() {
            self.keys.reserve_exact(round_size(need) - self.keys.len());
        }

        // fast path: everything goes behind the current maximum
        if self.keys.last().is_none_or(|last| last.pk < new_keys[0].pk) {
            self.keys.extend_from_slice(&new_keys);
            return;
        }

        // backward merge in place, writing from the tail
        let mut i = self.keys.len();
        let mut j = new_keys.len();
        self.keys.resize(need, JournalKey::default());
        let mut k = need;
        while j > 0 {
            k -= 1;
            if i > 0 && self.keys[i - 1].pk > new_keys[j - 1].pk {
                self.keys[k] = self.keys[i - 1];
                i -= 1;
            } else {
                self.keys[k] = new_keys[j - 1];
                j -= 1;
            }
        }
    }

    /// Clear all buffered state for reuse after a merge.
    pub fn reset(&mut self) {
        self.data.clear();
        self.keys.clear();
        self.tomb.clear();
        self.deleted.clear();
        self.maxid = 0;
    }

    /// Remove rows whose primary key is `>= first_pk` when they occupy the
    /// tail of the data buffer. Returns `false`, changing nothing, otherwise.
    pub fn rollback_tail(&mut self, first_pk: u64) -> bool {
        let start = self.keys.partition_point(|k| k.pk < first_pk);
        let n = self.keys.len() - start;
        let base = self.data.len() - n.min(self.data.len());
        if self.keys[start..].iter().any(|k| k.idx < base) {
            return false;
        }
        self.data.truncate(base);
        self.keys.truncate(start);
        self.deleted.truncate(base);
        self.tomb.remove_range(first_pk..);
        self.maxid = self.keys.last().map_or(0, |k| k.pk);
        true
    }

    /// Verify the structural invariants.
    pub fn check_invariants(&self) -> TesseraResult<()> {
        let n = self.data.len();
        if self.keys.len() != n || self.deleted.len() != n {
            return Err(TesseraError::InvariantViolation(format!(
                "length mismatch: data={n} keys={} deleted={}",
                self.keys.len(),
                self.deleted.len()
            )));
        }
        for w in self.keys.windows(2) {
            if w[0].pk >= w[1].pk {
                return Err(TesseraError::InvariantViolation(format!(
                    "keys not strictly increasing: {} then {}",
                    w[0].pk, w[1].pk
                )));
            }
        }
        let mut seen = RoaringTreemap::new();
        for (i, &pk) in self.data.pk_column().iter().enumerate() {
            if pk != 0 && !seen.insert(pk) {
                return Err(TesseraError::InvariantViolation(format!(
                    "duplicate pk {pk} at data position {i}"
                )));
            }
        }
        for k in &self.keys {
            let stored = self.data.pk_at(k.idx);
            if self.is_deleted_at(k.idx) {
                if stored != 0 || !self.tomb.contains(k.pk) {
                    return Err(TesseraError::InvariantViolation(format!(
                        "deleted pk {} not marked consistently",
                        k.pk
                    )));
                }
            } else if stored != k.pk {
                return Err(TesseraError::InvariantViolation(format!(
                    "key {} maps to row holding pk {stored}",
                    k.pk
                )));
            }
        }
        Ok(())
    }
}
