//! Statistics index: ordered catalog of stored packs.
//!
//! Entries are kept sorted by pack key. A second position list orders them
//! by `(min_pk, max_pk)` so the merge engine can find the pack whose range
//! covers a primary key. The whole index is a value type: writers clone it,
//! mutate the copy and publish it when a merge completes.

use crate::error::{TesseraError, TesseraResult};
use crate::pack::{BlockStats, Pack};
use crate::storage::{self, KvBackend, MAX_PACK_KEY, WriteBatch};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Statistics for one stored pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackStats {
    pub key: u32,
    pub n_values: usize,
    pub min_pk: u64,
    pub max_pk: u64,
    pub blocks: Vec<BlockStats>,
    pub stored_size: usize,
    #[serde(skip)]
    pub dirty: bool,
}

impl PackStats {
    pub fn from_pack(pack: &Pack, stored_size: usize) -> Self {
        Self {
            key: pack.key(),
            n_values: pack.len(),
            min_pk: pack.min_pk(),
            max_pk: pack.max_pk(),
            blocks: pack.block_stats(),
            stored_size,
            dirty: true,
        }
    }

    pub fn encode(&self) -> TesseraResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> TesseraResult<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Placement answer for a primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackRange {
    /// Position in (min, max) order, usable with [`StatsIndex::next`].
    pub slot: usize,
    pub key: u32,
    pub min: u64,
    pub max: u64,
    /// Min of the following pack in (min, max) order, 0 if there is none.
    pub next_min: u64,
    pub is_full: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StatsIndex {
    packs: Vec<PackStats>,
    pos: Vec<usize>,
    removed: Vec<u32>,
    max_rows: usize,
}

impl StatsIndex {
    pub fn new(max_rows: usize) -> Self {
        Self {
            max_rows,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Entries in pack-key order.
    pub fn iter(&self) -> impl Iterator<Item = &PackStats> {
        self.packs.iter()
    }

    /// Entries in (min_pk, max_pk) order.
    pub fn iter_by_range(&self) -> impl Iterator<Item = &PackStats> {
        self.pos.iter().map(|&p| &self.packs[p])
    }

    pub fn get_by_key(&self, key: u32) -> Option<&PackStats> {
        self.packs
            .binary_search_by_key(&key, |p| p.key)
            .ok()
            .map(|i| &self.packs[i])
    }

    /// Insert or replace the entry for `stats.key`. The entry becomes dirty.
    pub fn add_or_update(&mut self, mut stats: PackStats) {
        stats.dirty = true;
        self.removed.retain(|k| *k != stats.key);
        match self.packs.binary_search_by_key(&stats.key, |p| p.key) {
            Ok(i) => self.packs[i] = stats,
            Err(i) => self.packs.insert(i, stats),
        }
        self.sort();
    }

    /// Drop the entry for `key`; returns whether it existed.
    pub fn remove(&mut self, key: u32) -> bool {
        match self.packs.binary_search_by_key(&key, |p| p.key) {
            Ok(i) => {
                self.packs.remove(i);
                self.removed.push(key);
                self.sort();
                true
            }
            Err(_) => false,
        }
    }

    /// Key for a brand-new pack: last key + 1, or 0 for an empty index.
    pub fn next_key(&self) -> TesseraResult<u32> {
        let next = match self.packs.last() {
            Some(p) => p.key.checked_add(1).unwrap_or(MAX_PACK_KEY),
            None => 0,
        };
        if next >= MAX_PACK_KEY {
            return Err(TesseraError::Storage("pack key space exhausted".to_string()));
        }
        Ok(next)
    }

    /// Total number of rows across all packs.
    pub fn count(&self) -> u64 {
        self.packs.iter().map(|p| p.n_values as u64).sum()
    }

    /// Smallest and largest primary key over all packs, `(0, 0)` if empty.
    pub fn global_min_max(&self) -> (u64, u64) {
        let min = self.pos.first().map_or(0, |&p| self.packs[p].min_pk);
        let max = self.packs.iter().map(|p| p.max_pk).max().unwrap_or(0);
        (min, max)
    }

    pub fn is_full(&self, stats: &PackStats) -> bool {
        self.max_rows > 0 && stats.n_values >= self.max_rows
    }

    /// The pack with the largest `min_pk <= pk`, or the first pack when `pk`
    /// is below every pack. `None` for an empty index.
    pub fn best(&self, pk: u64) -> Option<PackRange> {
        if self.pos.is_empty() {
            return None;
        }
        let i = self
            .pos
            .partition_point(|&p| self.packs[p].min_pk <= pk)
            .saturating_sub(1);
        Some(self.range_at(i))
    }

    /// The pack following `slot` in (min, max) order.
    pub fn next(&self, slot: usize) -> Option<PackRange> {
        (slot + 1 < self.pos.len()).then(|| self.range_at(slot + 1))
    }

    /// Smallest `min_pk` strictly greater than `pk`, 0 if none.
    pub fn min_above(&self, pk: u64) -> u64 {
        let i = self.pos.partition_point(|&p| self.packs[p].min_pk <= pk);
        self.pos.get(i).map_or(0, |&p| self.packs[p].min_pk)
    }

    fn range_at(&self, slot: usize) -> PackRange {
        let p = &self.packs[self.pos[slot]];
        PackRange {
            slot,
            key: p.key,
            min: p.min_pk,
            max: p.max_pk,
            next_min: self
                .pos
                .get(slot + 1)
                .map_or(0, |&n| self.packs[n].min_pk),
            is_full: self.is_full(p),
        }
    }

    fn sort(&mut self) {
        let packs = &self.packs;
        self.pos = (0..packs.len()).collect();
        self.pos
            .sort_by_key(|&i| (packs[i].min_pk, packs[i].max_pk, packs[i].key));
    }

    /// Clear the dirty flag of one entry after it was written elsewhere.
    pub fn mark_clean(&mut self, key: u32) {
        if let Ok(i) = self.packs.binary_search_by_key(&key, |p| p.key) {
            self.packs[i].dirty = false;
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.removed.is_empty() || self.packs.iter().any(|p| p.dirty)
    }

    /// Add pending writes (dirty entries and removals) to `batch` and reset
    /// the pending state.
    pub fn store_into(&mut self, batch: &mut WriteBatch, meta: &str) -> TesseraResult<()> {
        for p in self.packs.iter_mut().filter(|p| p.dirty) {
            batch.put(meta, &storage::pack_key(p.key), p.encode()?);
            p.dirty = false;
        }
        for key in self.removed.drain(..) {
            batch.delete(meta, &storage::pack_key(key));
        }
        Ok(())
    }

    /// Persist pending writes in one batch.
    pub fn store(&mut self, backend: &dyn KvBackend, meta: &str) -> TesseraResult<()> {
        let mut batch = WriteBatch::new();
        self.store_into(&mut batch, meta)?;
        if !batch.is_empty() {
            debug!(entries = batch.len(), bucket = meta, "storing pack statistics");
            backend.apply(&batch)?;
        }
        Ok(())
    }

    /// Load all entries from the metadata bucket.
    pub fn load(backend: &dyn KvBackend, meta: &str, max_rows: usize) -> TesseraResult<Self> {
        let mut index = Self::new(max_rows);
        for (k, v) in backend.scan(meta)? {
            let key = storage::parse_pack_key(&k).ok_or_else(|| {
                TesseraError::Storage(format!("{meta}: malformed statistics key {k:?}"))
            })?;
            let stats = PackStats::decode(&v)?;
            if stats.key != key {
                return Err(TesseraError::Storage(format!(
                    "{meta}: statistics for pack {} stored under key {key}",
                    stats.key
                )));
            }
            index.packs.push(stats);
        }
        index.packs.sort_by_key(|p| p.key);
        index.sort();
        Ok(index)
    }

    /// Delete all persisted entries and clear the index.
    pub fn drop_all(&mut self, backend: &dyn KvBackend, meta: &str) -> TesseraResult<()> {
        backend.drop_bucket(meta)?;
        self.packs.clear();
        self.pos.clear();
        self.removed.clear();
        Ok(())
    }

    /// Bytes used by the serialized entries.
    pub fn meta_size(&self) -> usize {
        self.packs
            .iter()
            .map(|p| bincode::serialized_size(p).map_or(0, |n| n as usize))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn entry(key: u32, min: u64, max: u64, n: usize) -> PackStats {
        PackStats {
            key,
            n_values: n,
            min_pk: min,
            max_pk: max,
            blocks: Vec::new(),
            stored_size: 0,
            dirty: false,
        }
    }

    fn index() -> StatsIndex {
        let mut idx = StatsIndex::new(4);
        idx.add_or_update(entry(0, 1, 4, 4));
        idx.add_or_update(entry(2, 20, 30, 2));
        idx.add_or_update(entry(1, 10, 15, 4));
        idx
    }

    #[test]
    fn test_best_and_next() {
        let idx = index();

        let best = idx.best(12).unwrap();
        assert_eq!((best.key, best.min, best.max), (1, 10, 15));
        assert_eq!(best.next_min, 20);
        assert!(best.is_full);

        // below every pack: first pack
        assert_eq!(idx.best(0).unwrap().key, 0);
        // above every pack: last pack
        let last = idx.best(99).unwrap();
        assert_eq!(last.key, 2);
        assert_eq!(last.next_min, 0);

        let next = idx.next(best.slot).unwrap();
        assert_eq!(next.key, 2);
        assert!(!next.is_full);
        assert!(idx.next(next.slot).is_none());
        assert!(StatsIndex::new(4).best(1).is_none());
    }

    #[test]
    fn test_next_key_and_count() {
        let mut idx = index();
        assert_eq!(idx.next_key().unwrap(), 3);
        assert_eq!(idx.count(), 10);
        assert_eq!(idx.global_min_max(), (1, 30));

        assert!(idx.remove(2));
        assert!(!idx.remove(2));
        assert_eq!(idx.next_key().unwrap(), 2);
        assert_eq!(StatsIndex::new(4).next_key().unwrap(), 0);
    }

    #[test]
    fn test_next_key_respects_reserved_range() {
        let mut idx = StatsIndex::new(4);
        idx.add_or_update(entry(MAX_PACK_KEY - 1, 1, 2, 2));
        assert!(idx.next_key().is_err());
    }

    #[test]
    fn test_min_above() {
        let idx = index();
        assert_eq!(idx.min_above(0), 1);
        assert_eq!(idx.min_above(5), 10);
        assert_eq!(idx.min_above(25), 0);
    }

    #[test]
    fn test_store_and_load() {
        let backend = MemoryBackend::new();
        let mut idx = index();
        assert!(idx.is_dirty());
        idx.store(&backend, "t_meta").unwrap();
        assert!(!idx.is_dirty());

        idx.remove(1);
        idx.store(&backend, "t_meta").unwrap();

        let loaded = StatsIndex::load(&backend, "t_meta", 4).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get_by_key(2).unwrap().min_pk, 20);
        assert!(loaded.get_by_key(1).is_none());
        assert!(!loaded.is_dirty());
    }

    #[test]
    fn test_clone_is_independent() {
        let idx = index();
        let mut copy = idx.clone();
        copy.remove(0);
        assert_eq!(idx.len(), 3);
        assert_eq!(copy.len(), 2);
    }
}
