//! Merge engine: moves journal content into stored packs.
//!
//! The engine walks the journal's sorted live keys and the sorted tombstone
//! stream together, pack by pack. For every event it picks the stored pack
//! whose key range covers the primary key (or a pack with room, or a new
//! pack), applies deletes, updates, appends and out-of-order inserts, and
//! splits full packs when an insert lands inside their range. Each pack is
//! written together with its statistics entry in one backend batch.

use crate::error::{TesseraError, TesseraResult};
use crate::journal::{Journal, JournalKey};
use crate::pack::{Pack, PackCache};
use crate::schema::Schema;
use crate::stats::{PackRange, PackStats, StatsIndex};
use crate::storage::{self, KvBackend, TableBuckets, WriteBatch};
use crate::table::index::IndexHook;
use crate::table::metrics::TableMetrics;
use crate::table::state::TableState;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, instrument, warn};

/// Cooperative cancellation flag, checked by the merge engine whenever it is
/// about to open another pack.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consume a pending cancellation, returning whether one was set.
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Where an event with a given primary key should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Existing(PackRange),
    /// Create a pack; it must stay below `next_min` (0 = unbounded).
    New { next_min: u64 },
}

/// Pick the pack for `pk`.
///
/// A pack whose range contains `pk` always wins, as does the best candidate
/// while it still has room. A key past the end of a full pack may go into
/// the following pack when that one has room; everything else needs a new
/// pack.
pub(crate) fn find_best_pack(stats: &StatsIndex, pk: u64) -> Target {
    let Some(best) = stats.best(pk) else {
        return Target::New { next_min: 0 };
    };

    // unsigned range check: min <= pk <= max
    if !best.is_full || pk.wrapping_sub(best.min) <= best.max.wrapping_sub(best.min) {
        return Target::Existing(best);
    }

    if pk > best.max
        && best.next_min > 0
        && pk < best.next_min
        && let Some(next) = stats.next(best.slot)
        && !next.is_full
    {
        return Target::Existing(next);
    }

    Target::New {
        next_min: stats.min_above(pk),
    }
}

/// Iteration guard against merge loops that make no progress.
#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    iterations: usize,
    limit: usize,
    warned: bool,
}

const BREAKER_FACTOR: usize = 8;

impl CircuitBreaker {
    /// `limit = 8 * (packs + ceil(events / pack_size) + 1)`
    pub(crate) fn new(packs: usize, events: usize, pack_size: usize) -> Self {
        Self {
            iterations: 0,
            limit: BREAKER_FACTOR * (packs + events.div_ceil(pack_size.max(1)) + 1),
            warned: false,
        }
    }

    /// Account for a pack added by a split.
    pub(crate) fn grow(&mut self) {
        self.limit += BREAKER_FACTOR;
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn tick(&mut self, table: &str) -> TesseraResult<()> {
        self.iterations += 1;
        if self.iterations > self.limit {
            error!(
                table,
                iterations = self.iterations,
                limit = self.limit,
                "merge circuit breaker tripped"
            );
            return Err(TesseraError::DatabaseCorrupt(
                "infinite flush loop. Database likely corrupt.".to_string(),
            ));
        }
        if !self.warned && self.iterations > self.limit / 2 {
            self.warned = true;
            warn!(
                table,
                iterations = self.iterations,
                limit = self.limit,
                "merge loop is unusually long"
            );
        }
        Ok(())
    }
}

/// Result of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeSummary {
    pub journal_rows: usize,
    pub tombstones: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub packs_stored: usize,
    pub splits: usize,
    pub rows: u64,
}

/// Merge running on its own thread, see [`Table::spawn_merge`].
///
/// [`Table::spawn_merge`]: crate::Table::spawn_merge
#[must_use = "dropping the task detaches the merge thread"]
#[derive(Debug)]
pub struct MergeTask {
    handle: JoinHandle<TesseraResult<MergeSummary>>,
}

impl MergeTask {
    pub(crate) fn new(handle: JoinHandle<TesseraResult<MergeSummary>>) -> Self {
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the merge is done and return its result.
    pub fn wait(self) -> TesseraResult<MergeSummary> {
        self.handle.join().map_err(|_| {
            TesseraError::InvariantViolation("merge thread panicked".to_string())
        })?
    }
}

/// Pack currently being written.
struct Current {
    pack: Pack,
    // not yet known to the statistics index
    is_new: bool,
    next_min: u64,
    hint: usize,
}

impl Current {
    fn pmax(&self) -> u64 {
        self.pack.max_pk()
    }
}

pub(crate) struct Merger<'a> {
    pub table: &'a str,
    pub schema: &'a Arc<Schema>,
    pub backend: &'a dyn KvBackend,
    pub buckets: &'a TableBuckets,
    pub pack_size: usize,
    pub indexes: &'a [Arc<dyn IndexHook>],
    pub metrics: &'a TableMetrics,
    pub cancel: &'a CancelHandle,
    pub cache: &'a PackCache,
}

impl Merger<'_> {
    /// Merge `journal` into the packs described by `stats`.
    ///
    /// On success `stats` describes the new pack set, the journal is empty
    /// and the empty journal, statistics and `rows` are persisted. On error
    /// packs already written stay written; the caller reloads statistics
    /// from storage.
    #[instrument(skip_all, fields(table = self.table))]
    pub(crate) fn run(
        &self,
        journal: &mut Journal,
        stats: &mut StatsIndex,
        state: &mut TableState,
    ) -> TesseraResult<MergeSummary> {
        let live: Vec<JournalKey> = journal.live_keys().copied().collect();
        let (_, gmax) = stats.global_min_max();
        // tombstones above every stored key only refer to journal rows
        let dead: Vec<u64> = journal.tomb().iter().take_while(|&pk| pk <= gmax).collect();
        let (jlen, tlen) = (live.len(), dead.len());

        let mut summary = MergeSummary {
            journal_rows: jlen,
            tombstones: tlen,
            ..Default::default()
        };
        let mut breaker = CircuitBreaker::new(stats.len(), jlen + tlen, self.pack_size);
        debug!(
            journal = jlen,
            tomb = tlen,
            packs = stats.len(),
            limit = breaker.limit(),
            "merge start"
        );

        let src = journal.data();
        let mut cur: Option<Current> = None;
        let (mut jpos, mut tpos) = (0usize, 0usize);

        while jpos < jlen || tpos < tlen {
            breaker.tick(self.table)?;

            // tombstones sort before journal keys of equal value
            let next_pk = match (live.get(jpos), dead.get(tpos)) {
                (Some(j), Some(&t)) => j.pk.min(t),
                (Some(j), None) => j.pk,
                (None, Some(&t)) => t,
                (None, None) => break,
            };
            let tomb_next = dead.get(tpos).is_some_and(|&t| t == next_pk);

            let target = find_best_pack(stats, next_pk);
            let c = match cur.take() {
                Some(c) if keeps(&c, target) => c,
                prev => {
                    // leaving a pack: store it, then select again with
                    // fresh statistics
                    let mut prev = prev;
                    if let Some(p) = prev.as_mut()
                        && p.pack.is_dirty()
                    {
                        self.store_packs(&mut [&mut p.pack], stats, &mut summary)?;
                    }
                    let target = find_best_pack(stats, next_pk);
                    self.open_pack(prev, target, stats)?
                }
            };
            let c = cur.insert(c);
            let pmax = c.pmax();

            // deletes inside this pack
            if tpos < tlen && pmax > 0 && dead[tpos] <= pmax {
                let mut hint = 0;
                while tpos < tlen && dead[tpos] <= pmax {
                    let (found, at) = c.pack.find_pk(dead[tpos], hint);
                    hint = at;
                    let Some(pos) = found else {
                        tpos += 1;
                        continue;
                    };
                    let mut n = 1;
                    while tpos + n < tlen
                        && pos + n < c.pack.len()
                        && c.pack.pk_at(pos + n) == dead[tpos + n]
                    {
                        n += 1;
                    }
                    for idx in self.indexes {
                        idx.on_delete(&c.pack, pos, n)?;
                    }
                    c.pack.delete(pos, n)?;
                    tpos += n;
                    summary.deleted += n;
                }
                c.hint = 0;
                continue;
            }

            // tombstones between packs match no stored row
            if tomb_next {
                while tpos < tlen
                    && dead[tpos] > pmax
                    && (c.next_min == 0 || dead[tpos] < c.next_min)
                    && live.get(jpos).is_none_or(|j| dead[tpos] <= j.pk)
                {
                    tpos += 1;
                }
                continue;
            }

            // journal rows for this pack
            let mut split = false;
            let mut filled = false;
            while jpos < jlen {
                let key = live[jpos];
                if c.next_min > 0 && key.pk >= c.next_min {
                    break;
                }
                let pmax = c.pmax();
                let (found, at) = c.pack.find_pk(key.pk, c.hint);
                match found {
                    Some(pos) => {
                        for idx in self.indexes {
                            idx.on_update(&c.pack, pos, src, key.idx)?;
                        }
                        c.pack.replace_pack(src, pos, key.idx, 1)?;
                        c.hint = pos + 1;
                        summary.updated += 1;
                    }
                    None => {
                        let out_of_order = pmax > 0 && key.pk < pmax;
                        if c.pack.is_full() {
                            split = out_of_order;
                            break;
                        }
                        if out_of_order {
                            c.pack.insert_pack(src, at, key.idx, 1)?;
                        } else {
                            c.pack.append_pack(src, key.idx, 1)?;
                        }
                        for idx in self.indexes {
                            idx.on_insert(&c.pack, at)?;
                        }
                        c.hint = at + 1;
                        summary.inserted += 1;
                        if c.pack.is_full() {
                            filled = true;
                        }
                    }
                }
                jpos += 1;
                if filled {
                    break;
                }
            }

            if (split || filled)
                && let Some(mut c) = cur.take()
            {
                if split {
                    self.split_pack(&mut c.pack, stats, &mut summary)?;
                    breaker.grow();
                } else {
                    self.store_packs(&mut [&mut c.pack], stats, &mut summary)?;
                }
            }
        }

        if let Some(mut c) = cur.take()
            && c.pack.is_dirty()
        {
            self.store_packs(&mut [&mut c.pack], stats, &mut summary)?;
        }

        for idx in self.indexes {
            idx.sync()?;
        }

        // reconcile the row count and persist the empty journal
        let rows = stats.count();
        let next = TableState { rows, ..*state };
        let mut batch = WriteBatch::new();
        stats.store_into(&mut batch, &self.buckets.meta)?;
        next.store_into(&mut batch, &self.buckets.state)?;
        Journal::store_empty_into(self.schema, &mut batch, &self.buckets.data)?;
        self.backend.apply(&batch)?;
        TableMetrics::add(&self.metrics.bytes_written, batch.size() as u64);

        journal.reset();
        *state = next;
        summary.rows = rows;

        debug!(
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            packs = stats.len(),
            rows,
            "merge done"
        );
        Ok(summary)
    }

    /// Load or create the pack for `target`, reusing `prev` when it is the
    /// same pack.
    fn open_pack(
        &self,
        prev: Option<Current>,
        target: Target,
        stats: &StatsIndex,
    ) -> TesseraResult<Current> {
        if self.cancel.take() {
            debug!(table = self.table, "merge cancelled at pack boundary");
            return Err(TesseraError::Cancelled);
        }
        match target {
            Target::Existing(r) => {
                let pack = match prev {
                    Some(p) if p.pack.key() == r.key => p.pack,
                    _ => self.load_pack(r.key)?,
                };
                Ok(Current {
                    pack,
                    is_new: false,
                    next_min: r.next_min,
                    hint: 0,
                })
            }
            Target::New { next_min } => {
                let key = stats.next_key()?;
                Ok(Current {
                    pack: Pack::new(self.schema.clone(), self.pack_size).with_key(key),
                    is_new: true,
                    next_min,
                    hint: 0,
                })
            }
        }
    }

    /// Writable copy of stored pack `key`. A cached version is cloned
    /// instead of decoding the blob again.
    pub(super) fn load_pack(&self, key: u32) -> TesseraResult<Pack> {
        if let Some(cached) = self.cache.peek(key) {
            return Ok(Pack::clone(&cached));
        }
        let raw = self
            .backend
            .get(&self.buckets.data, &storage::pack_key(key))?
            .ok_or_else(|| {
                TesseraError::Storage(format!("{}: pack {key} is missing", self.table))
            })?;
        TableMetrics::add(&self.metrics.packs_loaded, 1);
        TableMetrics::add(&self.metrics.bytes_read, raw.len() as u64);
        Pack::decode(self.schema.clone(), self.pack_size, &raw)
    }

    /// Write packs and their statistics in one batch. Empty packs are
    /// removed from storage and from the index.
    pub(super) fn store_packs(
        &self,
        packs: &mut [&mut Pack],
        stats: &mut StatsIndex,
        summary: &mut MergeSummary,
    ) -> TesseraResult<()> {
        let mut batch = WriteBatch::new();
        let mut entries = Vec::with_capacity(packs.len());
        let mut removed = Vec::new();
        for pack in packs.iter() {
            let key = storage::pack_key(pack.key());
            if pack.is_empty() {
                batch.delete(&self.buckets.data, &key);
                batch.delete(&self.buckets.meta, &key);
                removed.push(pack.key());
            } else {
                let blob = pack.encode()?;
                let entry = PackStats::from_pack(pack, blob.len());
                batch.put(&self.buckets.data, &key, blob);
                batch.put(&self.buckets.meta, &key, entry.encode()?);
                entries.push(entry);
            }
        }
        self.backend.apply(&batch)?;

        for pack in packs.iter() {
            self.cache.invalidate(pack.key());
        }
        for entry in entries {
            let key = entry.key;
            stats.add_or_update(entry);
            stats.mark_clean(key);
        }
        for key in removed {
            debug!(table = self.table, pack = key, "removed empty pack");
            stats.remove(key);
        }
        for pack in packs.iter_mut() {
            pack.mark_clean();
        }
        summary.packs_stored += packs.len();
        TableMetrics::add(&self.metrics.packs_stored, packs.len() as u64);
        TableMetrics::add(&self.metrics.bytes_written, batch.size() as u64);
        Ok(())
    }

    /// Move the upper half of a full pack into a new pack and store both.
    fn split_pack(
        &self,
        pack: &mut Pack,
        stats: &mut StatsIndex,
        summary: &mut MergeSummary,
    ) -> TesseraResult<()> {
        let half = pack.len() / 2;
        let n = pack.len() - half;
        let key = stats.next_key()?.max(pack.key() + 1);

        let mut right = Pack::new(self.schema.clone(), self.pack_size).with_key(key);
        right.append_pack(pack, half, n)?;
        pack.delete(half, n)?;
        debug!(
            table = self.table,
            left = pack.key(),
            right = key,
            at = right.min_pk(),
            "split pack"
        );

        self.store_packs(&mut [pack, &mut right], stats, summary)?;
        summary.splits += 1;
        TableMetrics::add(&self.metrics.pack_splits, 1);
        Ok(())
    }
}

/// Whether the open pack `c` is still the right place for `target`. A new
/// pack only takes keys from the gap it was created for.
fn keeps(c: &Current, target: Target) -> bool {
    match target {
        Target::Existing(r) => !c.is_new && r.key == c.pack.key(),
        Target::New { next_min } => c.is_new && c.next_min == next_min,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn stats(entries: &[PackStats]) -> StatsIndex {
        let mut idx = StatsIndex::new(4);
        for e in entries {
            idx.add_or_update(e.clone());
        }
        idx
    }

    fn existing_key(t: Target) -> Option<u32> {
        match t {
            Target::Existing(r) => Some(r.key),
            Target::New { .. } => None,
        }
    }

    #[test]
    fn test_empty_index_creates_pack() {
        assert_eq!(
            find_best_pack(&StatsIndex::new(4), 7),
            Target::New { next_min: 0 }
        );
    }

    #[test]
    fn test_range_containment_wins_even_when_full() {
        let idx = stats(&[entry(0, 1, 4, 4), entry(1, 10, 20, 4)]);
        assert_eq!(existing_key(find_best_pack(&idx, 3)), Some(0));
        assert_eq!(existing_key(find_best_pack(&idx, 10)), Some(1));
        assert_eq!(existing_key(find_best_pack(&idx, 20)), Some(1));
    }

    #[test]
    fn test_not_full_pack_takes_larger_keys() {
        let idx = stats(&[entry(0, 1, 4, 4), entry(1, 5, 6, 2)]);
        assert_eq!(existing_key(find_best_pack(&idx, 9)), Some(1));
    }

    #[test]
    fn test_full_pack_falls_back_to_next() {
        let idx = stats(&[entry(0, 1, 4, 4), entry(1, 10, 12, 2)]);
        assert_eq!(existing_key(find_best_pack(&idx, 6)), Some(1));
    }

    #[test]
    fn test_full_neighbours_need_new_pack() {
        let idx = stats(&[entry(0, 1, 4, 4), entry(1, 10, 13, 4)]);
        assert_eq!(
            find_best_pack(&idx, 6),
            Target::New { next_min: 10 }
        );
        assert_eq!(
            find_best_pack(&idx, 99),
            Target::New { next_min: 0 }
        );
    }

    #[test]
    fn test_key_below_full_first_pack_stays_out_of_next() {
        let idx = stats(&[entry(0, 10, 20, 4), entry(1, 30, 31, 2)]);
        assert_eq!(
            find_best_pack(&idx, 5),
            Target::New { next_min: 10 }
        );
    }

    #[test]
    fn test_wrapping_range_check_at_extremes() {
        let idx = stats(&[entry(0, 1, u64::MAX, 4)]);
        assert_eq!(existing_key(find_best_pack(&idx, u64::MAX)), Some(0));
        let idx = stats(&[entry(0, u64::MAX - 1, u64::MAX, 4)]);
        assert_eq!(
            find_best_pack(&idx, 3),
            Target::New {
                next_min: u64::MAX - 1
            }
        );
    }

    #[test]
    fn test_circuit_breaker_trips() {
        let mut breaker = CircuitBreaker::new(0, 0, 4);
        assert_eq!(breaker.limit(), 8);
        for _ in 0..8 {
            breaker.tick("t").unwrap();
        }
        let err = breaker.tick("t").unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("infinite flush loop"));
    }

    #[test]
    fn test_circuit_breaker_grows_on_split() {
        let mut breaker = CircuitBreaker::new(2, 9, 4);
        assert_eq!(breaker.limit(), 8 * (2 + 3 + 1));
        breaker.grow();
        assert_eq!(breaker.limit(), 56);
    }

    #[test]
    fn test_cancel_handle_take() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.take());
        assert!(!handle.take());
    }
}
