//! Point lookups and primary-key range scans.
//!
//! Reads combine the settled pack data with the journal overlay: a
//! tombstone hides a row, a live journal row replaces the stored one.

use super::{Table, TableInner};
use crate::error::{TesseraError, TesseraResult};
use crate::pack::Pack;
use crate::schema::Row;
use crate::stats::StatsIndex;
use crate::storage;
use crate::table::metrics::TableMetrics;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::instrument;

/// Inclusive primary-key range with an optional row limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Query {
    pub from: u64,
    pub to: u64,
    /// 0 = unlimited
    pub limit: usize,
}

impl Query {
    pub fn all() -> Self {
        Self {
            from: 1,
            to: u64::MAX,
            limit: 0,
        }
    }

    pub fn range(from: u64, to: u64) -> Self {
        Self { from, to, limit: 0 }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn validate(&self) -> TesseraResult<()> {
        if self.from > self.to {
            return Err(TesseraError::InvalidQuery(format!(
                "inverted range {}..={}",
                self.from, self.to
            )));
        }
        Ok(())
    }

    fn contains(&self, pk: u64) -> bool {
        pk.wrapping_sub(self.from) <= self.to.wrapping_sub(self.from)
    }

    fn is_done(&self, n: usize) -> bool {
        self.limit > 0 && n >= self.limit
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::all()
    }
}

impl Table {
    /// Current row for `pk`, if it is live.
    #[instrument(skip(self), fields(table = %self.name))]
    pub fn lookup(&self, pk: u64) -> TesseraResult<Option<Row>> {
        self.check_open()?;
        if pk == 0 {
            return Ok(None);
        }
        let inner = self.inner.read();
        let journal = &inner.journal;
        if journal.is_deleted(pk) {
            return Ok(None);
        }
        if let (Some(idx), _) = journal.pk_index(pk, 0)
            && !journal.is_deleted_at(idx)
        {
            return Ok(Some(journal.data().row(idx)));
        }

        let stats = self.stats_snapshot();
        let Some(r) = stats.best(pk) else {
            return Ok(None);
        };
        if pk.wrapping_sub(r.min) > r.max.wrapping_sub(r.min) {
            return Ok(None);
        }
        let pack = self.read_pack(r.key)?;
        Ok(pack.find_pk(pk, 0).0.map(|pos| pack.row(pos)))
    }

    /// Live rows for a batch of keys, in primary-key order. Zero, unknown
    /// and deleted keys are skipped; duplicates yield one row.
    #[instrument(skip(self, pks), fields(table = %self.name, n = pks.len()))]
    pub fn lookup_pks(&self, pks: &[u64]) -> TesseraResult<Vec<Row>> {
        self.check_open()?;
        let mut wanted: Vec<u64> = pks.iter().copied().filter(|&pk| pk != 0).collect();
        wanted.sort_unstable();
        wanted.dedup();

        let inner = self.inner.read();
        let journal = &inner.journal;
        let stats = self.stats_snapshot();
        let mut out = Vec::with_capacity(wanted.len());
        let mut jhint = 0;
        let mut open: Option<Arc<Pack>> = None;
        let mut phint = 0;

        for pk in wanted {
            let (idx, next) = journal.pk_index(pk, jhint);
            jhint = next;
            if journal.is_deleted(pk) {
                continue;
            }
            if let Some(idx) = idx
                && !journal.is_deleted_at(idx)
            {
                out.push(journal.data().row(idx));
                continue;
            }

            let Some(r) = stats.best(pk) else {
                continue;
            };
            if pk.wrapping_sub(r.min) > r.max.wrapping_sub(r.min) {
                continue;
            }
            let pack = match open.take() {
                Some(p) if p.key() == r.key => p,
                _ => {
                    phint = 0;
                    self.read_pack(r.key)?
                }
            };
            let (found, at) = pack.find_pk(pk, phint);
            phint = at;
            if let Some(pos) = found {
                out.push(pack.row(pos));
            }
            open = Some(pack);
        }
        Ok(out)
    }

    /// Live rows in `q`'s range, in primary-key order.
    #[instrument(skip(self), fields(table = %self.name))]
    pub fn query(&self, q: &Query) -> TesseraResult<Vec<Row>> {
        let mut out = Vec::new();
        self.stream(q, |row| {
            out.push(row);
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(out)
    }

    /// Feed live rows in `q`'s range to `f` in primary-key order without
    /// collecting them. `f` stops the scan with `ControlFlow::Break`; its
    /// errors end the scan and are returned. Returns the rows delivered.
    ///
    /// The table's shared lock is held for the whole scan, so `f` must not
    /// write to the same table.
    pub fn stream<F>(&self, q: &Query, mut f: F) -> TesseraResult<usize>
    where
        F: FnMut(Row) -> TesseraResult<ControlFlow<()>>,
    {
        self.check_open()?;
        q.validate()?;
        let inner = self.inner.read();
        let stats = self.stats_snapshot();
        let mut n = 0usize;
        let mut emit = |row: Row| -> TesseraResult<bool> {
            n += 1;
            let flow = f(row)?;
            Ok(flow.is_continue() && !q.is_done(n))
        };
        self.scan(&inner, &stats, q, &mut emit)?;
        Ok(n)
    }

    /// Approximate live row count, exact right after a merge.
    pub fn count(&self) -> u64 {
        self.inner.read().state.rows
    }

    /// Walk packs and the journal overlay in pk order. `emit` returns
    /// whether to go on.
    fn scan(
        &self,
        inner: &TableInner,
        stats: &StatsIndex,
        q: &Query,
        emit: &mut dyn FnMut(Row) -> TesseraResult<bool>,
    ) -> TesseraResult<()> {
        let journal = &inner.journal;
        let mut overlay = journal
            .live_keys()
            .filter(|k| q.contains(k.pk))
            .peekable();

        // packs have disjoint ranges, so (min, max) order is pk order
        for p in stats.iter_by_range() {
            if p.max_pk < q.from || p.min_pk > q.to {
                continue;
            }
            let pack = self.read_pack(p.key)?;
            let (_, start) = pack.find_pk(q.from, 0);
            for pos in start..pack.len() {
                let pk = pack.pk_at(pos);
                if pk > q.to {
                    break;
                }
                while let Some(k) = overlay.next_if(|k| k.pk < pk) {
                    if !emit(journal.data().row(k.idx))? {
                        return Ok(());
                    }
                }
                let row = if let Some(k) = overlay.next_if(|k| k.pk == pk) {
                    journal.data().row(k.idx)
                } else if !journal.is_deleted(pk) {
                    pack.row(pos)
                } else {
                    continue;
                };
                if !emit(row)? {
                    return Ok(());
                }
            }
        }
        for k in overlay {
            if !emit(journal.data().row(k.idx))? {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn stats_snapshot(&self) -> Arc<StatsIndex> {
        self.stats.read().clone()
    }

    /// Shared, read-only copy of stored pack `key`, served from the pack
    /// cache when possible.
    pub(crate) fn read_pack(&self, key: u32) -> TesseraResult<Arc<Pack>> {
        if let Some(pack) = self.cache.get(key) {
            return Ok(pack);
        }
        let raw = self
            .backend
            .get(&self.buckets.data, &storage::pack_key(key))?
            .ok_or_else(|| TesseraError::Storage(format!("{}: pack {key} is missing", self.name)))?;
        TableMetrics::add(&self.metrics.packs_loaded, 1);
        TableMetrics::add(&self.metrics.bytes_read, raw.len() as u64);
        let pack = Arc::new(Pack::decode(self.schema.clone(), self.opts.pack_size, &raw)?);
        self.cache.insert(key, pack.clone());
        Ok(pack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverted_range_rejected() {
        assert!(matches!(
            Query::range(5, 4).validate(),
            Err(TesseraError::InvalidQuery(_))
        ));
        assert!(Query::range(4, 4).validate().is_ok());
    }

    #[test]
    fn test_range_contains() {
        let q = Query::range(3, 7);
        assert!(q.contains(3));
        assert!(q.contains(7));
        assert!(!q.contains(2));
        assert!(!q.contains(8));
        assert!(Query::all().contains(u64::MAX));
    }

    #[test]
    fn test_limit() {
        let q = Query::all().with_limit(2);
        assert!(!q.is_done(1));
        assert!(q.is_done(2));
        assert!(!Query::all().is_done(1_000_000));
    }
}
