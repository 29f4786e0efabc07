//! Pack compaction.
//!
//! Splits and deletes leave packs that are only partly filled. Compaction
//! walks the packs in primary-key order and moves rows from the front of
//! each pack to the tail of the previous non-full one, until every pack but
//! the last is full. Each move writes the receiving and the giving pack with
//! their statistics in one batch, so pack ranges stay sorted and disjoint
//! after every step. Packs emptied by a move are removed.

use super::Table;
use super::merge::{MergeSummary, Merger};
use crate::error::{TesseraError, TesseraResult};
use crate::pack::Pack;
use crate::stats::StatsIndex;
use crate::table::metrics::TableMetrics;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Result of [`Table::compact`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactSummary {
    pub packs_before: usize,
    pub packs_after: usize,
    /// Rows moved between packs.
    pub moved: usize,
    pub packs_stored: usize,
}

/// Whether any pack other than the last one (in pk order) has room.
pub(crate) fn needs_compaction(stats: &StatsIndex) -> bool {
    let n = stats.len();
    stats
        .iter_by_range()
        .take(n.saturating_sub(1))
        .any(|p| !stats.is_full(p))
}

impl Table {
    /// Refill partly empty packs. The journal is left alone; readers and
    /// writers wait on the table lock while compaction runs.
    #[instrument(skip(self), fields(table = %self.name))]
    pub fn compact(&self) -> TesseraResult<CompactSummary> {
        self.check_writable()?;
        let inner = self.inner.write();
        let snapshot = self.stats_snapshot();
        let mut summary = CompactSummary {
            packs_before: snapshot.len(),
            packs_after: snapshot.len(),
            ..Default::default()
        };
        if !needs_compaction(&snapshot) {
            debug!(packs = snapshot.len(), "already compact");
            return Ok(summary);
        }

        let start = Instant::now();
        let indexes = self.indexes.read().clone();
        let merger = self.merger(&indexes);
        let order: Vec<u32> = snapshot.iter_by_range().map(|p| p.key).collect();
        let mut stats = (*snapshot).clone();

        match self.move_rows(&merger, &order, &mut stats, &mut summary) {
            Ok(()) => {
                summary.packs_after = stats.len();
                *self.stats.write() = Arc::new(stats);
                TableMetrics::add(&self.metrics.compact_calls, 1);
                TableMetrics::add(&self.metrics.compacted_tuples, summary.moved as u64);
                self.refresh_gauges(&inner);
                info!(
                    moved = summary.moved,
                    packs_before = summary.packs_before,
                    packs_after = summary.packs_after,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "compacted packs"
                );
                Ok(summary)
            }
            Err(e) => {
                // moves already written stay written
                self.reload_stats();
                Err(e)
            }
        }
    }

    fn move_rows(
        &self,
        merger: &Merger<'_>,
        order: &[u32],
        stats: &mut StatsIndex,
        summary: &mut CompactSummary,
    ) -> TesseraResult<()> {
        let mut stored = MergeSummary::default();
        let mut dst: Option<Pack> = None;

        for &key in order {
            if self.cancel.take() {
                debug!("compaction cancelled at pack boundary");
                return Err(TesseraError::Cancelled);
            }
            let Some(mut into) = dst.take() else {
                let full = stats.get_by_key(key).is_some_and(|p| stats.is_full(p));
                if !full {
                    dst = Some(merger.load_pack(key)?);
                }
                continue;
            };

            let mut from = merger.load_pack(key)?;
            let n = (into.max_rows() - into.len()).min(from.len());
            let base = into.len();
            for idx in merger.indexes {
                idx.on_delete(&from, 0, n)?;
            }
            into.append_pack(&from, 0, n)?;
            from.delete(0, n)?;
            for idx in merger.indexes {
                for pos in base..base + n {
                    idx.on_insert(&into, pos)?;
                }
            }
            merger.store_packs(&mut [&mut into, &mut from], stats, &mut stored)?;
            summary.moved += n;

            // a full receiver hands over to the rest of the giving pack
            dst = if !into.is_full() {
                Some(into)
            } else if !from.is_empty() {
                Some(from)
            } else {
                None
            };
        }

        for idx in merger.indexes {
            idx.sync()?;
        }
        summary.packs_stored = stored.packs_stored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::PackStats;

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

    #[test]
    fn test_needs_compaction() {
        let mut idx = StatsIndex::new(4);
        assert!(!needs_compaction(&idx));
        idx.add_or_update(entry(0, 1, 2, 2));
        assert!(!needs_compaction(&idx));

        // only the last pack in pk order may have room
        idx.add_or_update(entry(1, 10, 13, 4));
        assert!(needs_compaction(&idx));
        idx.add_or_update(entry(0, 1, 4, 4));
        idx.add_or_update(entry(1, 10, 12, 3));
        assert!(!needs_compaction(&idx));
    }
}
