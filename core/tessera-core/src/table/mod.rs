//! Table: lifecycle, locking and write paths over journal, packs and
//! statistics.
//!
//! Writers and the merge engine hold the table's exclusive lock while they
//! touch the journal. The statistics index is published as an `Arc` and
//! swapped after each merge, so readers always see one complete version.

pub mod compact;
pub mod index;
pub mod merge;
pub mod metrics;
pub mod query;
pub mod state;
pub mod tx;

pub use compact::CompactSummary;
pub use index::IndexHook;
pub use merge::{CancelHandle, MergeSummary, MergeTask};
pub use metrics::{MetricsSnapshot, TableMetrics};
pub use query::Query;
pub use state::TableState;
pub use tx::TableTx;

use crate::config::TableOptions;
use crate::error::{TesseraError, TesseraResult};
use crate::journal::Journal;
use crate::pack::PackCache;
use crate::schema::Schema;
use crate::stats::StatsIndex;
use crate::storage::{KvBackend, TableBuckets, WriteBatch};
use merge::Merger;
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// State guarded by the table lock.
pub(crate) struct TableInner {
    pub(crate) journal: Journal,
    pub(crate) state: TableState,
}

pub struct Table {
    name: String,
    schema: Arc<Schema>,
    opts: TableOptions,
    backend: Arc<dyn KvBackend>,
    buckets: TableBuckets,
    inner: RwLock<TableInner>,
    stats: RwLock<Arc<StatsIndex>>,
    metrics: TableMetrics,
    indexes: RwLock<Vec<Arc<dyn IndexHook>>>,
    cache: PackCache,
    closed: AtomicBool,
    poisoned: AtomicBool,
    cancel: CancelHandle,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("opts", &self.opts)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Table {
    /// Create a new, empty table for `schema`.
    #[instrument(skip(backend, schema), fields(table = %schema.name))]
    pub fn create(
        backend: Arc<dyn KvBackend>,
        schema: Schema,
        opts: TableOptions,
    ) -> TesseraResult<Self> {
        opts.validate()?;
        let name = schema.name.clone();
        let buckets = TableBuckets::new(&name);
        if state::load_schema(backend.as_ref(), &buckets.state)?.is_some() {
            return Err(TesseraError::Storage(format!("table {name} already exists")));
        }

        let state = TableState::new();
        let mut batch = WriteBatch::new();
        state::store_schema(&schema, &mut batch, &buckets.state)?;
        state.store_into(&mut batch, &buckets.state)?;
        backend.apply(&batch)?;

        info!(table = %name, pack_size = opts.pack_size, "created table");
        let schema = Arc::new(schema);
        let journal = Journal::new(schema.clone(), opts.journal_size);
        let stats = StatsIndex::new(opts.pack_size);
        Ok(Self::assemble(name, schema, opts, backend, buckets, journal, state, stats))
    }

    /// Open an existing table. When `schema` is given it must match the
    /// stored one.
    #[instrument(skip(backend, schema, opts))]
    pub fn open(
        backend: Arc<dyn KvBackend>,
        name: &str,
        schema: Option<&Schema>,
        opts: TableOptions,
    ) -> TesseraResult<Self> {
        opts.validate()?;
        let buckets = TableBuckets::new(name);
        let stored = state::load_schema(backend.as_ref(), &buckets.state)?
            .ok_or_else(|| TesseraError::Storage(format!("table {name} does not exist")))?;
        if let Some(s) = schema
            && s != &stored
        {
            return Err(TesseraError::Schema(format!(
                "{name}: schema does not match the stored schema"
            )));
        }

        let state = TableState::load(backend.as_ref(), &buckets.state)?.unwrap_or_default();
        let stats = StatsIndex::load(backend.as_ref(), &buckets.meta, opts.pack_size)?;
        let schema = Arc::new(stored);
        let journal = Journal::load(
            backend.as_ref(),
            &buckets.data,
            schema.clone(),
            opts.journal_size,
        )?;

        info!(
            table = name,
            packs = stats.len(),
            rows = state.rows,
            journal = journal.len(),
            tomb = journal.tomb_len(),
            "opened table"
        );
        let table = Self::assemble(
            name.to_string(),
            schema,
            opts,
            backend,
            buckets,
            journal,
            state,
            stats,
        );

        // a journal restored at capacity would block the next write
        if !table.opts.read_only {
            let mut inner = table.inner.write();
            if inner.journal.is_full() {
                debug!(table = name, "merging restored journal");
                table.merge_locked(&mut inner)?;
            }
        }
        Ok(table)
    }

    /// Open a table for shared use and merge whatever journal was restored
    /// on a background thread. The task is `None` when nothing needs merging.
    pub fn open_shared(
        backend: Arc<dyn KvBackend>,
        name: &str,
        schema: Option<&Schema>,
        opts: TableOptions,
    ) -> TesseraResult<(Arc<Self>, Option<MergeTask>)> {
        let table = Arc::new(Self::open(backend, name, schema, opts)?);
        let task = table.spawn_merge()?;
        Ok((table, task))
    }

    /// Merge the journal on a new thread. Writers and readers block on the
    /// table lock while the merge holds it.
    pub fn spawn_merge(self: &Arc<Self>) -> TesseraResult<Option<MergeTask>> {
        if self.opts.read_only || self.is_poisoned() || self.inner.read().journal.is_empty() {
            return Ok(None);
        }
        let table = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("tessera-merge-{}", self.name))
            .spawn(move || {
                let res = table.flush();
                match &res {
                    Ok(summary) => info!(
                        table = %table.name,
                        rows = summary.journal_rows,
                        tombstones = summary.tombstones,
                        "background merge done"
                    ),
                    Err(e) => warn!(table = %table.name, error = %e, "background merge failed"),
                }
                res
            })?;
        Ok(Some(MergeTask::new(handle)))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        name: String,
        schema: Arc<Schema>,
        opts: TableOptions,
        backend: Arc<dyn KvBackend>,
        buckets: TableBuckets,
        journal: Journal,
        state: TableState,
        stats: StatsIndex,
    ) -> Self {
        let cache = PackCache::new(opts.cache_size);
        let table = Self {
            name,
            schema,
            opts,
            backend,
            buckets,
            inner: RwLock::new(TableInner { journal, state }),
            stats: RwLock::new(Arc::new(stats)),
            metrics: TableMetrics::new(),
            indexes: RwLock::new(Vec::new()),
            cache,
            closed: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            cancel: CancelHandle::new(),
        };
        table.refresh_gauges(&table.inner.read());
        table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn options(&self) -> &TableOptions {
        &self.opts
    }

    /// Next primary key `insert` will assign.
    pub fn next_sequence(&self) -> u64 {
        self.inner.read().state.sequence
    }

    /// Copy of the published statistics index.
    pub fn stats(&self) -> Arc<StatsIndex> {
        self.stats_snapshot()
    }

    pub fn journal_len(&self) -> usize {
        self.inner.read().journal.len()
    }

    pub fn tomb_len(&self) -> u64 {
        self.inner.read().journal.tomb_len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Handle that stops the next merge at a pack boundary.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Decoded packs kept for reads.
    pub fn cache(&self) -> &PackCache {
        &self.cache
    }

    /// Drop every cached pack.
    pub fn purge_cache(&self) {
        self.cache.purge();
        TableMetrics::set(&self.metrics.cache_packs, 0);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.refresh_gauges(&self.inner.read());
        self.metrics.snapshot()
    }

    pub fn connect_index(&self, index: Arc<dyn IndexHook>) {
        let mut indexes = self.indexes.write();
        indexes.retain(|i| i.name() != index.name());
        debug!(table = %self.name, index = index.name(), "connected index");
        indexes.push(index);
    }

    pub fn disconnect_index(&self, name: &str) -> bool {
        let mut indexes = self.indexes.write();
        let before = indexes.len();
        indexes.retain(|i| i.name() != name);
        before != indexes.len()
    }

    // ── writes ──

    /// Append wire-encoded rows with fresh primary keys. Returns the number
    /// of rows inserted.
    #[instrument(skip(self, wire), fields(table = %self.name, bytes = wire.len()))]
    pub fn insert(&self, wire: &[u8]) -> TesseraResult<u64> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        self.insert_locked(&mut inner, wire).map(|(_, n)| n)
    }

    /// Returns the first assigned key and the row count.
    pub(crate) fn insert_locked(
        &self,
        inner: &mut TableInner,
        wire: &[u8],
    ) -> TesseraResult<(u64, u64)> {
        TableMetrics::add(&self.metrics.insert_calls, 1);
        let first = inner.state.sequence;
        let mut total = 0u64;
        let mut buf = wire;
        while !buf.is_empty() {
            if inner.journal.is_full() {
                self.merge_locked(inner)?;
            }
            let seq = inner.state.sequence;
            let (n, rest) = inner.journal.insert_batch(buf, seq)?;
            inner.state.sequence += n as u64;
            inner.state.rows += n as u64;
            total += n as u64;
            buf = rest;
            if n == 0 && !inner.journal.is_full() {
                return Err(TesseraError::InvariantViolation(
                    "journal accepted no rows".to_string(),
                ));
            }
        }
        TableMetrics::add(&self.metrics.inserted_tuples, total);
        if inner.journal.is_full() {
            self.merge_locked(inner)?;
        }
        Ok((first, total))
    }

    /// Insert or overwrite rows that carry explicit primary keys.
    ///
    /// A row with a zero primary key fails the call with
    /// [`TesseraError::NoKey`]; rows before it stay applied.
    #[instrument(skip(self, wire), fields(table = %self.name, bytes = wire.len()))]
    pub fn update(&self, wire: &[u8]) -> TesseraResult<u64> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        self.update_locked(&mut inner, wire)
    }

    pub(crate) fn update_locked(&self, inner: &mut TableInner, wire: &[u8]) -> TesseraResult<u64> {
        TableMetrics::add(&self.metrics.update_calls, 1);
        let mut total = 0u64;
        let mut buf = wire;
        while !buf.is_empty() {
            if inner.journal.is_full() {
                self.merge_locked(inner)?;
            }
            let (n, rest, err) = inner.journal.update_batch(buf);
            total += n as u64;
            inner.state.sequence = inner.state.sequence.max(inner.journal.max_id() + 1);
            TableMetrics::add(&self.metrics.updated_tuples, n as u64);
            if let Some(e) = err {
                return Err(e);
            }
            buf = rest;
            if n == 0 && !inner.journal.is_full() {
                return Err(TesseraError::InvariantViolation(
                    "journal accepted no rows".to_string(),
                ));
            }
        }
        if inner.journal.is_full() {
            self.merge_locked(inner)?;
        }
        Ok(total)
    }

    /// Tombstone `pks`. Zero keys and keys never handed out are ignored.
    /// Returns the number of newly tombstoned keys.
    #[instrument(skip(self, pks), fields(table = %self.name, n = pks.len()))]
    pub fn delete(&self, pks: &[u64]) -> TesseraResult<u64> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let set: RoaringTreemap = pks.iter().copied().collect();
        self.delete_locked(&mut inner, &set)
    }

    pub(crate) fn delete_locked(
        &self,
        inner: &mut TableInner,
        pks: &RoaringTreemap,
    ) -> TesseraResult<u64> {
        TableMetrics::add(&self.metrics.delete_calls, 1);
        let mut set = pks.clone();
        set.remove(0);
        set.remove_range(inner.state.sequence..);
        let n = inner.journal.delete_batch(&set);
        // keys are not checked for existence; the next merge corrects rows
        inner.state.rows = inner.state.rows.saturating_sub(n);
        TableMetrics::add(&self.metrics.deleted_tuples, n);
        if inner.journal.is_full() {
            self.merge_locked(inner)?;
        }
        Ok(n)
    }

    /// Merge the journal into packs now.
    #[instrument(skip(self), fields(table = %self.name))]
    pub fn flush(&self) -> TesseraResult<MergeSummary> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        self.merge_locked(&mut inner)
    }

    pub(crate) fn merge_locked(&self, inner: &mut TableInner) -> TesseraResult<MergeSummary> {
        if inner.journal.is_empty() {
            return Ok(MergeSummary {
                rows: inner.state.rows,
                ..Default::default()
            });
        }
        let start = Instant::now();
        let indexes = self.indexes.read().clone();
        let mut stats = (*self.stats_snapshot()).clone();
        let merger = self.merger(&indexes);

        match merger.run(&mut inner.journal, &mut stats, &mut inner.state) {
            Ok(summary) => {
                *self.stats.write() = Arc::new(stats);
                self.metrics.record_flush(
                    (summary.journal_rows + summary.tombstones) as u64,
                    start.elapsed(),
                );
                self.refresh_gauges(inner);
                Ok(summary)
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(table = %self.name, error = %e, "merge failed, table poisoned");
                    self.poisoned.store(true, Ordering::SeqCst);
                } else {
                    warn!(table = %self.name, error = %e, "merge failed");
                }
                self.reload_stats();
                Err(e)
            }
        }
    }

    // ── lifecycle ──

    /// Persist journal, tomb and state, then refuse further calls.
    #[instrument(skip(self), fields(table = %self.name))]
    pub fn close(&self) -> TesseraResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.opts.read_only {
            return Ok(());
        }
        let inner = self.inner.read();
        self.persist_journal(&inner)?;
        self.backend.flush()?;
        self.cache.purge();
        debug!(
            table = %self.name,
            journal = inner.journal.len(),
            tomb = inner.journal.tomb_len(),
            "closed table"
        );
        Ok(())
    }

    /// Make every acknowledged write durable: persist the journal, tomb and
    /// state, then flush the backend.
    #[instrument(skip(self), fields(table = %self.name))]
    pub fn sync(&self) -> TesseraResult<()> {
        self.check_open()?;
        if !self.opts.read_only {
            let inner = self.inner.read();
            self.persist_journal(&inner)?;
        }
        self.backend.flush()
    }

    /// Remove every row and reset the sequence.
    #[instrument(skip(self), fields(table = %self.name))]
    pub fn truncate(&self) -> TesseraResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        self.backend.drop_bucket(&self.buckets.data)?;
        let mut stats = (*self.stats_snapshot()).clone();
        stats.drop_all(self.backend.as_ref(), &self.buckets.meta)?;
        self.cache.purge();
        inner.journal.reset();
        inner.state.reset();
        let mut batch = WriteBatch::new();
        inner.state.store_into(&mut batch, &self.buckets.state)?;
        self.backend.apply(&batch)?;
        *self.stats.write() = Arc::new(stats);
        self.refresh_gauges(&inner);
        info!(table = %self.name, "truncated table");
        Ok(())
    }

    /// Delete all buckets of this table.
    #[instrument(skip(self), fields(table = %self.name))]
    pub fn drop_table(self) -> TesseraResult<()> {
        self.check_writable()?;
        self.closed.store(true, Ordering::SeqCst);
        self.backend.drop_bucket(&self.buckets.data)?;
        self.backend.drop_bucket(&self.buckets.meta)?;
        self.backend.drop_bucket(&self.buckets.state)?;
        info!(table = %self.name, "dropped table");
        Ok(())
    }

    /// Start a transaction scope over this table.
    pub fn begin(&self) -> TesseraResult<TableTx<'_>> {
        self.check_writable()?;
        Ok(TableTx::new(self))
    }

    /// Write journal, tomb and state in one batch.
    pub(crate) fn persist_journal(&self, inner: &TableInner) -> TesseraResult<()> {
        let mut batch = WriteBatch::new();
        inner.journal.store_into(&mut batch, &self.buckets.data)?;
        inner.state.store_into(&mut batch, &self.buckets.state)?;
        self.backend.apply(&batch)?;
        TableMetrics::add(&self.metrics.bytes_written, batch.size() as u64);
        Ok(())
    }

    /// Fall back to the last durable statistics after a failed merge or
    /// compaction.
    pub(crate) fn reload_stats(&self) {
        match StatsIndex::load(self.backend.as_ref(), &self.buckets.meta, self.opts.pack_size) {
            Ok(durable) => *self.stats.write() = Arc::new(durable),
            Err(e) => {
                error!(table = %self.name, error = %e, "reloading statistics failed");
            }
        }
    }

    pub(crate) fn merger<'a>(&'a self, indexes: &'a [Arc<dyn IndexHook>]) -> Merger<'a> {
        Merger {
            table: &self.name,
            schema: &self.schema,
            backend: self.backend.as_ref(),
            buckets: &self.buckets,
            pack_size: self.opts.pack_size,
            indexes,
            metrics: &self.metrics,
            cancel: &self.cancel,
            cache: &self.cache,
        }
    }

    pub(crate) fn lock(&self) -> parking_lot::RwLockWriteGuard<'_, TableInner> {
        self.inner.write()
    }

    fn check_open(&self) -> TesseraResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TesseraError::TableClosed);
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> TesseraResult<()> {
        self.check_open()?;
        if self.opts.read_only {
            return Err(TesseraError::ReadOnly);
        }
        if self.is_poisoned() {
            return Err(TesseraError::DatabaseCorrupt(format!(
                "{}: table refuses writes after a failed merge",
                self.name
            )));
        }
        Ok(())
    }

    fn refresh_gauges(&self, inner: &TableInner) {
        let stats = self.stats_snapshot();
        TableMetrics::set(&self.metrics.tuple_count, inner.state.rows);
        TableMetrics::set(&self.metrics.packs_count, stats.len() as u64);
        TableMetrics::set(&self.metrics.meta_size, stats.meta_size() as u64);
        TableMetrics::set(&self.metrics.journal_tuples, inner.journal.len() as u64);
        TableMetrics::set(&self.metrics.tomb_tuples, inner.journal.tomb_len());
        TableMetrics::set(&self.metrics.cache_hits, self.cache.hits());
        TableMetrics::set(&self.metrics.cache_misses, self.cache.misses());
        TableMetrics::set(&self.metrics.cache_packs, self.cache.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType, Value};
    use crate::storage::MemoryBackend;

    fn schema() -> Schema {
        Schema::new(
            "items",
            vec![Field::pk("id"), Field::new("qty", FieldType::I64)],
        )
        .unwrap()
    }

    fn table(pack: usize, journal: usize) -> Table {
        let opts = TableOptions::new()
            .with_pack_size(pack)
            .with_journal_size(journal);
        Table::create(Arc::new(MemoryBackend::new()), schema(), opts).unwrap()
    }

    fn rows(s: &Schema, pks: &[u64]) -> Vec<u8> {
        let rows: Vec<_> = pks
            .iter()
            .map(|&pk| vec![Value::U64(pk), Value::I64(pk as i64 * 10)])
            .collect();
        s.encode_rows(&rows).unwrap()
    }

    #[test]
    fn test_insert_assigns_sequence() {
        let t = table(4, 16);
        let wire = rows(t.schema(), &[0, 0, 0]);
        assert_eq!(t.insert(&wire).unwrap(), 3);
        assert_eq!(t.next_sequence(), 4);
        assert_eq!(t.count(), 3);
        assert_eq!(t.lookup(2).unwrap().unwrap()[1], Value::I64(0));
    }

    #[test]
    fn test_update_bumps_sequence() {
        let t = table(4, 16);
        t.update(&rows(t.schema(), &[40])).unwrap();
        assert_eq!(t.next_sequence(), 41);
    }

    #[test]
    fn test_delete_ignores_unassigned_keys() {
        let t = table(4, 16);
        t.insert(&rows(t.schema(), &[0, 0])).unwrap();
        assert_eq!(t.delete(&[0, 2, 99]).unwrap(), 1);
        assert_eq!(t.tomb_len(), 1);
        assert_eq!(t.count(), 1);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let t = Table::create(backend.clone(), schema(), TableOptions::new()).unwrap();
        t.close().unwrap();
        let ro = Table::open(
            backend,
            "items",
            None,
            TableOptions::new().with_read_only(true),
        )
        .unwrap();
        let wire = rows(ro.schema(), &[0]);
        assert!(matches!(ro.insert(&wire), Err(TesseraError::ReadOnly)));
        assert!(ro.query(&Query::all()).unwrap().is_empty());
    }

    #[test]
    fn test_closed_table_rejects_calls() {
        let t = table(4, 16);
        t.close().unwrap();
        assert!(matches!(t.lookup(1), Err(TesseraError::TableClosed)));
        assert!(matches!(t.flush(), Err(TesseraError::TableClosed)));
    }

    #[test]
    fn test_create_twice_fails() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        Table::create(backend.clone(), schema(), TableOptions::new()).unwrap();
        assert!(Table::create(backend, schema(), TableOptions::new()).is_err());
    }

    #[test]
    fn test_connect_replaces_same_name() {
        struct Noop;
        impl IndexHook for Noop {
            fn name(&self) -> &str {
                "noop"
            }
            fn on_insert(&self, _: &crate::pack::Pack, _: usize) -> TesseraResult<()> {
                Ok(())
            }
            fn on_update(
                &self,
                _: &crate::pack::Pack,
                _: usize,
                _: &crate::pack::Pack,
                _: usize,
            ) -> TesseraResult<()> {
                Ok(())
            }
            fn on_delete(&self, _: &crate::pack::Pack, _: usize, _: usize) -> TesseraResult<()> {
                Ok(())
            }
            fn sync(&self) -> TesseraResult<()> {
                Ok(())
            }
        }

        let t = table(4, 16);
        t.connect_index(Arc::new(Noop));
        t.connect_index(Arc::new(Noop));
        assert_eq!(t.indexes.read().len(), 1);
        assert!(t.disconnect_index("noop"));
        assert!(!t.disconnect_index("noop"));
    }
}
