//! Transaction scope over one table.
//!
//! Writes go straight to the journal. The scope remembers what it needs to
//! undo the table's volatile state: the row count at begin and the keys it
//! inserted.

use super::Table;
use crate::error::TesseraResult;
use roaring::RoaringTreemap;
use tracing::{debug, warn};

type Hook<'a> = Box<dyn FnOnce() + Send + 'a>;

pub struct TableTx<'a> {
    table: &'a Table,
    rows_at_begin: u64,
    inserted: RoaringTreemap,
    on_commit: Vec<Hook<'a>>,
    on_abort: Vec<Hook<'a>>,
    done: bool,
}

impl<'a> TableTx<'a> {
    pub(crate) fn new(table: &'a Table) -> Self {
        let rows_at_begin = table.count();
        Self {
            table,
            rows_at_begin,
            inserted: RoaringTreemap::new(),
            on_commit: Vec::new(),
            on_abort: Vec::new(),
            done: false,
        }
    }

    pub fn insert(&mut self, wire: &[u8]) -> TesseraResult<u64> {
        self.table.check_writable()?;
        let mut inner = self.table.lock();
        let (first, n) = self.table.insert_locked(&mut inner, wire)?;
        self.inserted.insert_range(first..first + n);
        Ok(n)
    }

    pub fn update(&mut self, wire: &[u8]) -> TesseraResult<u64> {
        self.table.check_writable()?;
        let mut inner = self.table.lock();
        self.table.update_locked(&mut inner, wire)
    }

    pub fn delete(&mut self, pks: &[u64]) -> TesseraResult<u64> {
        self.table.check_writable()?;
        let mut inner = self.table.lock();
        let set: RoaringTreemap = pks.iter().copied().collect();
        self.table.delete_locked(&mut inner, &set)
    }

    /// Keys inserted through this scope.
    pub fn inserted(&self) -> &RoaringTreemap {
        &self.inserted
    }

    /// Run `f` after a successful commit. Hooks run newest first.
    pub fn on_commit(&mut self, f: impl FnOnce() + Send + 'a) {
        self.on_commit.push(Box::new(f));
    }

    /// Run `f` when the scope is aborted or dropped. Hooks run newest first.
    pub fn on_abort(&mut self, f: impl FnOnce() + Send + 'a) {
        self.on_abort.push(Box::new(f));
    }

    /// Persist the journal and table state, then run the commit hooks.
    pub fn commit(mut self) -> TesseraResult<()> {
        self.done = true;
        {
            let inner = self.table.lock();
            self.table.persist_journal(&inner)?;
        }
        debug!(table = self.table.name(), inserted = self.inserted.len(), "commit");
        while let Some(f) = self.on_commit.pop() {
            f();
        }
        self.on_abort.clear();
        Ok(())
    }

    pub fn abort(mut self) -> TesseraResult<()> {
        self.rollback()
    }

    fn rollback(&mut self) -> TesseraResult<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        let res = self.undo();
        while let Some(f) = self.on_abort.pop() {
            f();
        }
        self.on_commit.clear();
        res
    }

    fn undo(&mut self) -> TesseraResult<()> {
        let mut guard = self.table.lock();
        let inner = &mut *guard;
        if let Some(first) = self.inserted.min() {
            let journal = &mut inner.journal;
            let keys = journal.keys();
            let tail = keys.len() - keys.partition_point(|k| k.pk < first);
            let all_buffered = tail as u64 == self.inserted.len()
                && self
                    .inserted
                    .iter()
                    .all(|pk| journal.pk_index(pk, 0).0.is_some());

            if all_buffered && journal.rollback_tail(first) {
                inner.state.sequence = first;
                debug!(table = self.table.name(), first, "rolled back journal tail");
            } else {
                // already merged or interleaved with other writes
                journal.delete_batch(&self.inserted);
                debug!(
                    table = self.table.name(),
                    n = self.inserted.len(),
                    "tombstoned rows of aborted scope"
                );
            }
        }
        inner.state.rows = self.rows_at_begin;
        self.table.persist_journal(inner)
    }
}

impl Drop for TableTx<'_> {
    fn drop(&mut self) {
        if !self.done
            && let Err(e) = self.rollback()
        {
            warn!(table = self.table.name(), error = %e, "abort on drop failed");
        }
    }
}
