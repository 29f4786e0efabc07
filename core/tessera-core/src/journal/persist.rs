//! Journal and tombstone persistence.
//!
//! The data pack is written with deleted primary keys restored, so the key
//! list can be rebuilt from the pk column on load. Deletions are recovered
//! from the tombstone bitmap.

use super::{Journal, JournalKey};
use crate::error::{TesseraError, TesseraResult};
use crate::pack::Pack;
use crate::schema::Schema;
use crate::storage::{self, JOURNAL_KEY, KvBackend, TOMB_KEY, WriteBatch};
use bitvec::prelude::*;
use roaring::RoaringTreemap;
use std::sync::Arc;

impl Journal {
    /// Add the journal and tomb blobs to `batch`.
    pub fn store_into(&self, batch: &mut WriteBatch, data_bucket: &str) -> TesseraResult<()> {
        let mut data = self.data.clone();
        for k in &self.keys {
            if self.is_deleted_at(k.idx) {
                data.set_pk(k.idx, k.pk);
            }
        }
        batch.put(data_bucket, &storage::pack_key(JOURNAL_KEY), data.encode()?);

        let mut tomb = Vec::with_capacity(self.tomb.serialized_size());
        self.tomb.serialize_into(&mut tomb)?;
        batch.put(data_bucket, &storage::pack_key(TOMB_KEY), tomb);
        Ok(())
    }

    /// Add the blobs of an empty journal and tomb to `batch`.
    pub fn store_empty_into(
        schema: &Arc<Schema>,
        batch: &mut WriteBatch,
        data_bucket: &str,
    ) -> TesseraResult<()> {
        Journal::new(schema.clone(), 0).store_into(batch, data_bucket)
    }

    /// Restore a journal persisted by [`Journal::store_into`]. Missing blobs
    /// yield an empty journal.
    pub fn load(
        backend: &dyn KvBackend,
        data_bucket: &str,
        schema: Arc<Schema>,
        maxsize: usize,
    ) -> TesseraResult<Self> {
        let mut journal = Journal::new(schema.clone(), maxsize);

        if let Some(raw) = backend.get(data_bucket, &storage::pack_key(JOURNAL_KEY))? {
            let data = Pack::decode(schema, maxsize, &raw)?;
            let mut keys: Vec<JournalKey> = data
                .pk_column()
                .iter()
                .enumerate()
                .map(|(idx, &pk)| JournalKey { pk, idx })
                .collect();
            keys.sort_unstable_by_key(|k| k.pk);
            if keys.windows(2).any(|w| w[0].pk == w[1].pk) || keys.first().is_some_and(|k| k.pk == 0)
            {
                return Err(TesseraError::Storage(format!(
                    "{data_bucket}: persisted journal has invalid primary keys"
                )));
            }
            journal.maxid = keys.last().map_or(0, |k| k.pk);
            journal.deleted = bitvec![u64, Lsb0; 0; data.len()];
            journal.data = data;
            journal.keys = keys;
        }

        if let Some(raw) = backend.get(data_bucket, &storage::pack_key(TOMB_KEY))? {
            journal.tomb = RoaringTreemap::deserialize_from(raw.as_slice())?;
            let deleted: Vec<usize> = journal
                .tomb
                .iter()
                .filter_map(|pk| journal.pk_index(pk, 0).0)
                .collect();
            for idx in deleted {
                journal.data.set_pk(idx, 0);
                journal.deleted.set(idx, true);
            }
        }
        journal.data.mark_clean();
        Ok(journal)
    }
}
