//! Durable table state and schema record.

use crate::error::TesseraResult;
use crate::schema::Schema;
use crate::storage::{KvBackend, WriteBatch};
use serde::{Deserialize, Serialize};

const STATE_KEY: &[u8] = b"state";
const SCHEMA_KEY: &[u8] = b"schema";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableState {
    /// Next free primary key.
    pub sequence: u64,
    /// Live rows, exact after each merge.
    pub rows: u64,
}

impl TableState {
    pub fn new() -> Self {
        Self {
            sequence: 1,
            rows: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn store_into(&self, batch: &mut WriteBatch, bucket: &str) -> TesseraResult<()> {
        batch.put(bucket, STATE_KEY, serde_json::to_vec(self)?);
        Ok(())
    }

    /// Load the state, `None` when it was never stored.
    pub fn load(backend: &dyn KvBackend, bucket: &str) -> TesseraResult<Option<Self>> {
        match backend.get(bucket, STATE_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }
}

impl Default for TableState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn store_schema(schema: &Schema, batch: &mut WriteBatch, bucket: &str) -> TesseraResult<()> {
    batch.put(bucket, SCHEMA_KEY, schema.to_json()?.into_bytes());
    Ok(())
}

pub fn load_schema(backend: &dyn KvBackend, bucket: &str) -> TesseraResult<Option<Schema>> {
    match backend.get(bucket, SCHEMA_KEY)? {
        Some(raw) => {
            let json = String::from_utf8_lossy(&raw);
            Ok(Some(Schema::from_json(&json)?))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use crate::storage::MemoryBackend;

    #[test]
    fn test_state_roundtrip() {
        let backend = MemoryBackend::new();
        assert_eq!(TableState::load(&backend, "t_state").unwrap(), None);

        let state = TableState {
            sequence: 42,
            rows: 17,
        };
        let mut batch = WriteBatch::new();
        state.store_into(&mut batch, "t_state").unwrap();
        backend.apply(&batch).unwrap();
        assert_eq!(
            TableState::load(&backend, "t_state").unwrap(),
            Some(state)
        );
    }

    #[test]
    fn test_schema_roundtrip() {
        let backend = MemoryBackend::new();
        let schema = Schema::new("t", vec![Field::pk("id")]).unwrap();
        let mut batch = WriteBatch::new();
        store_schema(&schema, &mut batch, "t_state").unwrap();
        backend.apply(&batch).unwrap();
        assert_eq!(load_schema(&backend, "t_state").unwrap(), Some(schema));
    }
}
