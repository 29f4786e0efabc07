//! # Tessera: embedded columnar storage engine
//!
//! Rows are buffered in an in-memory journal whose key list stays sorted by
//! primary key, and are merged into fixed-capacity, key-sorted columnar
//! packs when the journal fills. Packs and their statistics live in a
//! key/value backend (sled or in-memory).
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera_core::{Field, FieldType, MemoryBackend, Query, Schema, Table, TableOptions, Value};
//!
//! # fn main() -> tessera_core::TesseraResult<()> {
//! let schema = Schema::new(
//!     "events",
//!     vec![Field::pk("id"), Field::new("name", FieldType::String)],
//! )?;
//! let table = Table::create(Arc::new(MemoryBackend::new()), schema, TableOptions::new())?;
//!
//! let wire = table.schema().encode_rows(&[
//!     vec![Value::U64(0), Value::String("a".into())],
//!     vec![Value::U64(0), Value::String("b".into())],
//! ])?;
//! table.insert(&wire)?;
//! table.delete(&[1])?;
//! table.flush()?;
//!
//! let rows = table.query(&Query::all())?;
//! assert_eq!(rows.len(), 1);
//! assert_eq!(rows[0][0], Value::U64(2));
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`journal`] - write buffer with sorted key list and tombstones
//! - [`table`] - table lifecycle, merge engine, compaction, reads and transactions
//! - [`pack`] - columnar pack container and the decoded-pack cache
//! - [`stats`] - pack statistics index
//! - [`storage`] - key/value backends
//! - [`schema`] - schema and row wire codec

pub mod config;
pub mod error;
pub mod journal;
pub mod pack;
pub mod schema;
pub mod stats;
pub mod storage;
pub mod table;

// Logging utilities
pub mod logging;

pub use config::TableOptions;
pub use error::{TesseraError, TesseraResult};
pub use journal::{Journal, JournalKey};
pub use pack::{Pack, PackCache};
pub use schema::{Field, FieldType, Row, Schema, Value, WireView};
pub use stats::{PackStats, StatsIndex};
pub use storage::{KvBackend, MemoryBackend, SledBackend, WriteBatch};
pub use table::{
    CancelHandle, CompactSummary, IndexHook, MergeSummary, MergeTask, MetricsSnapshot, Query,
    Table, TableTx,
};
