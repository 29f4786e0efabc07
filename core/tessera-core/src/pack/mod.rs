//! Pack: fixed-capacity columnar row container.
//!
//! Stored packs are sorted by primary key. While a pack is being written by
//! the merge engine it is mutated in place (append, out-of-order insert,
//! replace, delete) and then encoded with bincode + zstd for storage.

pub mod cache;
pub mod column;

pub use cache::PackCache;
pub use column::Column;

use crate::error::{TesseraError, TesseraResult};
use crate::schema::{Row, Schema, Value, WireView};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const ZSTD_LEVEL: i32 = 3;

/// Per-column min/max over one pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockStats {
    pub min: Value,
    pub max: Value,
}

#[derive(Serialize)]
struct PackBlobRef<'a> {
    key: u32,
    columns: &'a [Column],
}

#[derive(Deserialize)]
struct PackBlob {
    key: u32,
    columns: Vec<Column>,
}

#[derive(Debug, Clone)]
pub struct Pack {
    key: u32,
    schema: Arc<Schema>,
    columns: Vec<Column>,
    max_rows: usize,
    dirty: bool,
}

impl Pack {
    pub fn new(schema: Arc<Schema>, max_rows: usize) -> Self {
        let columns = schema
            .fields
            .iter()
            .map(|f| Column::with_capacity(f.typ, 0))
            .collect();
        Self {
            key: 0,
            schema,
            columns,
            max_rows,
            dirty: false,
        }
    }

    pub fn with_key(mut self, key: u32) -> Self {
        self.key = key;
        self
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_rows
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Primary-key column. Sorted once the pack is stored.
    pub fn pk_column(&self) -> &[u64] {
        match &self.columns[self.schema.pk_index()] {
            Column::U64(v) => v,
            _ => &[],
        }
    }

    pub fn pk_at(&self, pos: usize) -> u64 {
        self.pk_column().get(pos).copied().unwrap_or(0)
    }

    pub fn set_pk(&mut self, pos: usize, pk: u64) {
        let idx = self.schema.pk_index();
        if let Column::U64(v) = &mut self.columns[idx] {
            v[pos] = pk;
            self.dirty = true;
        }
    }

    /// Smallest primary key, 0 when empty.
    pub fn min_pk(&self) -> u64 {
        self.pk_column().first().copied().unwrap_or(0)
    }

    /// Largest primary key, 0 when empty.
    pub fn max_pk(&self) -> u64 {
        self.pk_column().last().copied().unwrap_or(0)
    }

    /// Binary search for `pk` in the sorted pk column starting at `hint`.
    ///
    /// Returns the match position, if any, and the insertion point, which
    /// callers feed back as the hint for the next (larger) key.
    pub fn find_pk(&self, pk: u64, hint: usize) -> (Option<usize>, usize) {
        let pks = self.pk_column();
        let start = hint.min(pks.len());
        let i = start + pks[start..].partition_point(|&x| x < pk);
        if i < pks.len() && pks[i] == pk {
            (Some(i), i)
        } else {
            (None, i)
        }
    }

    /// Append one wire-encoded row.
    pub fn append_wire(&mut self, view: &WireView<'_>) -> TesseraResult<()> {
        for (i, col) in self.columns.iter_mut().enumerate() {
            col.push_raw(view.field(i))?;
        }
        self.dirty = true;
        Ok(())
    }

    /// Overwrite row `pos` with a wire-encoded row.
    pub fn set_wire(&mut self, pos: usize, view: &WireView<'_>) -> TesseraResult<()> {
        if pos >= self.len() {
            return Err(out_of_range(pos, self.len()));
        }
        for (i, col) in self.columns.iter_mut().enumerate() {
            col.set_raw(pos, view.field(i))?;
        }
        self.dirty = true;
        Ok(())
    }

    /// Wire encoding of row `pos`.
    pub fn read_wire(&self, pos: usize) -> TesseraResult<Vec<u8>> {
        if pos >= self.len() {
            return Err(out_of_range(pos, self.len()));
        }
        let mut out = Vec::new();
        for col in &self.columns {
            col.write_raw(pos, &mut out);
        }
        Ok(out)
    }

    pub fn row(&self, pos: usize) -> Row {
        self.columns.iter().map(|c| c.value(pos)).collect()
    }

    /// Remove `n` rows starting at `start`.
    pub fn delete(&mut self, start: usize, n: usize) -> TesseraResult<()> {
        if start + n > self.len() {
            return Err(out_of_range(start + n, self.len()));
        }
        if n == 0 {
            return Ok(());
        }
        for col in &mut self.columns {
            col.delete(start, n);
        }
        self.dirty = true;
        Ok(())
    }

    /// Insert `n` rows from `src[src_idx..]` before position `at`.
    pub fn insert_pack(
        &mut self,
        src: &Pack,
        at: usize,
        src_idx: usize,
        n: usize,
    ) -> TesseraResult<()> {
        self.check_src(src, src_idx, n)?;
        if at > self.len() {
            return Err(out_of_range(at, self.len()));
        }
        for (dst, s) in self.columns.iter_mut().zip(&src.columns) {
            dst.insert_from(s, at, src_idx, n)?;
        }
        self.dirty = true;
        Ok(())
    }

    /// Append `n` rows from `src[src_idx..]`.
    pub fn append_pack(&mut self, src: &Pack, src_idx: usize, n: usize) -> TesseraResult<()> {
        self.check_src(src, src_idx, n)?;
        for (dst, s) in self.columns.iter_mut().zip(&src.columns) {
            dst.append_from(s, src_idx, n)?;
        }
        self.dirty = true;
        Ok(())
    }

    /// Overwrite `n` rows at `at` with rows from `src[src_idx..]`.
    pub fn replace_pack(
        &mut self,
        src: &Pack,
        at: usize,
        src_idx: usize,
        n: usize,
    ) -> TesseraResult<()> {
        self.check_src(src, src_idx, n)?;
        if at + n > self.len() {
            return Err(out_of_range(at + n, self.len()));
        }
        for (dst, s) in self.columns.iter_mut().zip(&src.columns) {
            dst.replace_from(s, at, src_idx, n)?;
        }
        self.dirty = true;
        Ok(())
    }

    /// Drop rows past `len`.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            for col in &mut self.columns {
                col.truncate(len);
            }
            self.dirty = true;
        }
    }

    pub fn clear(&mut self) {
        for col in &mut self.columns {
            col.clear();
        }
        self.dirty = false;
    }

    /// Clear and return column buffers to the allocator.
    pub fn release(&mut self) {
        for col in &mut self.columns {
            col.clear();
            col.shrink_to_fit();
        }
        self.dirty = false;
    }

    /// Per-column min/max; empty for an empty pack.
    pub fn block_stats(&self) -> Vec<BlockStats> {
        self.columns
            .iter()
            .filter_map(|c| c.min_max().map(|(min, max)| BlockStats { min, max }))
            .collect()
    }

    /// Serialize for storage.
    pub fn encode(&self) -> TesseraResult<Vec<u8>> {
        let raw = bincode::serialize(&PackBlobRef {
            key: self.key,
            columns: &self.columns,
        })?;
        Ok(zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)?)
    }

    /// Deserialize a stored pack and check it against the schema.
    pub fn decode(schema: Arc<Schema>, max_rows: usize, data: &[u8]) -> TesseraResult<Self> {
        let raw = zstd::decode_all(data)?;
        let blob: PackBlob = bincode::deserialize(&raw)?;
        if blob.columns.len() != schema.num_fields() {
            return Err(TesseraError::Schema(format!(
                "{}: pack {} has {} columns, schema has {}",
                schema.name,
                blob.key,
                blob.columns.len(),
                schema.num_fields()
            )));
        }
        let len = blob.columns.first().map_or(0, Column::len);
        for (col, f) in blob.columns.iter().zip(&schema.fields) {
            if col.field_type() != f.typ || col.len() != len {
                return Err(TesseraError::Storage(format!(
                    "{}: pack {} column '{}' is malformed",
                    schema.name, blob.key, f.name
                )));
            }
        }
        Ok(Self {
            key: blob.key,
            schema,
            columns: blob.columns,
            max_rows,
            dirty: false,
        })
    }

    fn check_src(&self, src: &Pack, src_idx: usize, n: usize) -> TesseraResult<()> {
        if src.columns.len() != self.columns.len() {
            return Err(TesseraError::Schema(
                "packs have different column counts".to_string(),
            ));
        }
        if src_idx + n > src.len() {
            return Err(out_of_range(src_idx + n, src.len()));
        }
        Ok(())
    }
}

fn out_of_range(pos: usize, len: usize) -> TesseraError {
    TesseraError::Storage(format!("pack position {pos} out of range (len {len})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(
                "t",
                vec![Field::pk("id"), Field::new("name", FieldType::String)],
            )
            .unwrap(),
        )
    }

    fn pack_with(pks: &[u64]) -> Pack {
        let s = schema();
        let mut pack = Pack::new(s.clone(), 8);
        for pk in pks {
            let buf = s
                .encode_row(&[Value::U64(*pk), Value::String(format!("r{pk}"))])
                .unwrap();
            let (view, _) = WireView::cut(&s, &buf).unwrap();
            pack.append_wire(&view).unwrap();
        }
        pack
    }

    #[test]
    fn test_find_pk_with_hint() {
        let pack = pack_with(&[2, 4, 6, 8]);
        assert_eq!(pack.find_pk(4, 0), (Some(1), 1));
        assert_eq!(pack.find_pk(5, 1), (None, 2));
        assert_eq!(pack.find_pk(9, 2), (None, 4));
        assert_eq!(pack.find_pk(1, 0), (None, 0));
    }

    #[test]
    fn test_insert_and_delete_keep_order() {
        let mut pack = pack_with(&[1, 5]);
        let src = pack_with(&[3]);
        pack.insert_pack(&src, 1, 0, 1).unwrap();
        assert_eq!(pack.pk_column(), &[1, 3, 5]);
        assert_eq!(pack.row(1)[1], Value::String("r3".into()));

        pack.delete(0, 2).unwrap();
        assert_eq!(pack.pk_column(), &[5]);
        assert!(pack.delete(1, 1).is_err());
    }

    #[test]
    fn test_replace_and_read_wire() {
        let mut pack = pack_with(&[1, 2]);
        let mut src = pack_with(&[2]);
        let s = schema();
        let buf = s
            .encode_row(&[Value::U64(2), Value::String("new".into())])
            .unwrap();
        let (view, _) = WireView::cut(&s, &buf).unwrap();
        src.set_wire(0, &view).unwrap();

        pack.replace_pack(&src, 1, 0, 1).unwrap();
        assert_eq!(pack.read_wire(1).unwrap(), buf);
    }

    #[test]
    fn test_full_and_block_stats() {
        let pack = pack_with(&[3, 1, 2, 4, 5, 6, 7, 8]);
        assert!(pack.is_full());
        let stats = pack.block_stats();
        assert_eq!(stats[0].min, Value::U64(1));
        assert_eq!(stats[0].max, Value::U64(8));
        assert!(Pack::new(schema(), 4).block_stats().is_empty());
    }

    #[test]
    fn test_encode_decode() {
        let pack = pack_with(&[10, 11, 12]).with_key(7);
        let data = pack.encode().unwrap();
        let loaded = Pack::decode(schema(), 8, &data).unwrap();
        assert_eq!(loaded.key(), 7);
        assert_eq!(loaded.pk_column(), pack.pk_column());
        assert!(!loaded.is_dirty());
    }

    #[test]
    fn test_decode_rejects_wrong_schema() {
        let data = pack_with(&[1]).encode().unwrap();
        let other = Arc::new(Schema::new("o", vec![Field::pk("id")]).unwrap());
        assert!(Pack::decode(other, 8, &data).is_err());
    }

    #[test]
    fn test_release_clears() {
        let mut pack = pack_with(&[1, 2, 3]);
        pack.release();
        assert!(pack.is_empty());
        assert!(!pack.is_dirty());
    }
}
