//! Typed column vectors backing a [`Pack`](super::Pack).

use crate::error::{TesseraError, TesseraResult};
use crate::schema::{FieldType, Value};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    U64(Vec<u64>),
    I64(Vec<i64>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    Bytes(Vec<Vec<u8>>),
    String(Vec<String>),
}

/// Run `$body` with `$v` bound to the inner vector, whatever its type.
macro_rules! each_column {
    ($col:expr, $v:ident => $body:expr) => {
        match $col {
            Column::U64($v) => $body,
            Column::I64($v) => $body,
            Column::U32($v) => $body,
            Column::I32($v) => $body,
            Column::F64($v) => $body,
            Column::Bool($v) => $body,
            Column::Bytes($v) => $body,
            Column::String($v) => $body,
        }
    };
}

/// Run `$body` on two columns of the same type, or fail on a type mismatch.
macro_rules! zip_columns {
    ($dst:expr, $src:expr, $d:ident, $s:ident => $body:expr) => {
        match ($dst, $src) {
            (Column::U64($d), Column::U64($s)) => $body,
            (Column::I64($d), Column::I64($s)) => $body,
            (Column::U32($d), Column::U32($s)) => $body,
            (Column::I32($d), Column::I32($s)) => $body,
            (Column::F64($d), Column::F64($s)) => $body,
            (Column::Bool($d), Column::Bool($s)) => $body,
            (Column::Bytes($d), Column::Bytes($s)) => $body,
            (Column::String($d), Column::String($s)) => $body,
            (d, s) => {
                return Err(TesseraError::Schema(format!(
                    "column type mismatch: {:?} vs {:?}",
                    d.field_type(),
                    s.field_type()
                )));
            }
        }
    };
}

impl Column {
    pub fn with_capacity(typ: FieldType, cap: usize) -> Self {
        match typ {
            FieldType::U64 => Column::U64(Vec::with_capacity(cap)),
            FieldType::I64 => Column::I64(Vec::with_capacity(cap)),
            FieldType::U32 => Column::U32(Vec::with_capacity(cap)),
            FieldType::I32 => Column::I32(Vec::with_capacity(cap)),
            FieldType::F64 => Column::F64(Vec::with_capacity(cap)),
            FieldType::Bool => Column::Bool(Vec::with_capacity(cap)),
            FieldType::Bytes => Column::Bytes(Vec::with_capacity(cap)),
            FieldType::String => Column::String(Vec::with_capacity(cap)),
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Column::U64(_) => FieldType::U64,
            Column::I64(_) => FieldType::I64,
            Column::U32(_) => FieldType::U32,
            Column::I32(_) => FieldType::I32,
            Column::F64(_) => FieldType::F64,
            Column::Bool(_) => FieldType::Bool,
            Column::Bytes(_) => FieldType::Bytes,
            Column::String(_) => FieldType::String,
        }
    }

    pub fn len(&self) -> usize {
        each_column!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode a wire field payload and append it.
    pub fn push_raw(&mut self, raw: &[u8]) -> TesseraResult<()> {
        match self {
            Column::U64(v) => v.push(le_u64(raw)),
            Column::I64(v) => v.push(le_u64(raw) as i64),
            Column::U32(v) => v.push(le_u32(raw)),
            Column::I32(v) => v.push(le_u32(raw) as i32),
            Column::F64(v) => v.push(f64::from_bits(le_u64(raw))),
            Column::Bool(v) => v.push(raw.first().is_some_and(|b| *b != 0)),
            Column::Bytes(v) => v.push(raw.to_vec()),
            Column::String(v) => v.push(utf8(raw)?),
        }
        Ok(())
    }

    /// Decode a wire field payload into position `pos`.
    pub fn set_raw(&mut self, pos: usize, raw: &[u8]) -> TesseraResult<()> {
        match self {
            Column::U64(v) => v[pos] = le_u64(raw),
            Column::I64(v) => v[pos] = le_u64(raw) as i64,
            Column::U32(v) => v[pos] = le_u32(raw),
            Column::I32(v) => v[pos] = le_u32(raw) as i32,
            Column::F64(v) => v[pos] = f64::from_bits(le_u64(raw)),
            Column::Bool(v) => v[pos] = raw.first().is_some_and(|b| *b != 0),
            Column::Bytes(v) => v[pos] = raw.to_vec(),
            Column::String(v) => v[pos] = utf8(raw)?,
        }
        Ok(())
    }

    /// Append the wire encoding of position `pos` to `out`.
    pub fn write_raw(&self, pos: usize, out: &mut Vec<u8>) {
        match self {
            Column::U64(v) => out.extend_from_slice(&v[pos].to_le_bytes()),
            Column::I64(v) => out.extend_from_slice(&v[pos].to_le_bytes()),
            Column::U32(v) => out.extend_from_slice(&v[pos].to_le_bytes()),
            Column::I32(v) => out.extend_from_slice(&v[pos].to_le_bytes()),
            Column::F64(v) => out.extend_from_slice(&v[pos].to_bits().to_le_bytes()),
            Column::Bool(v) => out.push(u8::from(v[pos])),
            Column::Bytes(v) => {
                out.extend_from_slice(&(v[pos].len() as u32).to_le_bytes());
                out.extend_from_slice(&v[pos]);
            }
            Column::String(v) => {
                out.extend_from_slice(&(v[pos].len() as u32).to_le_bytes());
                out.extend_from_slice(v[pos].as_bytes());
            }
        }
    }

    pub fn value(&self, pos: usize) -> Value {
        match self {
            Column::U64(v) => Value::U64(v[pos]),
            Column::I64(v) => Value::I64(v[pos]),
            Column::U32(v) => Value::U32(v[pos]),
            Column::I32(v) => Value::I32(v[pos]),
            Column::F64(v) => Value::F64(v[pos]),
            Column::Bool(v) => Value::Bool(v[pos]),
            Column::Bytes(v) => Value::Bytes(v[pos].clone()),
            Column::String(v) => Value::String(v[pos].clone()),
        }
    }

    pub fn delete(&mut self, start: usize, n: usize) {
        each_column!(self, v => { v.drain(start..start + n); })
    }

    pub fn truncate(&mut self, len: usize) {
        each_column!(self, v => v.truncate(len))
    }

    pub fn clear(&mut self) {
        each_column!(self, v => v.clear())
    }

    pub fn shrink_to_fit(&mut self) {
        each_column!(self, v => v.shrink_to_fit())
    }

    /// Insert `n` values from `src[src_idx..]` before position `at`.
    pub fn insert_from(
        &mut self,
        src: &Column,
        at: usize,
        src_idx: usize,
        n: usize,
    ) -> TesseraResult<()> {
        zip_columns!(self, src, d, s => {
            d.splice(at..at, s[src_idx..src_idx + n].iter().cloned());
        });
        Ok(())
    }

    /// Append `n` values from `src[src_idx..]`.
    pub fn append_from(&mut self, src: &Column, src_idx: usize, n: usize) -> TesseraResult<()> {
        zip_columns!(self, src, d, s => d.extend_from_slice(&s[src_idx..src_idx + n]));
        Ok(())
    }

    /// Overwrite `n` values starting at `at` with `src[src_idx..]`.
    pub fn replace_from(
        &mut self,
        src: &Column,
        at: usize,
        src_idx: usize,
        n: usize,
    ) -> TesseraResult<()> {
        zip_columns!(self, src, d, s => d[at..at + n].clone_from_slice(&s[src_idx..src_idx + n]));
        Ok(())
    }

    /// Minimum and maximum value, `None` when empty.
    pub fn min_max(&self) -> Option<(Value, Value)> {
        fn fold<T: Clone>(v: &[T], less: impl Fn(&T, &T) -> bool) -> Option<(T, T)> {
            let first = v.first()?;
            let (mut lo, mut hi) = (first, first);
            for x in &v[1..] {
                if less(x, lo) {
                    lo = x;
                }
                if less(hi, x) {
                    hi = x;
                }
            }
            Some((lo.clone(), hi.clone()))
        }
        match self {
            Column::U64(v) => fold(v, |a, b| a < b).map(|(a, b)| (Value::U64(a), Value::U64(b))),
            Column::I64(v) => fold(v, |a, b| a < b).map(|(a, b)| (Value::I64(a), Value::I64(b))),
            Column::U32(v) => fold(v, |a, b| a < b).map(|(a, b)| (Value::U32(a), Value::U32(b))),
            Column::I32(v) => fold(v, |a, b| a < b).map(|(a, b)| (Value::I32(a), Value::I32(b))),
            Column::F64(v) => fold(v, |a, b| a.total_cmp(b).is_lt())
                .map(|(a, b)| (Value::F64(a), Value::F64(b))),
            Column::Bool(v) => {
                fold(v, |a, b| a < b).map(|(a, b)| (Value::Bool(a), Value::Bool(b)))
            }
            Column::Bytes(v) => {
                fold(v, |a, b| a < b).map(|(a, b)| (Value::Bytes(a), Value::Bytes(b)))
            }
            Column::String(v) => {
                fold(v, |a, b| a < b).map(|(a, b)| (Value::String(a), Value::String(b)))
            }
        }
    }
}

fn le_u64(raw: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    let n = raw.len().min(8);
    b[..n].copy_from_slice(&raw[..n]);
    u64::from_le_bytes(b)
}

fn le_u32(raw: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    let n = raw.len().min(4);
    b[..n].copy_from_slice(&raw[..n]);
    u32::from_le_bytes(b)
}

fn utf8(raw: &[u8]) -> TesseraResult<String> {
    String::from_utf8(raw.to_vec())
        .map_err(|e| TesseraError::Schema(format!("invalid utf-8 string: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_append_replace() {
        let mut dst = Column::U64(vec![1, 5, 9]);
        let src = Column::U64(vec![2, 3, 4]);

        dst.insert_from(&src, 1, 0, 2).unwrap();
        assert_eq!(dst, Column::U64(vec![1, 2, 3, 5, 9]));

        dst.append_from(&src, 2, 1).unwrap();
        assert_eq!(dst, Column::U64(vec![1, 2, 3, 5, 9, 4]));

        dst.replace_from(&src, 0, 1, 2).unwrap();
        assert_eq!(dst, Column::U64(vec![3, 4, 3, 5, 9, 4]));

        dst.delete(1, 3);
        assert_eq!(dst, Column::U64(vec![3, 9, 4]));
    }

    #[test]
    fn test_type_mismatch() {
        let mut dst = Column::U64(vec![1]);
        let src = Column::I64(vec![2]);
        assert!(dst.append_from(&src, 0, 1).is_err());
    }

    #[test]
    fn test_min_max() {
        assert_eq!(Column::U64(vec![]).min_max(), None);
        let col = Column::String(vec!["m".into(), "a".into(), "z".into()]);
        assert_eq!(
            col.min_max(),
            Some((Value::String("a".into()), Value::String("z".into())))
        );
        let col = Column::F64(vec![1.5, -2.0, 0.0]);
        assert_eq!(col.min_max(), Some((Value::F64(-2.0), Value::F64(1.5))));
    }

    #[test]
    fn test_raw_roundtrip() {
        let mut col = Column::with_capacity(FieldType::String, 2);
        col.push_raw(b"hello").unwrap();
        let mut out = Vec::new();
        col.write_raw(0, &mut out);
        assert_eq!(&out[..4], &5u32.to_le_bytes());
        assert_eq!(&out[4..], b"hello");
        assert!(col.push_raw(&[0xff, 0xfe]).is_err());
    }
}
