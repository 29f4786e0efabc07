//! Row wire format.
//!
//! Fields are laid out in schema order. Fixed-size fields are little-endian;
//! `Bytes` and `String` carry a `u32` little-endian length prefix. A batch is
//! a plain concatenation of rows.

use super::{FieldType, Row, Schema, Value};
use crate::error::{TesseraError, TesseraResult};

/// Zero-copy view over one wire-encoded row.
#[derive(Debug, Clone)]
pub struct WireView<'a> {
    schema: &'a Schema,
    buf: &'a [u8],
    // (offset, len) of each field payload
    spans: Vec<(usize, usize)>,
}

impl<'a> WireView<'a> {
    /// Split the first row off `buf`, returning the view and the remainder.
    /// The remainder keeps the lifetime of `buf`, not of `schema`.
    pub fn cut<'b: 'a>(schema: &'a Schema, buf: &'b [u8]) -> TesseraResult<(Self, &'b [u8])> {
        let mut spans = Vec::with_capacity(schema.num_fields());
        let mut ofs = 0usize;
        for f in &schema.fields {
            let len = match f.typ.fixed_size() {
                Some(n) => n,
                None => {
                    let prefix = buf
                        .get(ofs..ofs + 4)
                        .ok_or_else(|| truncated(schema, &f.name))?;
                    ofs += 4;
                    u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize
                }
            };
            if buf.len() < ofs + len {
                return Err(truncated(schema, &f.name));
            }
            spans.push((ofs, len));
            ofs += len;
        }
        let (row, rest) = buf.split_at(ofs);
        Ok((
            Self {
                schema,
                buf: row,
                spans,
            },
            rest,
        ))
    }

    /// Encoded row bytes.
    pub fn bytes(&self) -> &'a [u8] {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Raw payload of field `i`.
    pub fn field(&self, i: usize) -> &'a [u8] {
        let (ofs, len) = self.spans[i];
        &self.buf[ofs..ofs + len]
    }

    /// Primary key value.
    pub fn pk(&self) -> u64 {
        read_u64(self.field(self.schema.pk_index()))
    }

    /// Decode field `i`.
    pub fn value(&self, i: usize) -> TesseraResult<Value> {
        let raw = self.field(i);
        Ok(match self.schema.fields[i].typ {
            FieldType::U64 => Value::U64(read_u64(raw)),
            FieldType::I64 => Value::I64(read_u64(raw) as i64),
            FieldType::U32 => Value::U32(read_u32(raw)),
            FieldType::I32 => Value::I32(read_u32(raw) as i32),
            FieldType::F64 => Value::F64(f64::from_bits(read_u64(raw))),
            FieldType::Bool => Value::Bool(raw[0] != 0),
            FieldType::Bytes => Value::Bytes(raw.to_vec()),
            FieldType::String => Value::String(String::from_utf8(raw.to_vec()).map_err(|e| {
                TesseraError::Schema(format!(
                    "{}: field '{}' is not utf-8: {e}",
                    self.schema.name, self.schema.fields[i].name
                ))
            })?),
        })
    }

    pub fn to_row(&self) -> TesseraResult<Row> {
        (0..self.schema.num_fields()).map(|i| self.value(i)).collect()
    }
}

fn truncated(schema: &Schema, field: &str) -> TesseraError {
    TesseraError::Schema(format!(
        "{}: truncated wire row at field '{field}'",
        schema.name
    ))
}

fn read_u64(raw: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&raw[..8]);
    u64::from_le_bytes(b)
}

fn read_u32(raw: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&raw[..4]);
    u32::from_le_bytes(b)
}

impl Schema {
    /// Append the wire encoding of `row` to `out`.
    pub fn encode_row_into(&self, row: &[Value], out: &mut Vec<u8>) -> TesseraResult<()> {
        if row.len() != self.num_fields() {
            return Err(TesseraError::Schema(format!(
                "{}: expected {} values, got {}",
                self.name,
                self.num_fields(),
                row.len()
            )));
        }
        for (f, v) in self.fields.iter().zip(row) {
            if f.typ != v.field_type() {
                return Err(TesseraError::Schema(format!(
                    "{}: field '{}' expects {:?}, got {:?}",
                    self.name,
                    f.name,
                    f.typ,
                    v.field_type()
                )));
            }
            match v {
                Value::U64(x) => out.extend_from_slice(&x.to_le_bytes()),
                Value::I64(x) => out.extend_from_slice(&x.to_le_bytes()),
                Value::U32(x) => out.extend_from_slice(&x.to_le_bytes()),
                Value::I32(x) => out.extend_from_slice(&x.to_le_bytes()),
                Value::F64(x) => out.extend_from_slice(&x.to_bits().to_le_bytes()),
                Value::Bool(x) => out.push(u8::from(*x)),
                Value::Bytes(x) => put_var(out, x)?,
                Value::String(x) => put_var(out, x.as_bytes())?,
            }
        }
        Ok(())
    }

    pub fn encode_row(&self, row: &[Value]) -> TesseraResult<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_row_into(row, &mut out)?;
        Ok(out)
    }

    /// Encode a batch of rows as one concatenated buffer.
    pub fn encode_rows(&self, rows: &[Row]) -> TesseraResult<Vec<u8>> {
        let mut out = Vec::new();
        for row in rows {
            self.encode_row_into(row, &mut out)?;
        }
        Ok(out)
    }

    /// Decode exactly one row.
    pub fn decode_row(&self, buf: &[u8]) -> TesseraResult<Row> {
        let (view, rest) = WireView::cut(self, buf)?;
        if !rest.is_empty() {
            return Err(TesseraError::Schema(format!(
                "{}: {} trailing bytes after row",
                self.name,
                rest.len()
            )));
        }
        view.to_row()
    }
}

fn put_var(out: &mut Vec<u8>, data: &[u8]) -> TesseraResult<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| TesseraError::Schema(format!("value too large: {} bytes", data.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;

    fn schema() -> Schema {
        Schema::new(
            "events",
            vec![
                Field::new("name", FieldType::String),
                Field::pk("id"),
                Field::new("flag", FieldType::Bool),
                Field::new("delta", FieldType::I32),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_cut_splits_batch() {
        let s = schema();
        let rows = vec![
            vec![
                Value::String("a".into()),
                Value::U64(7),
                Value::Bool(true),
                Value::I32(-3),
            ],
            vec![
                Value::String("longer".into()),
                Value::U64(9),
                Value::Bool(false),
                Value::I32(12),
            ],
        ];
        let buf = s.encode_rows(&rows).unwrap();

        let (first, rest) = WireView::cut(&s, &buf).unwrap();
        assert_eq!(first.pk(), 7);
        assert_eq!(first.len(), 4 + 1 + 8 + 1 + 4);
        let (second, rest) = WireView::cut(&s, rest).unwrap();
        assert_eq!(second.pk(), 9);
        assert!(rest.is_empty());
        assert_eq!(second.to_row().unwrap(), rows[1]);
    }

    #[test]
    fn test_rest_outlives_schema_borrow() {
        let buf = {
            let s = schema();
            s.encode_rows(&[
                vec![
                    Value::String("x".into()),
                    Value::U64(1),
                    Value::Bool(true),
                    Value::I32(1),
                ],
                vec![
                    Value::String("y".into()),
                    Value::U64(2),
                    Value::Bool(false),
                    Value::I32(2),
                ],
            ])
            .unwrap()
        };
        let rest = {
            let local = schema();
            let (first, rest) = WireView::cut(&local, &buf).unwrap();
            assert_eq!(first.pk(), 1);
            rest
        };
        let s = schema();
        assert_eq!(s.decode_row(rest).unwrap()[1], Value::U64(2));
    }

    #[test]
    fn test_truncated_row_is_an_error() {
        let s = schema();
        let buf = s
            .encode_row(&[
                Value::String("abc".into()),
                Value::U64(1),
                Value::Bool(true),
                Value::I32(0),
            ])
            .unwrap();
        let err = WireView::cut(&s, &buf[..buf.len() - 1]);
        assert!(matches!(err, Err(TesseraError::Schema(_))));
    }

    #[test]
    fn test_encode_type_mismatch() {
        let s = schema();
        let err = s.encode_row(&[
            Value::U64(1),
            Value::U64(1),
            Value::Bool(true),
            Value::I32(0),
        ]);
        assert!(err.is_err());
        assert!(s.encode_row(&[Value::U64(1)]).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let s = schema();
        let mut buf = s
            .encode_row(&[
                Value::String(String::new()),
                Value::U64(1),
                Value::Bool(false),
                Value::I32(0),
            ])
            .unwrap();
        buf.push(0);
        assert!(s.decode_row(&buf).is_err());
    }
}
