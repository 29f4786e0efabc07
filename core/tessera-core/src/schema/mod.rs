//! Table schema and row values.
//!
//! A schema is an ordered list of typed fields with exactly one `U64`
//! primary-key field. Rows travel between callers and the engine in the
//! wire format implemented in [`wire`].

pub mod wire;

pub use wire::WireView;

use crate::error::{TesseraError, TesseraResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Column data types supported by packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    U64,
    I64,
    U32,
    I32,
    F64,
    Bool,
    Bytes,
    String,
}

impl FieldType {
    /// Encoded width for fixed-size types, `None` for length-prefixed ones.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            FieldType::U64 | FieldType::I64 | FieldType::F64 => Some(8),
            FieldType::U32 | FieldType::I32 => Some(4),
            FieldType::Bool => Some(1),
            FieldType::Bytes | FieldType::String => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub typ: FieldType,
    #[serde(default)]
    pub is_pk: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, typ: FieldType) -> Self {
        Self {
            name: name.into(),
            typ,
            is_pk: false,
        }
    }

    /// A `U64` primary-key field.
    pub fn pk(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            typ: FieldType::U64,
            is_pk: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub fields: Vec<Field>,
    #[serde(skip)]
    pk_index: usize,
}

impl Schema {
    /// Build and validate a schema.
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> TesseraResult<Self> {
        let mut schema = Self {
            name: name.into(),
            fields,
            pk_index: 0,
        };
        schema.validate()?;
        Ok(schema)
    }

    /// Check field names and the primary key, and cache the pk position.
    pub fn validate(&mut self) -> TesseraResult<()> {
        if self.name.is_empty() {
            return Err(TesseraError::Schema("empty schema name".to_string()));
        }
        if self.fields.is_empty() {
            return Err(TesseraError::Schema(format!("{}: no fields", self.name)));
        }
        let mut pk = None;
        for (i, f) in self.fields.iter().enumerate() {
            if f.name.is_empty() {
                return Err(TesseraError::Schema(format!(
                    "{}: field {i} has no name",
                    self.name
                )));
            }
            if self.fields[..i].iter().any(|o| o.name == f.name) {
                return Err(TesseraError::Schema(format!(
                    "{}: duplicate field '{}'",
                    self.name, f.name
                )));
            }
            if f.is_pk {
                if pk.is_some() {
                    return Err(TesseraError::Schema(format!(
                        "{}: more than one primary key",
                        self.name
                    )));
                }
                if f.typ != FieldType::U64 {
                    return Err(TesseraError::Schema(format!(
                        "{}: primary key '{}' must be U64",
                        self.name, f.name
                    )));
                }
                pk = Some(i);
            }
        }
        self.pk_index = pk
            .ok_or_else(|| TesseraError::Schema(format!("{}: missing primary key", self.name)))?;
        Ok(())
    }

    pub fn pk_index(&self) -> usize {
        self.pk_index
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Decode a schema persisted as JSON and re-derive cached state.
    pub fn from_json(json: &str) -> TesseraResult<Self> {
        let mut schema: Schema = serde_json::from_str(json)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn to_json(&self) -> TesseraResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    U64(u64),
    I64(i64),
    U32(u32),
    I32(i32),
    F64(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    String(String),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::U64(_) => FieldType::U64,
            Value::I64(_) => FieldType::I64,
            Value::U32(_) => FieldType::U32,
            Value::I32(_) => FieldType::I32,
            Value::F64(_) => FieldType::F64,
            Value::Bool(_) => FieldType::Bool,
            Value::Bytes(_) => FieldType::Bytes,
            Value::String(_) => FieldType::String,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// Ordering between values of the same type; `None` across types.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::U64(a), Value::U64(b)) => Some(a.cmp(b)),
            (Value::I64(a), Value::I64(b)) => Some(a.cmp(b)),
            (Value::U32(a), Value::U32(b)) => Some(a.cmp(b)),
            (Value::I32(a), Value::I32(b)) => Some(a.cmp(b)),
            (Value::F64(a), Value::F64(b)) => Some(a.total_cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// A decoded row in schema field order.
pub type Row = Vec<Value>;

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<Field> {
        vec![
            Field::pk("id"),
            Field::new("name", FieldType::String),
            Field::new("score", FieldType::F64),
        ]
    }

    #[test]
    fn test_schema_pk_index() {
        let schema = Schema::new("users", fields()).unwrap();
        assert_eq!(schema.pk_index(), 0);
        assert_eq!(schema.num_fields(), 3);
    }

    #[test]
    fn test_schema_requires_single_u64_pk() {
        let err = Schema::new("t", vec![Field::new("a", FieldType::I64)]);
        assert!(matches!(err, Err(TesseraError::Schema(_))));

        let mut bad = Field::pk("id");
        bad.typ = FieldType::I64;
        assert!(Schema::new("t", vec![bad]).is_err());

        assert!(Schema::new("t", vec![Field::pk("a"), Field::pk("b")]).is_err());
    }

    #[test]
    fn test_schema_rejects_duplicate_names() {
        let err = Schema::new(
            "t",
            vec![Field::pk("id"), Field::new("id", FieldType::U32)],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_schema_json_roundtrip() {
        let schema = Schema::new(
            "users",
            vec![Field::new("name", FieldType::String), Field::pk("id")],
        )
        .unwrap();
        let json = schema.to_json().unwrap();
        let loaded = Schema::from_json(&json).unwrap();
        assert_eq!(loaded.pk_index(), 1);
        assert_eq!(loaded, schema);
    }

    #[test]
    fn test_value_compare() {
        assert_eq!(
            Value::U64(1).compare(&Value::U64(2)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::U64(1).compare(&Value::I64(2)), None);
        assert_eq!(
            Value::F64(f64::NAN).compare(&Value::F64(1.0)),
            Some(Ordering::Greater)
        );
    }
}
