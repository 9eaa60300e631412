//! # SQL Values and Rows
//!
//! MirrorDB speaks to two database clients (`rusqlite` and `postgres`)
//! through one positional value model. [`Value`] is the parameter and result
//! representation for the three logical column types the dialect builder
//! supports (integer, string, JSON), and [`Row`] is an owned, decoded result
//! row; no driver cursor outlives the query call that produced it.
//!
//! ## Mapping
//!
//! | Logical | SQLite storage | Postgres storage |
//! |---------|----------------|------------------|
//! | Integer | `INTEGER`      | `BIGINT`         |
//! | Text    | `TEXT`         | `TEXT`           |
//! | Json    | `BLOB`         | `JSONB`          |
//!
//! JSON is opaque bytes on SQLite and a native type on Postgres; both decode
//! back into [`serde_json::Value`] so callers never see the difference.

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use rusqlite::types::{ToSqlOutput, ValueRef};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

// =============================================================================
// Value
// =============================================================================

/// A single SQL parameter or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// A 64-bit integer (`INTEGER` / `BIGINT`).
    Integer(i64),
    /// A text string.
    Text(String),
    /// A JSON document (`BLOB` on SQLite, `JSONB` on Postgres).
    Json(serde_json::Value),
}

impl Value {
    /// Serializes any `Serialize` type into a JSON cell.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Value::Json(serde_json::to_value(value)?))
    }

    /// Returns true for SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Json(j) => write!(f, "{j}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

// =============================================================================
// Driver Parameter Binding
// =============================================================================

impl rusqlite::types::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Value::Null => Ok(ToSqlOutput::Owned(rusqlite::types::Value::Null)),
            Value::Integer(i) => Ok(ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i))),
            Value::Text(s) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes()))),
            Value::Json(j) => serde_json::to_vec(j)
                .map(|bytes| ToSqlOutput::Owned(rusqlite::types::Value::Blob(bytes)))
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e))),
        }
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Integer(i) => i.to_sql(ty, out),
            Value::Text(s) => s.to_sql(ty, out),
            Value::Json(j) => j.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::INT8
            || *ty == Type::TEXT
            || *ty == Type::VARCHAR
            || *ty == Type::JSONB
            || *ty == Type::JSON
    }

    to_sql_checked!();
}

// =============================================================================
// Row
// =============================================================================

/// An owned, fully decoded result row.
///
/// Column names are shared across all rows of one result set. Cells are
/// addressed positionally; the declared column list fixes the positions, and
/// stores verify the returned names against it before decoding.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    /// Builds a row from shared column names and decoded cells.
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Returns the result set's column names, in SELECT order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the cell at `idx`, or NULL past the end.
    pub fn get(&self, idx: usize) -> &Value {
        self.values.get(idx).unwrap_or(&Value::Null)
    }

    /// Decodes an integer cell.
    pub fn integer(&self, idx: usize) -> Result<i64> {
        match self.get(idx) {
            Value::Integer(i) => Ok(*i),
            other => Err(self.cell_error(idx, "integer", other)),
        }
    }

    /// Decodes a nullable integer cell.
    pub fn opt_integer(&self, idx: usize) -> Result<Option<i64>> {
        match self.get(idx) {
            Value::Null => Ok(None),
            Value::Integer(i) => Ok(Some(*i)),
            other => Err(self.cell_error(idx, "integer", other)),
        }
    }

    /// Decodes a text cell.
    pub fn text(&self, idx: usize) -> Result<String> {
        match self.get(idx) {
            Value::Text(s) => Ok(s.clone()),
            other => Err(self.cell_error(idx, "text", other)),
        }
    }

    /// Decodes a nullable text cell.
    pub fn opt_text(&self, idx: usize) -> Result<Option<String>> {
        match self.get(idx) {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s.clone())),
            other => Err(self.cell_error(idx, "text", other)),
        }
    }

    /// Decodes a JSON cell into any `Deserialize` type.
    pub fn json<T: DeserializeOwned>(&self, idx: usize) -> Result<T> {
        match self.get(idx) {
            Value::Json(j) => Ok(serde_json::from_value(j.clone())?),
            other => Err(self.cell_error(idx, "json", other)),
        }
    }

    /// Decodes a nullable JSON cell.
    pub fn opt_json<T: DeserializeOwned>(&self, idx: usize) -> Result<Option<T>> {
        match self.get(idx) {
            Value::Null => Ok(None),
            Value::Json(j) => Ok(Some(serde_json::from_value(j.clone())?)),
            other => Err(self.cell_error(idx, "json", other)),
        }
    }

    fn cell_error(&self, idx: usize, wanted: &str, got: &Value) -> Error {
        let name = self
            .columns
            .get(idx)
            .map(String::as_str)
            .unwrap_or("<out of range>");
        Error::Schema(format!(
            "column '{name}' (index {idx}): expected {wanted}, got {got}"
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> Row {
        let columns = Arc::new(vec![
            "id".to_string(),
            "title".to_string(),
            "payload".to_string(),
            "note".to_string(),
        ]);
        Row::new(
            columns,
            vec![
                Value::Integer(7),
                Value::Text("hello".to_string()),
                Value::Json(serde_json::json!({"k": 1})),
                Value::Null,
            ],
        )
    }

    #[test]
    fn test_typed_accessors() {
        let row = sample_row();
        assert_eq!(row.integer(0).unwrap(), 7);
        assert_eq!(row.text(1).unwrap(), "hello");
        let payload: serde_json::Value = row.json(2).unwrap();
        assert_eq!(payload["k"], 1);
        assert_eq!(row.opt_text(3).unwrap(), None);
        assert_eq!(row.opt_integer(3).unwrap(), None);
    }

    #[test]
    fn test_type_mismatch_is_schema_error() {
        let row = sample_row();
        let err = row.integer(1).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(5i64), Value::Integer(5));
        assert_eq!(Value::from("x"), Value::Text("x".to_string()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(5i64)), Value::Integer(5));
        assert!(Value::Null.is_null());
    }

    #[test]
    fn test_json_helper() {
        #[derive(serde::Serialize)]
        struct Payload {
            n: i64,
        }
        let v = Value::json(&Payload { n: 3 }).unwrap();
        assert_eq!(v, Value::Json(serde_json::json!({"n": 3})));
    }
}
