//! # SQL Dialects and DDL Building
//!
//! MirrorDB targets two dialects: an embedded single-file database (SQLite)
//! and a client/server database (PostgreSQL). They agree on most DDL but
//! differ in exactly the places that matter for sequential identifiers:
//!
//! ```text
//!                      SQLite                        Postgres
//! auto-increment pk    INTEGER PRIMARY KEY           BIGSERIAL PRIMARY KEY
//!                      AUTOINCREMENT                 (+ RETURNING on insert)
//! id retrieval         last_insert_rowid()           RETURNING "id"
//! JSON column          BLOB (opaque bytes)           JSONB (native)
//! placeholders         ?                             $1, $2, ...
//! ```
//!
//! This module is pure translation: given a table name and an ordered column
//! list it produces `CREATE TABLE` / `CREATE INDEX` statements for a target
//! dialect. It holds no runtime state. Dialect selection is a configuration
//! value on [`crate::db::DatabaseConfig`], never auto-detected.

use std::fmt;

use crate::error::{Error, Result};

// =============================================================================
// Dialect
// =============================================================================

/// A target database's SQL syntax variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Embedded single-file database (rusqlite).
    Sqlite,
    /// Client/server database (postgres).
    Postgres,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sqlite => write!(f, "sqlite"),
            Dialect::Postgres => write!(f, "postgres"),
        }
    }
}

// =============================================================================
// Column Descriptions
// =============================================================================

/// Logical column types the builder can render.
///
/// Anything else a record might want must be encoded into one of these;
/// an unsupported type never reaches SQL, it fails at registration with
/// [`Error::Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64-bit integer.
    Integer,
    /// Text string.
    Text,
    /// JSON document.
    Json,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Json => write!(f, "json"),
        }
    }
}

/// One column in a declared table layout.
///
/// Built with a small builder chain:
///
/// ```rust
/// use mirrordb::dialect::{Column, ColumnType};
///
/// let id = Column::new("id", ColumnType::Integer).primary_key().auto_increment();
/// let body = Column::new("body", ColumnType::Json).nullable();
/// # let _ = (id, body);
/// ```
#[derive(Debug, Clone)]
pub struct Column {
    /// Column name, quoted verbatim into DDL and SELECT lists.
    pub name: &'static str,
    /// Logical type.
    pub ty: ColumnType,
    /// Part of the primary key.
    pub primary_key: bool,
    /// Store-assigned sequential identifier.
    pub auto_increment: bool,
    /// Accepts SQL NULL.
    pub nullable: bool,
}

impl Column {
    /// Creates a non-null, non-key column.
    pub fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            primary_key: false,
            auto_increment: false,
            nullable: false,
        }
    }

    /// Marks the column as the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Marks the column as store-assigned sequential.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Allows SQL NULL.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

// =============================================================================
// DDL Building
// =============================================================================

impl Dialect {
    /// Renders a `CREATE TABLE IF NOT EXISTS` statement for this dialect.
    ///
    /// Output is deterministic for a given (table, columns) input. Invalid
    /// declarations (empty column list, autoincrement on a non-integer or
    /// non-key column, nullable autoincrement) fail with [`Error::Schema`].
    pub fn build_create_table(&self, table: &str, columns: &[Column]) -> Result<String> {
        if columns.is_empty() {
            return Err(Error::Schema(format!("table '{table}' declares no columns")));
        }
        let mut parts = Vec::with_capacity(columns.len());
        for column in columns {
            parts.push(self.column_sql(table, column)?);
        }
        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(table),
            parts.join(", ")
        ))
    }

    /// Renders a `CREATE INDEX IF NOT EXISTS` statement for this dialect.
    pub fn build_create_index(&self, table: &str, name: &str, columns: &[&str]) -> String {
        let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(name),
            quote_ident(table),
            cols.join(", ")
        )
    }

    /// Renders a `DROP TABLE IF EXISTS` statement.
    pub fn build_drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", quote_ident(table))
    }

    /// Returns the positional placeholder for parameter `idx` (zero-based).
    pub fn placeholder(&self, idx: usize) -> String {
        match self {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${}", idx + 1),
        }
    }

    /// Returns a comma-joined placeholder list for `count` parameters.
    pub fn placeholders(&self, count: usize) -> String {
        (0..count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn column_sql(&self, table: &str, column: &Column) -> Result<String> {
        if column.auto_increment {
            if column.ty != ColumnType::Integer {
                return Err(Error::Schema(format!(
                    "table '{table}': autoincrement column '{}' must be integer, is {}",
                    column.name, column.ty
                )));
            }
            if !column.primary_key {
                return Err(Error::Schema(format!(
                    "table '{table}': autoincrement column '{}' must be the primary key",
                    column.name
                )));
            }
            if column.nullable {
                return Err(Error::Schema(format!(
                    "table '{table}': autoincrement column '{}' cannot be nullable",
                    column.name
                )));
            }
            return Ok(match self {
                Dialect::Sqlite => {
                    format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote_ident(column.name))
                }
                Dialect::Postgres => {
                    format!("{} BIGSERIAL PRIMARY KEY", quote_ident(column.name))
                }
            });
        }

        let ty = match (self, column.ty) {
            (Dialect::Sqlite, ColumnType::Integer) => "INTEGER",
            (Dialect::Postgres, ColumnType::Integer) => "BIGINT",
            (_, ColumnType::Text) => "TEXT",
            (Dialect::Sqlite, ColumnType::Json) => "BLOB",
            (Dialect::Postgres, ColumnType::Json) => "JSONB",
        };

        let mut sql = format!("{} {}", quote_ident(column.name), ty);
        if column.primary_key {
            sql.push_str(" PRIMARY KEY");
        } else if !column.nullable {
            sql.push_str(" NOT NULL");
        }
        Ok(sql)
    }
}

/// Double-quotes an identifier so reserved words (`group`, `order`) are safe
/// on both dialects.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name)
}

/// Joins column names into a quoted SELECT/INSERT list.
pub(crate) fn quote_idents(names: &[&str]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Tests
// =============================================================================
