//! # Connections and Transactions
//!
//! This module owns the two database clients and hides them behind one
//! transactional surface. Everything above it (stores, consumer, managers,
//! runtime) works against [`Transaction`] and never sees a driver type.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  ObjectStore / EventStore / EventConsumer / Manager        │
//! │        (build SQL, bind Values, decode Rows)               │
//! └─────────────────────────────┬─────────────────────────────┘
//!                               │ with_tx(|tx| ...)
//!                               ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │  Database: Mutex<Backend>                                  │
//! │     Backend::Sqlite(rusqlite::Connection)                  │
//! │     Backend::Postgres(postgres::Client)                    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Transaction Discipline
//!
//! [`Database::with_tx`] is the single transactional scope used by every
//! write path: begin, run the closure, commit on `Ok`, roll back on `Err`.
//! Both drivers roll back on drop, so a panic inside the closure also rolls
//! back while the stack unwinds. Stores themselves hold no transaction
//! state; callers compose an object mutation with an event append inside
//! one closure and the pair commits atomically.
//!
//! ## Locking
//!
//! One connection guarded by a mutex. Manager sync loops and synchronous
//! writes take turns; a transaction never spans an `.await` point because
//! all driver work is synchronous and runs inside `spawn_blocking` from
//! async contexts.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::types::ValueRef;

use crate::dialect::{quote_ident, Dialect};
use crate::error::{Error, Result};
use crate::value::{Row, Value};

// =============================================================================
// Configuration
// =============================================================================

/// Where and how to open the database.
///
/// The dialect is part of the configuration; it is never sniffed from the
/// connection.
#[derive(Debug, Clone)]
pub enum DatabaseConfig {
    /// Embedded single-file database at `path` (created if missing).
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
    /// Embedded in-memory database, lost on close. For tests.
    SqliteInMemory,
    /// Client/server database reached via a connection string, e.g.
    /// `host=localhost user=app dbname=app`.
    Postgres {
        /// libpq-style connection string or URL.
        url: String,
    },
}

impl DatabaseConfig {
    /// Returns the dialect this configuration selects.
    pub fn dialect(&self) -> Dialect {
        match self {
            DatabaseConfig::Sqlite { .. } | DatabaseConfig::SqliteInMemory => Dialect::Sqlite,
            DatabaseConfig::Postgres { .. } => Dialect::Postgres,
        }
    }
}

// =============================================================================
// Database
// =============================================================================

enum Backend {
    Sqlite(rusqlite::Connection),
    Postgres(postgres::Client),
}

/// A single database connection plus its dialect.
///
/// `Database` is `Send + Sync`; clones of an `Arc<Database>` are shared by
/// the runtime, every manager loop, and synchronous write paths.
pub struct Database {
    backend: Mutex<Backend>,
    dialect: Dialect,
}

impl Database {
    /// Opens a connection per the configuration.
    ///
    /// SQLite connections get WAL journaling and `synchronous = NORMAL`,
    /// so sync-loop reads do not block concurrent writers from other
    /// processes.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let dialect = config.dialect();
        let backend = match config {
            DatabaseConfig::Sqlite { path } => {
                let conn = rusqlite::Connection::open(path)?;
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;\n\
                     PRAGMA synchronous = NORMAL;\n\
                     PRAGMA foreign_keys = ON;",
                )?;
                Backend::Sqlite(conn)
            }
            DatabaseConfig::SqliteInMemory => {
                let conn = rusqlite::Connection::open_in_memory()?;
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                Backend::Sqlite(conn)
            }
            DatabaseConfig::Postgres { url } => {
                let client = postgres::Client::connect(url, postgres::NoTls)?;
                Backend::Postgres(client)
            }
        };
        Ok(Self {
            backend: Mutex::new(backend),
            dialect,
        })
    }

    /// Returns the configured dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Runs `f` inside one transaction: commit on `Ok`, roll back on `Err`
    /// or panic.
    pub fn with_tx<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut guard = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *guard {
            Backend::Sqlite(conn) => {
                let tx = conn.transaction()?;
                let mut wrapped = Transaction {
                    inner: TxInner::Sqlite(tx),
                    dialect: self.dialect,
                };
                let out = f(&mut wrapped)?;
                wrapped.commit()?;
                Ok(out)
            }
            Backend::Postgres(client) => {
                let tx = client.transaction()?;
                let mut wrapped = Transaction {
                    inner: TxInner::Postgres(tx),
                    dialect: self.dialect,
                };
                let out = f(&mut wrapped)?;
                wrapped.commit()?;
                Ok(out)
            }
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

enum TxInner<'a> {
    Sqlite(rusqlite::Transaction<'a>),
    Postgres(postgres::Transaction<'a>),
}

/// One in-flight transaction.
///
/// Dropping an uncommitted `Transaction` rolls it back (both drivers
/// guarantee rollback-on-drop).
pub struct Transaction<'a> {
    inner: TxInner<'a>,
    dialect: Dialect,
}

impl<'a> Transaction<'a> {
    /// Returns the dialect, so stores can render placeholders and DDL.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Executes a statement and returns the number of affected rows.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        match &mut self.inner {
            TxInner::Sqlite(tx) => {
                let affected = tx.execute(sql, rusqlite::params_from_iter(params.iter()))?;
                Ok(affected as u64)
            }
            TxInner::Postgres(tx) => {
                let args = pg_params(params);
                Ok(tx.execute(sql, &args)?)
            }
        }
    }

    /// Executes an INSERT and returns the store-assigned identifier from
    /// `id_column`.
    ///
    /// SQLite reads `last_insert_rowid()`; Postgres appends a `RETURNING`
    /// clause. `sql` must be the bare INSERT without either mechanism.
    pub fn insert(&mut self, sql: &str, params: &[Value], id_column: &str) -> Result<i64> {
        match &mut self.inner {
            TxInner::Sqlite(tx) => {
                tx.execute(sql, rusqlite::params_from_iter(params.iter()))?;
                Ok(tx.last_insert_rowid())
            }
            TxInner::Postgres(tx) => {
                let sql = format!("{sql} RETURNING {}", quote_ident(id_column));
                let args = pg_params(params);
                let row = tx.query_one(&sql, &args)?;
                Ok(row.try_get::<_, i64>(0)?)
            }
        }
    }

    /// Runs a query and returns every row, decoded and owned.
    ///
    /// The driver cursor is fully drained and released before this returns;
    /// no scoped resource escapes.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        match &mut self.inner {
            TxInner::Sqlite(tx) => {
                let mut stmt = tx.prepare(sql)?;
                let columns: Arc<Vec<String>> = Arc::new(
                    stmt.column_names().iter().map(|s| s.to_string()).collect(),
                );
                let count = columns.len();
                let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let mut values = Vec::with_capacity(count);
                    for idx in 0..count {
                        values.push(decode_sqlite_value(row.get_ref(idx)?)?);
                    }
                    out.push(Row::new(columns.clone(), values));
                }
                Ok(out)
            }
            TxInner::Postgres(tx) => {
                let args = pg_params(params);
                let rows = tx.query(sql, &args)?;
                let columns: Arc<Vec<String>> = Arc::new(
                    rows.first()
                        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
                        .unwrap_or_default(),
                );
                let mut out = Vec::with_capacity(rows.len());
                for row in &rows {
                    out.push(decode_pg_row(row, columns.clone())?);
                }
                Ok(out)
            }
        }
    }

    /// Runs a query expected to return at most one row.
    pub fn query_row(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    fn commit(self) -> Result<()> {
        match self.inner {
            TxInner::Sqlite(tx) => Ok(tx.commit()?),
            TxInner::Postgres(tx) => Ok(tx.commit()?),
        }
    }
}

// =============================================================================
// Driver Decoding
// =============================================================================

fn decode_sqlite_value(value: ValueRef<'_>) -> Result<Value> {
    match value {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(i) => Ok(Value::Integer(i)),
        ValueRef::Text(bytes) => Ok(Value::Text(String::from_utf8_lossy(bytes).into_owned())),
        // JSON is the only BLOB column type the dialect builder emits.
        ValueRef::Blob(bytes) => Ok(Value::Json(serde_json::from_slice(bytes)?)),
        ValueRef::Real(_) => Err(Error::Schema(
            "unexpected REAL column in result set".to_string(),
        )),
    }
}

fn decode_pg_row(row: &postgres::Row, columns: Arc<Vec<String>>) -> Result<Row> {
    use postgres::types::Type;

    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?.map(Value::Integer)
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Integer(v as i64))
        } else if *ty == Type::TEXT || *ty == Type::VARCHAR {
            row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
        } else if *ty == Type::JSONB || *ty == Type::JSON {
            row.try_get::<_, Option<serde_json::Value>>(idx)?.map(Value::Json)
        } else {
            return Err(Error::Schema(format!(
                "unsupported column type '{ty}' for column '{}'",
                column.name()
            )));
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(Row::new(columns, values))
}

fn pg_params(params: &[Value]) -> Vec<&(dyn postgres::types::ToSql + Sync)> {
    params
        .iter()
        .map(|v| v as &(dyn postgres::types::ToSql + Sync))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{Column, ColumnType};

    fn open_memory() -> Database {
        Database::open(&DatabaseConfig::SqliteInMemory).expect("open in-memory db")
    }

    fn create_note_table(db: &Database) {
        let columns = vec![
            Column::new("id", ColumnType::Integer).primary_key().auto_increment(),
            Column::new("title", ColumnType::Text),
            Column::new("body", ColumnType::Json).nullable(),
        ];
        let sql = db.dialect().build_create_table("note", &columns).unwrap();
        db.with_tx(|tx| {
            tx.execute(&sql, &[])?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_with_tx_commits_on_ok() {
        let db = open_memory();
        create_note_table(&db);

        db.with_tx(|tx| {
            tx.insert(
                "INSERT INTO \"note\" (\"title\", \"body\") VALUES (?, ?)",
                &[Value::from("first"), Value::Null],
                "id",
            )?;
            Ok(())
        })
        .unwrap();

        let rows = db
            .with_tx(|tx| tx.query("SELECT \"id\", \"title\", \"body\" FROM \"note\"", &[]))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text(1).unwrap(), "first");
    }

    #[test]
    fn test_with_tx_rolls_back_on_err() {
        let db = open_memory();
        create_note_table(&db);

        let result: Result<()> = db.with_tx(|tx| {
            tx.insert(
                "INSERT INTO \"note\" (\"title\", \"body\") VALUES (?, ?)",
                &[Value::from("doomed"), Value::Null],
                "id",
            )?;
            Err(Error::Schema("forced rollback".to_string()))
        });
        assert!(result.is_err());

        let rows = db
            .with_tx(|tx| tx.query("SELECT \"id\" FROM \"note\"", &[]))
            .unwrap();
        assert!(rows.is_empty(), "rolled-back insert must not be visible");
    }

    #[test]
    fn test_insert_assigns_sequential_ids() {
        let db = open_memory();
        create_note_table(&db);

        let (first, second) = db
            .with_tx(|tx| {
                let first = tx.insert(
                    "INSERT INTO \"note\" (\"title\", \"body\") VALUES (?, ?)",
                    &[Value::from("a"), Value::Null],
                    "id",
                )?;
                let second = tx.insert(
                    "INSERT INTO \"note\" (\"title\", \"body\") VALUES (?, ?)",
                    &[Value::from("b"), Value::Null],
                    "id",
                )?;
                Ok((first, second))
            })
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn test_json_round_trip() {
        let db = open_memory();
        create_note_table(&db);

        let body = serde_json::json!({"tags": ["a", "b"], "stars": 3});
        db.with_tx(|tx| {
            tx.insert(
                "INSERT INTO \"note\" (\"title\", \"body\") VALUES (?, ?)",
                &[Value::from("json"), Value::Json(body.clone())],
                "id",
            )?;
            Ok(())
        })
        .unwrap();

        let row = db
            .with_tx(|tx| tx.query_row("SELECT \"body\" FROM \"note\"", &[]))
            .unwrap()
            .unwrap();
        let decoded: serde_json::Value = row.json(0).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_file_database_persists_across_connections() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("mirror.db");

        {
            let db = Database::open(&DatabaseConfig::Sqlite { path: path.clone() }).unwrap();
            create_note_table(&db);
            db.with_tx(|tx| {
                tx.insert(
                    "INSERT INTO \"note\" (\"title\", \"body\") VALUES (?, ?)",
                    &[Value::from("durable"), Value::Null],
                    "id",
                )?;
                Ok(())
            })
            .unwrap();
        }

        let db = Database::open(&DatabaseConfig::Sqlite { path }).unwrap();
        let row = db
            .with_tx(|tx| tx.query_row("SELECT \"title\" FROM \"note\"", &[]))
            .unwrap()
            .unwrap();
        assert_eq!(row.text(0).unwrap(), "durable");
    }

    #[test]
    fn test_affected_row_counts() {
        let db = open_memory();
        create_note_table(&db);

        db.with_tx(|tx| {
            tx.insert(
                "INSERT INTO \"note\" (\"title\", \"body\") VALUES (?, ?)",
                &[Value::from("x"), Value::Null],
                "id",
            )?;
            Ok(())
        })
        .unwrap();

        let affected = db
            .with_tx(|tx| {
                tx.execute(
                    "UPDATE \"note\" SET \"title\" = ? WHERE \"id\" = ?",
                    &[Value::from("y"), Value::from(999i64)],
                )
            })
            .unwrap();
        assert_eq!(affected, 0);
    }
}
