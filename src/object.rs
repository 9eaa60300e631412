//! # Generic Object Storage
//!
//! Transactional CRUD over a single table for any record type that declares
//! its column layout. The declaration is an explicit, ordered column list
//! built once at registration time (never runtime introspection), so the
//! SELECT column order and the decode order are the same list by
//! construction, and a disagreement with the stored layout is a fatal
//! [`Error::SchemaMismatch`] instead of a silent misbind.
//!
//! ## Identifier Assignment
//!
//! The first declared column must be the integer autoincrement primary key.
//! `create` leaves identifier generation to the store: SQLite reports it via
//! `last_insert_rowid()`, Postgres via `RETURNING`. The returned object is
//! the caller's object with the assigned [`ObjectId`] filled in.
//!
//! ## Transaction Discipline
//!
//! Every operation takes a caller-supplied [`Transaction`]; the store holds
//! no transaction state. Callers combine an object mutation with an event
//! append in one `with_tx` closure to get atomicity.

use std::marker::PhantomData;

use crate::db::Transaction;
use crate::dialect::{quote_ident, quote_idents, Column, ColumnType, Dialect};
use crate::error::{Error, Result};
use crate::types::ObjectId;
use crate::value::{Row, Value};

// =============================================================================
// Object Records
// =============================================================================

/// A record type storable by [`ObjectStore`].
///
/// Implementations declare their table and ordered column list once;
/// `to_row` and `from_row` must produce and consume cells in exactly that
/// order, with the identifier first.
pub trait ObjectRecord: Clone + Send + Sync + 'static {
    /// Table name.
    fn table() -> &'static str;

    /// Ordered column layout. The first column must be the integer
    /// autoincrement primary key.
    fn columns() -> Vec<Column>;

    /// Current identifier ([`ObjectId::NONE`] before `create`).
    fn id(&self) -> ObjectId;

    /// Replaces the identifier. Called by the store after insert.
    fn set_id(&mut self, id: ObjectId);

    /// Encodes the record into cells, one per declared column, id first.
    fn to_row(&self) -> Result<Vec<Value>>;

    /// Decodes a record from cells in declared column order.
    fn from_row(row: &Row) -> Result<Self>;
}

// =============================================================================
// Object Store
// =============================================================================

/// Generic transactional CRUD for one [`ObjectRecord`] type.
///
/// Stateless apart from the column mapping derived at construction; cheap
/// to clone per manager.
#[derive(Clone)]
pub struct ObjectStore<T: ObjectRecord> {
    table: &'static str,
    columns: Vec<Column>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ObjectRecord> ObjectStore<T> {
    /// Derives and validates the column mapping for `T`.
    pub fn new() -> Result<Self> {
        let table = T::table();
        let columns = T::columns();
        validate_layout(table, &columns)?;
        Ok(Self {
            table,
            columns,
            _marker: PhantomData,
        })
    }

    /// Table name this store reads and writes.
    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Declared column layout.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Renders the `CREATE TABLE` statement for this type.
    pub fn create_table_sql(&self, dialect: Dialect) -> Result<String> {
        dialect.build_create_table(self.table, &self.columns)
    }

    /// Inserts `obj`, assigns its identifier, and returns it fully
    /// populated.
    pub fn create(&self, tx: &mut Transaction<'_>, mut obj: T) -> Result<T> {
        let mut cells = self.encoded_cells(&obj)?;
        cells.remove(0); // identifier is store-assigned

        let names: Vec<&str> = self.columns[1..].iter().map(|c| c.name).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(self.table),
            quote_idents(&names),
            tx.dialect().placeholders(names.len()),
        );
        let id = tx.insert(&sql, &cells, self.columns[0].name)?;
        obj.set_id(ObjectId::from_raw(id));
        Ok(obj)
    }

    /// Replaces every non-identifier column of the row with `obj`'s id.
    ///
    /// Fails with [`Error::NotFound`] when no row was affected (a concurrent
    /// delete won the race).
    pub fn update(&self, tx: &mut Transaction<'_>, obj: &T) -> Result<()> {
        let mut cells = self.encoded_cells(obj)?;
        cells.remove(0);
        cells.push(Value::from(obj.id().as_raw()));

        let dialect = tx.dialect();
        let assignments: Vec<String> = self.columns[1..]
            .iter()
            .enumerate()
            .map(|(idx, c)| format!("{} = {}", quote_ident(c.name), dialect.placeholder(idx)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            quote_ident(self.table),
            assignments.join(", "),
            quote_ident(self.columns[0].name),
            dialect.placeholder(self.columns.len() - 1),
        );

        let affected = tx.execute(&sql, &cells)?;
        if affected == 0 {
            return Err(Error::NotFound {
                table: self.table.to_string(),
                id: obj.id(),
            });
        }
        Ok(())
    }

    /// Deletes the row with `id`.
    ///
    /// Fails with [`Error::NotFound`] when no row was affected.
    pub fn delete(&self, tx: &mut Transaction<'_>, id: ObjectId) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            quote_ident(self.table),
            quote_ident(self.columns[0].name),
            tx.dialect().placeholder(0),
        );
        let affected = tx.execute(&sql, &[Value::from(id.as_raw())])?;
        if affected == 0 {
            return Err(Error::NotFound {
                table: self.table.to_string(),
                id,
            });
        }
        Ok(())
    }

    /// Loads every row in ascending identifier order.
    ///
    /// Selects `*` and verifies the returned column names against the
    /// declared layout before decoding anything; a disagreement is a fatal
    /// [`Error::SchemaMismatch`].
    pub fn load_all(&self, tx: &mut Transaction<'_>) -> Result<Vec<T>> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY {}",
            quote_ident(self.table),
            quote_ident(self.columns[0].name),
        );
        let rows = tx.query(&sql, &[])?;
        if let Some(first) = rows.first() {
            self.verify_columns(first)?;
        }
        rows.iter().map(T::from_row).collect()
    }

    fn verify_columns(&self, row: &Row) -> Result<()> {
        let expected: Vec<&str> = self.columns.iter().map(|c| c.name).collect();
        let actual: Vec<&str> = row.columns().iter().map(String::as_str).collect();
        if expected != actual {
            return Err(Error::SchemaMismatch {
                table: self.table.to_string(),
                expected: expected.join(", "),
                actual: actual.join(", "),
            });
        }
        Ok(())
    }

    fn encoded_cells(&self, obj: &T) -> Result<Vec<Value>> {
        let cells = obj.to_row()?;
        if cells.len() != self.columns.len() {
            return Err(Error::Schema(format!(
                "table '{}': to_row produced {} cells for {} declared columns",
                self.table,
                cells.len(),
                self.columns.len()
            )));
        }
        Ok(cells)
    }
}

pub(crate) fn validate_layout(table: &str, columns: &[Column]) -> Result<()> {
    let id = columns.first().ok_or_else(|| {
        Error::Schema(format!("table '{table}' declares no columns"))
    })?;
    if id.ty != ColumnType::Integer || !id.primary_key || !id.auto_increment {
        return Err(Error::Schema(format!(
            "table '{table}': first column '{}' must be the integer autoincrement primary key",
            id.name
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
