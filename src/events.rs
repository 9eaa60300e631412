//! # Generic Event Storage
//!
//! An append-only, ordered log of immutable records for one table. Events
//! are never updated or deleted in normal operation; each carries a
//! store-assigned, strictly increasing [`EventId`] and a timestamp.
//!
//! ## Commit-Time Identifier Assignment
//!
//! Identifiers come from the table's autoincrement column, which means they
//! are *reserved* when the INSERT runs but only become *visible* when the
//! surrounding transaction commits. Two consequences the consumer must
//! handle:
//!
//! ```text
//! tx A: reserve id 7 ───────────────── commit      (slow)
//! tx B:        reserve id 8 ── commit              (fast)
//!
//! observer:                    sees 8   sees 7     (out of order)
//! ```
//!
//! - An observer can see id N while N-1 is still in flight.
//! - An aborted transaction leaves a permanent hole in the sequence.
//!
//! ## Readers
//!
//! `load_range` / `load_ranges` drain the query cursor before returning, so
//! the [`EventReader`] they hand back is a plain owned iterator: dropping it
//! on any exit path releases nothing because nothing is still held.

use std::marker::PhantomData;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::db::Transaction;
use crate::dialect::{quote_ident, quote_idents, Column, Dialect};
use crate::error::{Error, Result};
use crate::object::validate_layout;
use crate::types::{EventId, EventRange};
use crate::value::{Row, Value};

// =============================================================================
// Event Records
// =============================================================================

/// A record type storable by [`EventStore`].
///
/// Same declarative column discipline as [`crate::object::ObjectRecord`]:
/// the first column must be the integer autoincrement primary key (the
/// event identifier), and `to_row`/`from_row` follow the declared order.
pub trait EventRecord: Clone + Send + Sync + 'static {
    /// Table name.
    fn table() -> &'static str;

    /// Ordered column layout, event identifier first.
    fn columns() -> Vec<Column>;

    /// Current identifier ([`EventId::NONE`] before `append`).
    fn event_id(&self) -> EventId;

    /// Replaces the identifier. Called by the store after insert.
    fn set_event_id(&mut self, id: EventId);

    /// Event timestamp in Unix milliseconds (0 before `append`).
    fn event_time(&self) -> i64;

    /// Replaces the timestamp. Called by the store before insert when the
    /// event carries none.
    fn set_event_time(&mut self, time_ms: i64);

    /// Encodes the record into cells, one per declared column, id first.
    fn to_row(&self) -> Result<Vec<Value>>;

    /// Decodes a record from cells in declared column order.
    fn from_row(row: &Row) -> Result<Self>;
}

// =============================================================================
// Event Store
// =============================================================================

/// Append-only ordered log for one [`EventRecord`] type.
#[derive(Clone)]
pub struct EventStore<E: EventRecord> {
    table: &'static str,
    columns: Vec<Column>,
    _marker: PhantomData<fn() -> E>,
}

impl<E: EventRecord> EventStore<E> {
    /// Derives and validates the column mapping for `E`.
    pub fn new() -> Result<Self> {
        let table = E::table();
        let columns = E::columns();
        validate_layout(table, &columns)?;
        Ok(Self {
            table,
            columns,
            _marker: PhantomData,
        })
    }

    /// Table name this store appends to.
    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Renders the `CREATE TABLE` statement for this type.
    pub fn create_table_sql(&self, dialect: Dialect) -> Result<String> {
        dialect.build_create_table(self.table, &self.columns)
    }

    /// Appends `event` and returns it with the store-assigned identifier
    /// and timestamp filled in.
    pub fn append(&self, tx: &mut Transaction<'_>, mut event: E) -> Result<E> {
        if event.event_time() == 0 {
            event.set_event_time(now_ms());
        }
        let mut cells = event.to_row()?;
        if cells.len() != self.columns.len() {
            return Err(Error::Schema(format!(
                "table '{}': to_row produced {} cells for {} declared columns",
                self.table,
                cells.len(),
                self.columns.len()
            )));
        }
        cells.remove(0); // identifier is store-assigned

        let names: Vec<&str> = self.columns[1..].iter().map(|c| c.name).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(self.table),
            quote_idents(&names),
            tx.dialect().placeholders(names.len()),
        );
        let id = tx.insert(&sql, &cells, self.columns[0].name)?;
        event.set_event_id(EventId::from_raw(id));
        Ok(event)
    }

    /// Loads events with `begin <= id < end` in increasing identifier order.
    pub fn load_range(&self, tx: &mut Transaction<'_>, range: EventRange) -> Result<EventReader<E>> {
        self.load_ranges(tx, std::slice::from_ref(&range))
    }

    /// Loads events covered by any of `ranges`, merged into one reader that
    /// yields strictly increasing identifiers even when the ranges are
    /// supplied out of order.
    ///
    /// Ranges must be mutually disjoint; the consumer's bookkeeping keeps
    /// them so.
    pub fn load_ranges(
        &self,
        tx: &mut Transaction<'_>,
        ranges: &[EventRange],
    ) -> Result<EventReader<E>> {
        let live: Vec<&EventRange> = ranges.iter().filter(|r| !r.is_empty()).collect();
        if live.is_empty() {
            return Ok(EventReader {
                events: Vec::new().into_iter(),
            });
        }

        let dialect = tx.dialect();
        let id_col = quote_ident(self.columns[0].name);
        let mut predicates = Vec::with_capacity(live.len());
        let mut params: Vec<Value> = Vec::new();
        for range in &live {
            match range.end {
                Some(end) => {
                    predicates.push(format!(
                        "({id_col} >= {} AND {id_col} < {})",
                        dialect.placeholder(params.len()),
                        dialect.placeholder(params.len() + 1),
                    ));
                    params.push(Value::from(range.begin.as_raw()));
                    params.push(Value::from(end.as_raw()));
                }
                None => {
                    predicates.push(format!("({id_col} >= {})", dialect.placeholder(params.len())));
                    params.push(Value::from(range.begin.as_raw()));
                }
            }
        }

        let sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY {id_col}",
            quote_ident(self.table),
            predicates.join(" OR "),
        );
        let rows = tx.query(&sql, &params)?;
        if let Some(first) = rows.first() {
            self.verify_columns(first)?;
        }
        let events: Vec<E> = rows.iter().map(E::from_row).collect::<Result<_>>()?;
        Ok(EventReader {
            events: events.into_iter(),
        })
    }

    /// Returns the highest assigned identifier, or [`EventId::NONE`] for an
    /// empty table. Managers seed their consumer one past this.
    pub fn last_event_id(&self, tx: &mut Transaction<'_>) -> Result<EventId> {
        let id_col = quote_ident(self.columns[0].name);
        let sql = format!("SELECT MAX({id_col}) FROM {}", quote_ident(self.table));
        let row = tx.query_row(&sql, &[])?;
        let max = match row {
            Some(row) => row.opt_integer(0)?.unwrap_or(0),
            None => 0,
        };
        Ok(EventId::from_raw(max))
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
}

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

// =============================================================================
// Event Reader
// =============================================================================

/// An owned iterator over loaded events in increasing identifier order.
pub struct EventReader<E> {
    events: std::vec::IntoIter<E>,
}

impl<E> Iterator for EventReader<E> {
    type Item = E;

    fn next(&mut self) -> Option<E> {
        self.events.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.events.size_hint()
    }
}

impl<E> ExactSizeIterator for EventReader<E> {}

// =============================================================================
// Tests
// =============================================================================
