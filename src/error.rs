//! # Error Handling for MirrorDB
//!
//! This module defines the error types used throughout MirrorDB. A single
//! error enum ([`Error`]) represents every failure mode, which keeps function
//! signatures small and lets callers handle errors uniformly.
//!
//! ## Error Categories
//!
//! | Category    | Examples                               | Typical Response             |
//! |-------------|----------------------------------------|------------------------------|
//! | Fatal       | Schema, SchemaMismatch, InvalidEventId | Abort startup / stop manager |
//! | Recoverable | NotFound, NotReady                     | Surface to the caller        |
//! | Transient   | Sqlite, Postgres                       | Log, retry on next sync tick |

use crate::types::{EventId, ObjectId};
use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in MirrorDB operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Fatal Errors (caught at startup or stop the affected manager)
    // =========================================================================

    /// Invalid or unsupported schema description.
    ///
    /// Raised by the dialect builder when a table declaration cannot be
    /// rendered (empty column list, autoincrement on a non-integer column,
    /// and so on). Always indicates a programming error in a type's column
    /// declaration, so it surfaces during startup, never mid-flight.
    #[error("schema error: {0}")]
    Schema(String),

    /// Stored column layout disagrees with the declared mapping.
    ///
    /// Detected when a full-table load returns columns in a different order
    /// (or with different names) than the type declared. The declared column
    /// list is the single source of truth for SELECT order; a disagreement
    /// means a migration was missed and every decoded row would be misbound.
    ///
    /// # Recovery
    ///
    /// None at runtime. Run the missing migration.
    #[error("schema mismatch on table '{table}': expected columns [{expected}], found [{actual}]")]
    SchemaMismatch {
        /// The table whose layout disagreed.
        table: String,
        /// Comma-joined declared column names.
        expected: String,
        /// Comma-joined column names the database returned.
        actual: String,
    },

    /// The consumer observed an event outside every tracked range.
    ///
    /// This must never occur if range bookkeeping is correct. When it does,
    /// the projection can no longer be trusted: the affected manager is
    /// stopped rather than left serving a possibly-inconsistent cache.
    #[error("invalid event id {id}: outside all tracked ranges")]
    InvalidEventId {
        /// The identifier that fell into no range.
        id: EventId,
    },

    // =========================================================================
    // Recoverable Errors (surface to the caller)
    // =========================================================================

    /// An update or delete affected zero rows.
    ///
    /// Signals a concurrent modification race: the row was deleted (or never
    /// existed) by the time this transaction ran. The caller decides whether
    /// to retry, re-create, or report.
    #[error("object {id} not found in table '{table}'")]
    NotFound {
        /// The table the operation targeted.
        table: String,
        /// The identifier that matched no row.
        id: ObjectId,
    },

    /// A read or write reached a manager that is not in the `Ready` state.
    ///
    /// Reads are only valid once the initial full load has completed, and
    /// become invalid again after the manager stops.
    #[error("manager '{manager}' is not ready")]
    NotReady {
        /// The manager's registered name.
        manager: String,
    },

    // =========================================================================
    // Transient I/O Errors (logged and retried on the next sync tick)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// Wraps any error from the `rusqlite` crate: a locked database file,
    /// full disk, corruption, or a SQL syntax error (the latter indicates a
    /// bug in MirrorDB itself).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// PostgreSQL operation failed.
    ///
    /// Wraps any error from the `postgres` client: connection loss, query
    /// failure, or serialization conflicts.
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),

    /// A value could not be serialized to or decoded from its JSON column.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A background task failed to join.
    #[error("background task failed: {0}")]
    Background(String),
}

impl Error {
    /// Returns true for errors that must stop the affected manager rather
    /// than be retried on the next sync tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Schema(_) | Error::SchemaMismatch { .. } | Error::InvalidEventId { .. }
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
