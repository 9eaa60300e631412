//! # Schema Migrations
//!
//! Named, ordered migrations tracked in a dedicated log table. Re-running an
//! applied migration is a no-op, so startup can unconditionally call
//! [`Migrator::apply_all`]. Unapplying requires every registered migration
//! to be reversible and runs them in reverse registration order.
//!
//! ## The Log Table
//!
//! ```text
//! mirrordb_migration
//! ┌────┬───────┬──────┬─────────┬────────────┐
//! │ id │ group │ name │ version │ applied_at │
//! └────┴───────┴──────┴─────────┴────────────┘
//! ```
//!
//! `group` partitions independent migration sets (e.g. per subsystem)
//! sharing one database. Each migration applies inside one transaction
//! together with its log row, so a crash mid-migration leaves no
//! half-applied marker.

use tracing::{debug, info};

use crate::db::{Database, Transaction};
use crate::dialect::{quote_ident, Column, ColumnType};
use crate::error::Result;
use crate::events::now_ms;
use crate::value::Value;

/// Name of the migration log table.
pub const MIGRATION_TABLE: &str = "mirrordb_migration";

// =============================================================================
// Migrations
// =============================================================================

/// One reversible schema step.
pub trait Migration: Send + Sync {
    /// Unique name within the group. The log keys on it.
    fn name(&self) -> &str;

    /// Schema version this step produces. Bookkeeping only.
    fn version(&self) -> i64 {
        1
    }

    /// Applies the step.
    fn apply(&self, tx: &mut Transaction<'_>) -> Result<()>;

    /// Reverses the step.
    fn unapply(&self, tx: &mut Transaction<'_>) -> Result<()>;
}

// =============================================================================
// Migrator
// =============================================================================

/// An ordered registry of migrations for one group.
pub struct Migrator {
    group: String,
    migrations: Vec<Box<dyn Migration>>,
}

impl Migrator {
    /// Creates an empty registry for `group`.
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            migrations: Vec::new(),
        }
    }

    /// Registers the next migration. Order of registration is the order of
    /// application.
    pub fn register(&mut self, migration: impl Migration + 'static) -> &mut Self {
        self.migrations.push(Box::new(migration));
        self
    }

    /// Applies every registered migration not yet in the log, in
    /// registration order. Already-applied names are skipped.
    pub fn apply_all(&self, db: &Database) -> Result<()> {
        self.ensure_log_table(db)?;
        for migration in &self.migrations {
            let ran = db.with_tx(|tx| {
                if self.is_applied(tx, migration.name())? {
                    return Ok(false);
                }
                migration.apply(tx)?;
                let sql = format!(
                    "INSERT INTO {} ({}, {}, {}, {}) VALUES ({})",
                    quote_ident(MIGRATION_TABLE),
                    quote_ident("group"),
                    quote_ident("name"),
                    quote_ident("version"),
                    quote_ident("applied_at"),
                    tx.dialect().placeholders(4),
                );
                tx.execute(
                    &sql,
                    &[
                        Value::from(self.group.clone()),
                        Value::from(migration.name()),
                        Value::from(migration.version()),
                        Value::from(now_ms()),
                    ],
                )?;
                Ok(true)
            })?;
            if ran {
                info!(group = %self.group, name = migration.name(), "applied migration");
            } else {
                debug!(group = %self.group, name = migration.name(), "migration already applied");
            }
        }
        Ok(())
    }

    /// Unapplies every applied migration of this group, in reverse
    /// registration order.
    pub fn unapply_all(&self, db: &Database) -> Result<()> {
        self.ensure_log_table(db)?;
        for migration in self.migrations.iter().rev() {
            let ran = db.with_tx(|tx| {
                if !self.is_applied(tx, migration.name())? {
                    return Ok(false);
                }
                migration.unapply(tx)?;
                let sql = format!(
                    "DELETE FROM {} WHERE {} = {} AND {} = {}",
                    quote_ident(MIGRATION_TABLE),
                    quote_ident("group"),
                    tx.dialect().placeholder(0),
                    quote_ident("name"),
                    tx.dialect().placeholder(1),
                );
                tx.execute(
                    &sql,
                    &[Value::from(self.group.clone()), Value::from(migration.name())],
                )?;
                Ok(true)
            })?;
            if ran {
                info!(group = %self.group, name = migration.name(), "unapplied migration");
            }
        }
        Ok(())
    }

    fn ensure_log_table(&self, db: &Database) -> Result<()> {
        let columns = vec![
            Column::new("id", ColumnType::Integer).primary_key().auto_increment(),
            Column::new("group", ColumnType::Text),
            Column::new("name", ColumnType::Text),
            Column::new("version", ColumnType::Integer),
            Column::new("applied_at", ColumnType::Integer),
        ];
        let sql = db.dialect().build_create_table(MIGRATION_TABLE, &columns)?;
        db.with_tx(|tx| {
            tx.execute(&sql, &[])?;
            Ok(())
        })
    }

    fn is_applied(&self, tx: &mut Transaction<'_>, name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {} AND {} = {}",
            quote_ident("id"),
            quote_ident(MIGRATION_TABLE),
            quote_ident("group"),
            tx.dialect().placeholder(0),
            quote_ident("name"),
            tx.dialect().placeholder(1),
        );
        let row = tx.query_row(&sql, &[Value::from(self.group.clone()), Value::from(name)])?;
        Ok(row.is_some())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseConfig;
    use std::sync::{Arc, Mutex};

    struct CreateTable {
        name: &'static str,
        table: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl Migration for CreateTable {
        fn name(&self) -> &str {
            self.name
        }

        fn apply(&self, tx: &mut Transaction<'_>) -> Result<()> {
            let columns = vec![
                Column::new("id", ColumnType::Integer).primary_key().auto_increment(),
                Column::new("body", ColumnType::Text),
            ];
            let sql = tx.dialect().build_create_table(self.table, &columns)?;
            tx.execute(&sql, &[])?;
            self.trace.lock().unwrap().push(format!("apply:{}", self.name));
            Ok(())
        }

        fn unapply(&self, tx: &mut Transaction<'_>) -> Result<()> {
            let sql = tx.dialect().build_drop_table(self.table);
            tx.execute(&sql, &[])?;
            self.trace.lock().unwrap().push(format!("unapply:{}", self.name));
            Ok(())
        }
    }

    fn migrator(trace: &Arc<Mutex<Vec<String>>>) -> Migrator {
        let mut migrator = Migrator::new("test");
        migrator.register(CreateTable {
            name: "001_first",
            table: "first",
            trace: trace.clone(),
        });
        migrator.register(CreateTable {
            name: "002_second",
            table: "second",
            trace: trace.clone(),
        });
        migrator
    }

    fn log_names(db: &Database) -> Vec<String> {
        db.with_tx(|tx| {
            let rows = tx.query(
                "SELECT \"name\" FROM \"mirrordb_migration\" ORDER BY \"id\"",
                &[],
            )?;
            rows.iter().map(|r| r.text(0)).collect()
        })
        .unwrap()
    }

    #[test]
    fn test_apply_records_in_order() {
        let db = Database::open(&DatabaseConfig::SqliteInMemory).unwrap();
        let trace = Arc::new(Mutex::new(Vec::new()));
        migrator(&trace).apply_all(&db).unwrap();

        assert_eq!(log_names(&db), vec!["001_first", "002_second"]);
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["apply:001_first", "apply:002_second"]
        );
    }

    #[test]
    fn test_reapply_is_noop() {
        let db = Database::open(&DatabaseConfig::SqliteInMemory).unwrap();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let m = migrator(&trace);
        m.apply_all(&db).unwrap();
        m.apply_all(&db).unwrap();

        assert_eq!(log_names(&db).len(), 2);
        assert_eq!(trace.lock().unwrap().len(), 2, "apply must not run twice");
    }

    #[test]
    fn test_new_registration_applies_incrementally() {
        let db = Database::open(&DatabaseConfig::SqliteInMemory).unwrap();
        let trace = Arc::new(Mutex::new(Vec::new()));
        migrator(&trace).apply_all(&db).unwrap();

        let mut extended = migrator(&trace);
        extended.register(CreateTable {
            name: "003_third",
            table: "third",
            trace: trace.clone(),
        });
        extended.apply_all(&db).unwrap();

        assert_eq!(log_names(&db), vec!["001_first", "002_second", "003_third"]);
        assert_eq!(trace.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_unapply_runs_in_reverse() {
        let db = Database::open(&DatabaseConfig::SqliteInMemory).unwrap();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let m = migrator(&trace);
        m.apply_all(&db).unwrap();
        m.unapply_all(&db).unwrap();

        assert!(log_names(&db).is_empty());
        assert_eq!(
            *trace.lock().unwrap(),
            vec![
                "apply:001_first",
                "apply:002_second",
                "unapply:002_second",
                "unapply:001_first",
            ]
        );
    }

    #[test]
    fn test_groups_are_independent() {
        let db = Database::open(&DatabaseConfig::SqliteInMemory).unwrap();
        let trace = Arc::new(Mutex::new(Vec::new()));
        migrator(&trace).apply_all(&db).unwrap();

        let mut other = Migrator::new("other");
        other.register(CreateTable {
            name: "001_first",
            table: "other_first",
            trace: trace.clone(),
        });
        // Same migration name, different group: applies independently.
        other.apply_all(&db).unwrap();
        assert_eq!(log_names(&db).len(), 3);
    }
}
