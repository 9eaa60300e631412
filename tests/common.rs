#![allow(dead_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mirrordb::dialect::{Column, ColumnType};
use mirrordb::{
    Database, DatabaseConfig, EventKind, ManagedObject, Migration, Migrator, ObjectId,
    ObjectRecord, Result, Row, Transaction, Value,
};

/// The example payload entity used across the integration suites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: ObjectId,
    pub owner: String,
    pub status: String,
}

impl Ticket {
    pub fn new(owner: &str, status: &str) -> Self {
        Self {
            id: ObjectId::NONE,
            owner: owner.to_string(),
            status: status.to_string(),
        }
    }
}

impl ObjectRecord for Ticket {
    fn table() -> &'static str {
        "ticket"
    }

    fn columns() -> Vec<Column> {
        vec![
            Column::new("id", ColumnType::Integer).primary_key().auto_increment(),
            Column::new("owner", ColumnType::Text),
            Column::new("status", ColumnType::Text),
        ]
    }

    fn id(&self) -> ObjectId {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn to_row(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::from(self.id.as_raw()),
            Value::from(self.owner.clone()),
            Value::from(self.status.clone()),
        ])
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: ObjectId::from_raw(row.integer(0)?),
            owner: row.text(1)?,
            status: row.text(2)?,
        })
    }
}

impl ManagedObject for Ticket {
    fn event_table() -> &'static str {
        "ticket_event"
    }
}

/// Creates the ticket object and event tables.
pub struct CreateTicketTables;

impl Migration for CreateTicketTables {
    fn name(&self) -> &str {
        "001_create_ticket_tables"
    }

    fn apply(&self, tx: &mut Transaction<'_>) -> Result<()> {
        let dialect = tx.dialect();
        let object_sql = dialect.build_create_table("ticket", &Ticket::columns())?;
        let event_sql = dialect.build_create_table(
            "ticket_event",
            &<mirrordb::ObjectEvent<Ticket> as mirrordb::EventRecord>::columns(),
        )?;
        tx.execute(&object_sql, &[])?;
        tx.execute(&event_sql, &[])?;
        Ok(())
    }

    fn unapply(&self, tx: &mut Transaction<'_>) -> Result<()> {
        let dialect = tx.dialect();
        tx.execute(&dialect.build_drop_table("ticket_event"), &[])?;
        tx.execute(&dialect.build_drop_table("ticket"), &[])?;
        Ok(())
    }
}

/// Opens an in-memory database with the ticket schema applied.
pub fn open_with_schema() -> Database {
    let db = Database::open(&DatabaseConfig::SqliteInMemory).expect("open in-memory db");
    let mut migrator = Migrator::new("tickets");
    migrator.register(CreateTicketTables);
    migrator.apply_all(&db).expect("apply schema migrations");
    db
}

/// Inserts a change event with an explicit identifier, simulating a commit
/// from another process (possibly out of order, possibly leaving gaps).
pub fn insert_raw_event(db: &Database, event_id: i64, kind: EventKind, ticket: &Ticket) {
    db.with_tx(|tx| {
        let payload = match kind {
            EventKind::Delete => Value::Null,
            _ => Value::json(ticket)?,
        };
        tx.execute(
            "INSERT INTO \"ticket_event\" \
             (\"event_id\", \"event_time\", \"event_kind\", \"object_id\", \"payload\") \
             VALUES (?, ?, ?, ?, ?)",
            &[
                Value::from(event_id),
                Value::from(event_id * 10),
                Value::from(kind.as_raw()),
                Value::from(ticket.id.as_raw()),
                payload,
            ],
        )?;
        Ok(())
    })
    .expect("insert raw event");
}

/// Polls `f` until it returns `Some`, panicking after `timeout`.
pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
