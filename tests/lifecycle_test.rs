//! Full-stack lifecycle: migrations, runtime startup, write-through caching,
//! background synchronization of foreign commits, and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Ticket;
use mirrordb::{
    Database, DatabaseConfig, Error, EventKind, Manager, ManagerState, Migrator, ObjectId,
    Runtime, RuntimeConfig,
};

fn build_runtime() -> (Arc<Database>, Arc<Manager<Ticket>>, Runtime) {
    let db = Arc::new(common::open_with_schema());
    let manager = Arc::new(Manager::<Ticket>::new("tickets").unwrap());
    let mut runtime = Runtime::new(
        db.clone(),
        RuntimeConfig {
            sync_interval: Duration::from_millis(10),
        },
    );
    runtime.register(manager.clone());
    (db, manager, runtime)
}

#[tokio::test]
async fn writes_are_readable_immediately_after_commit() {
    let (db, manager, runtime) = build_runtime();
    runtime.start().await.unwrap();
    assert_eq!(manager.state(), ManagerState::Ready);

    let created = manager.create(&db, Ticket::new("alice", "open")).unwrap();
    assert_eq!(
        manager.get(created.id).unwrap().unwrap().owner,
        "alice",
        "no sync tick needed for own writes"
    );

    let mut closed = created.clone();
    closed.status = "closed".to_string();
    manager.update(&db, closed).unwrap();
    assert_eq!(manager.get(created.id).unwrap().unwrap().status, "closed");

    runtime.shutdown().await;
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert!(matches!(manager.get(created.id), Err(Error::NotReady { .. })));
}

#[tokio::test]
async fn background_loop_picks_up_foreign_commits() {
    let (db, manager, runtime) = build_runtime();
    runtime.start().await.unwrap();

    // Another process writes a row and its change event directly.
    let foreign = Ticket {
        id: ObjectId::from_raw(1),
        owner: "remote".to_string(),
        status: "open".to_string(),
    };
    db.with_tx(|tx| {
        tx.insert(
            "INSERT INTO \"ticket\" (\"owner\", \"status\") VALUES (?, ?)",
            &[
                mirrordb::Value::from("remote"),
                mirrordb::Value::from("open"),
            ],
            "id",
        )?;
        Ok(())
    })
    .unwrap();
    common::insert_raw_event(&db, 1, EventKind::Create, &foreign);

    let loaded = common::eventually(
        Duration::from_secs(2),
        Duration::from_millis(5),
        || manager.get(ObjectId::from_raw(1)).ok().flatten(),
    )
    .await;
    assert_eq!(loaded.owner, "remote");

    runtime.shutdown().await;
}

#[tokio::test]
async fn foreign_delete_evicts_cached_entry() {
    let (db, manager, runtime) = build_runtime();
    runtime.start().await.unwrap();

    let created = manager.create(&db, Ticket::new("bob", "open")).unwrap();
    assert!(manager.get(created.id).unwrap().is_some());

    db.with_tx(|tx| {
        tx.execute(
            "DELETE FROM \"ticket\" WHERE \"id\" = ?",
            &[mirrordb::Value::from(created.id.as_raw())],
        )?;
        Ok(())
    })
    .unwrap();
    common::insert_raw_event(&db, 2, EventKind::Delete, &created);

    common::eventually(Duration::from_secs(2), Duration::from_millis(5), || {
        match manager.get(created.id) {
            Ok(None) => Some(()),
            _ => None,
        }
    })
    .await;

    runtime.shutdown().await;
}

#[tokio::test]
async fn init_loads_preexisting_state_before_ready() {
    let db = Arc::new(common::open_with_schema());
    db.with_tx(|tx| {
        for owner in ["a", "b"] {
            tx.insert(
                "INSERT INTO \"ticket\" (\"owner\", \"status\") VALUES (?, ?)",
                &[mirrordb::Value::from(owner), mirrordb::Value::from("open")],
                "id",
            )?;
        }
        Ok(())
    })
    .unwrap();

    let manager = Arc::new(Manager::<Ticket>::new("tickets").unwrap());
    let mut runtime = Runtime::new(db.clone(), RuntimeConfig::default());
    runtime.register(manager.clone());

    assert!(matches!(manager.snapshot(), Err(Error::NotReady { .. })));
    runtime.start().await.unwrap();

    let owners: Vec<String> = manager
        .snapshot()
        .unwrap()
        .into_iter()
        .map(|t| t.owner)
        .collect();
    assert_eq!(owners, vec!["a", "b"]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn missing_schema_fails_startup() {
    // No migrations applied: the full load cannot run.
    let db = Arc::new(Database::open(&DatabaseConfig::SqliteInMemory).unwrap());
    let manager = Arc::new(Manager::<Ticket>::new("tickets").unwrap());
    let mut runtime = Runtime::new(db, RuntimeConfig::default());
    runtime.register(manager.clone());

    assert!(runtime.start().await.is_err());
    assert_eq!(manager.state(), ManagerState::Stopped);
}

#[test]
fn unapply_reverses_the_schema() {
    let db = common::open_with_schema();

    let mut migrator = Migrator::new("tickets");
    migrator.register(common::CreateTicketTables);
    migrator.unapply_all(&db).unwrap();

    let err = db
        .with_tx(|tx| tx.query("SELECT * FROM \"ticket\"", &[]))
        .unwrap_err();
    assert!(matches!(err, Error::Sqlite(_)), "table should be gone: {err:?}");
}
