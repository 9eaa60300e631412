//! # Managers: Cached Projections
//!
//! A manager is the in-memory projection of one entity's current state,
//! built by replaying its event log through the gap-tracking consumer.
//! Reads are synchronous map lookups with no I/O; writes run through the
//! object store and event store inside one transaction and touch the map
//! only after commit.
//!
//! ## State Machine
//!
//! ```text
//! Uninitialized ──init──► Initializing ──loaded──► Ready ──stop──► Stopped
//!                              │                     │
//!                              └──── error ──────────┘ (init retries allowed)
//! ```
//!
//! `init` runs one transaction: a full ordered load of the object table into
//! the map, plus the current max event identifier, which seeds the consumer
//! one past it. `sync` runs one transaction per tick: the consumer delivers
//! events committed since (by this process or any other), and each folds
//! into the map as a create, update, or delete.
//!
//! ## Why Readers Never See Rolled-Back State
//!
//! The write path folds its own event into the map only after `with_tx`
//! commits. The same event later arrives again through the sync loop; the
//! fold is idempotent (full-object replacement keyed by id), so the second
//! application is a no-op.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::consumer::{ConsumerConfig, EventConsumer};
use crate::db::Database;
use crate::dialect::{Column, ColumnType, Dialect};
use crate::error::{Error, Result};
use crate::events::{EventRecord, EventStore};
use crate::object::{ObjectRecord, ObjectStore};
use crate::types::{EventId, ObjectId};
use crate::value::{Row, Value};

// =============================================================================
// Managed Objects and Their Events
// =============================================================================

/// An [`ObjectRecord`] that a manager can cache.
///
/// The JSON bounds cover the event payload: every change event stores the
/// full object snapshot, so replay needs no other source.
pub trait ManagedObject: ObjectRecord + Serialize + DeserializeOwned {
    /// Table the object's change events are appended to.
    fn event_table() -> &'static str;
}

/// How an object changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// Object was created.
    Create,
    /// Object was replaced.
    Update,
    /// Object was deleted.
    Delete,
}

impl EventKind {
    /// Integer stored in the `event_kind` column.
    pub fn as_raw(self) -> i64 {
        match self {
            EventKind::Create => 1,
            EventKind::Update => 2,
            EventKind::Delete => 3,
        }
    }

    /// Decodes the stored integer.
    pub fn from_raw(value: i64) -> Result<Self> {
        match value {
            1 => Ok(EventKind::Create),
            2 => Ok(EventKind::Update),
            3 => Ok(EventKind::Delete),
            other => Err(Error::Schema(format!("unknown event kind {other}"))),
        }
    }
}

/// "Object X changed in way Y at time T", with the post-change snapshot.
///
/// Deletes carry no snapshot, only the identifier.
#[derive(Debug, Clone)]
pub struct ObjectEvent<T> {
    /// Store-assigned event identifier.
    pub id: EventId,
    /// Unix milliseconds, stamped at append.
    pub time: i64,
    /// Change kind.
    pub kind: EventKind,
    /// Identifier of the changed object.
    pub object_id: ObjectId,
    /// Full object state after the change (`None` for deletes).
    pub object: Option<T>,
}

impl<T: ManagedObject> ObjectEvent<T> {
    /// Event for a freshly created object.
    pub fn created(object: &T) -> Self {
        Self {
            id: EventId::NONE,
            time: 0,
            kind: EventKind::Create,
            object_id: object.id(),
            object: Some(object.clone()),
        }
    }

    /// Event for a replaced object.
    pub fn updated(object: &T) -> Self {
        Self {
            id: EventId::NONE,
            time: 0,
            kind: EventKind::Update,
            object_id: object.id(),
            object: Some(object.clone()),
        }
    }

    /// Event for a deleted object.
    pub fn deleted(object_id: ObjectId) -> Self {
        Self {
            id: EventId::NONE,
            time: 0,
            kind: EventKind::Delete,
            object_id,
            object: None,
        }
    }
}

impl<T: ManagedObject> EventRecord for ObjectEvent<T> {
    fn table() -> &'static str {
        T::event_table()
    }

    fn columns() -> Vec<Column> {
        vec![
            Column::new("event_id", ColumnType::Integer).primary_key().auto_increment(),
            Column::new("event_time", ColumnType::Integer),
            Column::new("event_kind", ColumnType::Integer),
            Column::new("object_id", ColumnType::Integer),
            Column::new("payload", ColumnType::Json).nullable(),
        ]
    }

    fn event_id(&self) -> EventId {
        self.id
    }

    fn set_event_id(&mut self, id: EventId) {
        self.id = id;
    }

    fn event_time(&self) -> i64 {
        self.time
    }

    fn set_event_time(&mut self, time_ms: i64) {
        self.time = time_ms;
    }

    fn to_row(&self) -> Result<Vec<Value>> {
        let payload = match &self.object {
            Some(object) => Value::json(object)?,
            None => Value::Null,
        };
        Ok(vec![
            Value::from(self.id.as_raw()),
            Value::from(self.time),
            Value::from(self.kind.as_raw()),
            Value::from(self.object_id.as_raw()),
            payload,
        ])
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: EventId::from_raw(row.integer(0)?),
            time: row.integer(1)?,
            kind: EventKind::from_raw(row.integer(2)?)?,
            object_id: ObjectId::from_raw(row.integer(3)?),
            object: row.opt_json(4)?,
        })
    }
}

// =============================================================================
// Manager State
// =============================================================================

/// Lifecycle state of one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Constructed, not loaded.
    Uninitialized,
    /// Initial full load in progress.
    Initializing,
    /// Serving reads and writes.
    Ready,
    /// Shut down (or halted after corrupt bookkeeping); reads fail.
    Stopped,
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerState::Uninitialized => write!(f, "uninitialized"),
            ManagerState::Initializing => write!(f, "initializing"),
            ManagerState::Ready => write!(f, "ready"),
            ManagerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Per-manager tuning.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerConfig {
    /// Resume point for the consumer. `None` seeds one past the current max
    /// event identifier found during `init` (a cold start that trusts the
    /// full table load); a host that persisted `begin_event_id` across
    /// restarts supplies it here.
    pub low_water_mark: Option<EventId>,
    /// Gap-eviction bounds for the consumer.
    pub consumer: ConsumerConfig,
}

// =============================================================================
// Manager
// =============================================================================

/// In-memory cache of one entity type, kept current by replaying its event
/// log.
pub struct Manager<T: ManagedObject> {
    name: String,
    objects: ObjectStore<T>,
    events: EventStore<ObjectEvent<T>>,
    config: ManagerConfig,
    state: Mutex<ManagerState>,
    cache: RwLock<BTreeMap<i64, T>>,
    consumer: Mutex<Option<EventConsumer<ObjectEvent<T>>>>,
}

impl<T: ManagedObject> Manager<T> {
    /// Creates an unloaded manager.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::with_config(name, ManagerConfig::default())
    }

    /// Creates an unloaded manager with explicit tuning.
    pub fn with_config(name: impl Into<String>, config: ManagerConfig) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            objects: ObjectStore::new()?,
            events: EventStore::new()?,
            config,
            state: Mutex::new(ManagerState::Uninitialized),
            cache: RwLock::new(BTreeMap::new()),
            consumer: Mutex::new(None),
        })
    }

    /// Registered name, used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Renders the `CREATE TABLE` statements for the object and event
    /// tables, for migrations.
    pub fn schema_sql(&self, dialect: Dialect) -> Result<Vec<String>> {
        Ok(vec![
            self.objects.create_table_sql(dialect)?,
            self.events.create_table_sql(dialect)?,
        ])
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Cold-initializes the projection: one transaction performing a full
    /// ordered table load and reading the max event identifier, which seeds
    /// the consumer. Transitions `Uninitialized → Initializing → Ready`.
    ///
    /// On failure the manager returns to `Uninitialized` so a later attempt
    /// can retry.
    pub fn init(&self, db: &Database) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ManagerState::Uninitialized {
                return Err(Error::NotReady {
                    manager: self.name.clone(),
                });
            }
            *state = ManagerState::Initializing;
        }

        let loaded = db
            .with_tx(|tx| {
                let objects = self.objects.load_all(tx)?;
                let last = self.events.last_event_id(tx)?;
                Ok((objects, last))
            })
            .and_then(|(objects, last)| {
                let begin = self.config.low_water_mark.unwrap_or_else(|| last.next());
                let consumer = EventConsumer::with_config(begin, self.config.consumer)?;
                Ok((objects, consumer, begin))
            });

        match loaded {
            Ok((objects, consumer, begin)) => {
                {
                    let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
                    cache.clear();
                    for object in objects {
                        cache.insert(object.id().as_raw(), object);
                    }
                }
                *self.consumer.lock().unwrap_or_else(PoisonError::into_inner) = Some(consumer);
                *self.state.lock().unwrap_or_else(PoisonError::into_inner) = ManagerState::Ready;
                info!(manager = %self.name, begin = begin.as_raw(), "manager ready");
                Ok(())
            }
            Err(err) => {
                *self.state.lock().unwrap_or_else(PoisonError::into_inner) =
                    ManagerState::Uninitialized;
                Err(err)
            }
        }
    }

    /// Pulls events this process has not yet seen (committed by another
    /// process, or by a retried transaction) and folds them into the map.
    /// One transaction per call.
    pub fn sync(&self, db: &Database) -> Result<()> {
        self.require_ready()?;
        let consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);
        let consumer = consumer.as_ref().ok_or_else(|| Error::NotReady {
            manager: self.name.clone(),
        })?;
        db.with_tx(|tx| {
            consumer.consume(tx, |event| {
                self.fold(event);
                Ok(())
            })
        })
    }

    /// Marks the manager stopped; subsequent reads and writes fail with
    /// [`Error::NotReady`]. The cache is left in place but unreachable.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ManagerState::Stopped {
            info!(manager = %self.name, "manager stopped");
            *state = ManagerState::Stopped;
        }
    }

    /// The consumer's resume checkpoint, for hosts that persist it.
    pub fn begin_event_id(&self) -> Result<EventId> {
        let consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);
        consumer
            .as_ref()
            .map(|c| c.begin_event_id())
            .ok_or_else(|| Error::NotReady {
                manager: self.name.clone(),
            })
    }

    // =========================================================================
    // Reads (no I/O; valid only while Ready)
    // =========================================================================

    /// Returns the cached object with `id`.
    pub fn get(&self, id: ObjectId) -> Result<Option<T>> {
        self.require_ready()?;
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.get(&id.as_raw()).cloned())
    }

    /// Returns every cached object in ascending identifier order.
    pub fn snapshot(&self) -> Result<Vec<T>> {
        self.require_ready()?;
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.values().cloned().collect())
    }

    /// Number of cached objects.
    pub fn len(&self) -> Result<usize> {
        self.require_ready()?;
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cache.len())
    }

    /// True when no objects are cached.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // =========================================================================
    // Writes (one transaction; map updated only after commit)
    // =========================================================================

    /// Creates `obj`, appends its change event atomically, and returns the
    /// stored object with its assigned identifier.
    pub fn create(&self, db: &Database, obj: T) -> Result<T> {
        self.require_ready()?;
        let (stored, event) = db.with_tx(|tx| {
            let stored = self.objects.create(tx, obj)?;
            let event = self.events.append(tx, ObjectEvent::created(&stored))?;
            Ok((stored, event))
        })?;
        self.fold(&event);
        Ok(stored)
    }

    /// Replaces the stored row for `obj` and appends its change event.
    ///
    /// Fails with [`Error::NotFound`] if the row was concurrently deleted;
    /// nothing is committed and the map is untouched.
    pub fn update(&self, db: &Database, obj: T) -> Result<T> {
        self.require_ready()?;
        let event = db.with_tx(|tx| {
            self.objects.update(tx, &obj)?;
            self.events.append(tx, ObjectEvent::updated(&obj))
        })?;
        self.fold(&event);
        Ok(obj)
    }

    /// Deletes the row with `id` and appends its change event.
    pub fn delete(&self, db: &Database, id: ObjectId) -> Result<()> {
        self.require_ready()?;
        let event = db.with_tx(|tx| {
            self.objects.delete(tx, id)?;
            self.events.append(tx, ObjectEvent::deleted(id))
        })?;
        self.fold(&event);
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn require_ready(&self) -> Result<()> {
        match self.state() {
            ManagerState::Ready => Ok(()),
            _ => Err(Error::NotReady {
                manager: self.name.clone(),
            }),
        }
    }

    /// Folds one committed event into the map. Idempotent: replaying the
    /// same event reproduces the same entry.
    fn fold(&self, event: &ObjectEvent<T>) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        match event.kind {
            EventKind::Create | EventKind::Update => match &event.object {
                Some(object) => {
                    cache.insert(object.id().as_raw(), object.clone());
                }
                None => {
                    warn!(
                        manager = %self.name,
                        event = event.id.as_raw(),
                        "change event carries no snapshot; skipped"
                    );
                }
            },
            EventKind::Delete => {
                cache.remove(&event.object_id.as_raw());
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
