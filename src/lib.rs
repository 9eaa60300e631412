//! # MirrorDB - Cache-Synchronized Object/Event Storage
//!
//! MirrorDB is the persistence and cache-synchronization core of a
//! multi-tenant service: a generic SQL-backed object/event storage layer
//! plus in-memory "manager" caches kept consistent with the database by a
//! change-data-capture style event consumer. Every in-process reader gets a
//! consistent, low-latency view of entities that are concurrently mutated
//! and persisted transactionally, without a database round trip per read.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Domain Write Paths                          │
//! │        manager.create / update / delete  (one transaction)      │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Manager (in-memory projection, RwLock'd map)                   │
//! │                                                                 │
//! │  ┌─────────────┐  ┌──────────────┐  ┌────────────────────────┐  │
//! │  │ ObjectStore │  │  EventStore  │  │  EventConsumer         │  │
//! │  │  (CRUD)     │  │ (append-only)│  │  (gap-tracking ranges) │  │
//! │  └─────────────┘  └──────────────┘  └────────────────────────┘  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Database (SQLite via rusqlite, or Postgres) behind with_tx     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Background sync loops (one per manager, launched by the [`runtime`])
//! independently pull events committed by other processes and fold them
//! into each projection in strictly increasing event-id order.
//!
//! ## Core Invariants
//!
//! 1. **Commit-time identifiers**: event ids come from an autoincrement
//!    column, so they can be observed out of order, and aborted
//!    transactions leave permanent gaps.
//! 2. **Exactly-once, in-order delivery**: a consumer applies each event id
//!    once, in increasing order, tracking undelivered ranges and retrying
//!    gaps until they close or are evicted.
//! 3. **Readers never see rolled-back state**: projections are touched only
//!    after the owning transaction commits.
//! 4. **Declared column order is truth**: every stored type declares its
//!    column list once; a disagreement with the database is a fatal schema
//!    mismatch, not a misbind.
//!
//! ## Module Organization
//!
//! - [`error`]: the error taxonomy shared by every layer
//! - [`types`]: identifier newtypes and event ranges
//! - [`value`]: SQL values and owned result rows
//! - [`dialect`]: DDL generation for the two supported dialects
//! - [`db`]: connections and the `with_tx` transaction boundary
//! - [`migrate`]: named, ordered, reversible schema migrations
//! - [`object`]: generic transactional CRUD for declared record types
//! - [`events`]: append-only ordered event logs
//! - [`consumer`]: gap-tracking delivery bookkeeping
//! - [`manager`]: cached projections with a write-through path
//! - [`runtime`]: startup, background sync loops, shutdown

pub mod consumer;
pub mod db;
pub mod dialect;
pub mod error;
pub mod events;
pub mod manager;
pub mod migrate;
pub mod object;
pub mod runtime;
pub mod types;
pub mod value;

pub use consumer::{ConsumerConfig, EventConsumer};
pub use db::{Database, DatabaseConfig, Transaction};
pub use dialect::{Column, ColumnType, Dialect};
pub use error::{Error, Result};
pub use events::{EventReader, EventRecord, EventStore};
pub use manager::{EventKind, ManagedObject, Manager, ManagerConfig, ManagerState, ObjectEvent};
pub use migrate::{Migration, Migrator, MIGRATION_TABLE};
pub use object::{ObjectRecord, ObjectStore};
pub use runtime::{ManagedCache, Runtime, RuntimeConfig};
pub use types::{EventId, EventRange, ObjectId};
pub use value::{Row, Value};
