//! # Runtime Orchestration
//!
//! The runtime owns the database handle and the lifetime of every manager:
//!
//! 1. `start` initializes all registered managers concurrently and joins
//!    the results in registration order; the first failure stops every
//!    manager and aborts startup.
//! 2. Each initialized manager gets one background sync loop on a fixed
//!    interval. Loops are independent; there is no shared scheduler.
//! 3. `shutdown` flips a watch signal; every loop finishes its current
//!    transaction (sync work runs to completion inside `spawn_blocking`,
//!    never cancelled mid-transaction), exits, and is awaited.
//!
//! ## Failure Handling in the Loop
//!
//! Transient sync errors are logged and retried on the next tick; the
//! manager keeps serving its last-known-good cache. Fatal errors (corrupt
//! consumer bookkeeping, schema mismatch) stop the affected manager and end
//! its loop; other managers are untouched.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::{Database, Transaction};
use crate::error::{Error, Result};
use crate::manager::{ManagedObject, Manager};

// =============================================================================
// Manager Descriptors
// =============================================================================

/// The capabilities the runtime needs from a manager.
///
/// Every registered manager is a descriptor in an explicit list built by
/// the runtime's constructor calls. There is no global registry, and a
/// manager without these capabilities cannot be registered at all.
pub trait ManagedCache: Send + Sync + 'static {
    /// Name for logs and errors.
    fn name(&self) -> &str;

    /// Cold-start load. Called once, before any sync tick.
    fn init(&self, db: &Database) -> Result<()>;

    /// One incremental synchronization pass.
    fn sync(&self, db: &Database) -> Result<()>;

    /// Marks the manager stopped.
    fn stop(&self);
}

impl<T: ManagedObject> ManagedCache for Manager<T> {
    fn name(&self) -> &str {
        Manager::name(self)
    }

    fn init(&self, db: &Database) -> Result<()> {
        Manager::init(self, db)
    }

    fn sync(&self, db: &Database) -> Result<()> {
        Manager::sync(self, db)
    }

    fn stop(&self) {
        Manager::stop(self)
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Runtime tuning.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Fixed interval between sync passes of each manager.
    pub sync_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(1),
        }
    }
}

/// Owns the database, the manager list, and the background sync loops.
pub struct Runtime {
    db: Arc<Database>,
    config: RuntimeConfig,
    managers: Vec<Arc<dyn ManagedCache>>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Creates a runtime around an opened database.
    pub fn new(db: Arc<Database>, config: RuntimeConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            db,
            config,
            managers: Vec::new(),
            shutdown,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Adds a manager descriptor. Registration order is initialization and
    /// error-reporting order.
    pub fn register(&mut self, manager: Arc<dyn ManagedCache>) -> &mut Self {
        self.managers.push(manager);
        self
    }

    /// The shared database handle.
    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    /// Runs `f` inside one transaction on the shared database. This is the
    /// transactional scope every domain write path goes through.
    pub fn with_tx<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> Result<R>) -> Result<R> {
        self.db.with_tx(f)
    }

    /// Initializes every registered manager, then launches one sync loop
    /// per manager.
    ///
    /// Initializations are launched together and joined in registration
    /// order; the first error stops all managers and aborts startup without
    /// launching any loop.
    pub async fn start(&self) -> Result<()> {
        info!(managers = self.managers.len(), "starting runtime");

        let mut inits = Vec::with_capacity(self.managers.len());
        for manager in &self.managers {
            let task = manager.clone();
            let db = self.db.clone();
            inits.push((
                manager.name().to_string(),
                tokio::task::spawn_blocking(move || task.init(&db)),
            ));
        }

        let mut first_err: Option<Error> = None;
        for (name, handle) in inits {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(Error::Background(join_err.to_string())),
            };
            match result {
                Ok(()) => {}
                Err(err) => {
                    error!(manager = %name, %err, "manager failed to initialize");
                    first_err.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_err {
            for manager in &self.managers {
                manager.stop();
            }
            return Err(err);
        }

        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        for manager in &self.managers {
            loops.push(self.spawn_sync_loop(manager.clone()));
        }
        Ok(())
    }

    /// Signals every loop to stop, waits for all of them to exit, then
    /// stops the managers. Loops never abandon a transaction mid-flight.
    pub async fn shutdown(&self) {
        info!("shutting down runtime");
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
            loops.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        for manager in &self.managers {
            manager.stop();
        }
        info!("runtime stopped");
    }

    fn spawn_sync_loop(&self, manager: Arc<dyn ManagedCache>) -> JoinHandle<()> {
        let db = self.db.clone();
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.sync_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        let _ = changed;
                        break;
                    }
                    _ = ticker.tick() => {
                        let task = manager.clone();
                        let task_db = db.clone();
                        match tokio::task::spawn_blocking(move || task.sync(&task_db)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(Error::NotReady { .. })) => {
                                // Stopped elsewhere; nothing left to sync.
                                break;
                            }
                            Ok(Err(err)) if err.is_fatal() => {
                                error!(manager = manager.name(), %err, "fatal sync error; stopping manager");
                                manager.stop();
                                break;
                            }
                            Ok(Err(err)) => {
                                warn!(manager = manager.name(), %err, "sync failed; retrying next tick");
                            }
                            Err(join_err) => {
                                warn!(manager = manager.name(), error = %join_err, "sync task failed to join");
                            }
                        }
                    }
                }
            }
            info!(manager = manager.name(), "sync loop exited");
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
