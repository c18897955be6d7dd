//! Prepared statement registry.
//!
//! Tracks one prepared handle per statement name through its lifecycle:
//! `Unprepared -> Preparing -> Ready -> (Executing -> Ready)* -> Unprepared`.
//! Executions on one handle are serialized; different names run independently.
//!
//! A handle belongs to the connection it was prepared on. When the managed
//! connection has been replaced since, the next execution prepares the
//! statement again on the new connection before running it.

use crate::db::connection::ConnectionManager;
use crate::db::driver::{Driver, DriverResult};
use crate::db::params;
use crate::error::{DbError, DbResult};
use crate::models::{Args, StatementDef};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Observable lifecycle state of a statement name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementState {
    Unprepared,
    Preparing,
    Ready,
    Executing,
}

struct PreparedStatement<S> {
    handle: S,
    def: StatementDef,
    /// Connection epoch the handle was prepared in
    epoch: u64,
    executing: tokio::sync::Mutex<()>,
}

enum Entry<S> {
    Preparing { generation: u64 },
    Ready(Arc<PreparedStatement<S>>),
}

pub struct StatementRegistry<D: Driver> {
    connections: Arc<ConnectionManager<D>>,
    entries: Mutex<HashMap<String, Entry<D::Statement>>>,
    generation: AtomicU64,
    refreshing: tokio::sync::Mutex<()>,
}

impl<D: Driver> StatementRegistry<D> {
    /// Create an empty registry preparing against `connections`.
    pub fn new(connections: Arc<ConnectionManager<D>>) -> Self {
        Self {
            connections,
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            refreshing: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<D::Statement>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Prepare `def`, replacing any handle already registered under its name.
    pub async fn prepare(&self, def: &StatementDef) -> DbResult<()> {
        let name = def.name.clone();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let replaced = self
            .lock()
            .insert(name.clone(), Entry::Preparing { generation });
        let mut pending = PendingPrepare {
            registry: self,
            name: &name,
            generation,
            finished: false,
        };
        if let Some(Entry::Ready(old)) = replaced {
            debug!(statement = %name, "Replacing prepared statement");
            self.release(&name, old).await;
        }

        let (conn, epoch) = self.connections.acquire_with_epoch().await?;
        let declarations = params::declarations(&def.parameter_specs);
        let prepared = self
            .connections
            .driver()
            .prepare(&conn, &def.sql, &declarations)
            .await;
        pending.finished = true;

        let handle = match prepared {
            Ok(handle) => handle,
            Err(err) => {
                self.remove_pending(&name, generation);
                warn!(statement = %name, error = %err, "Prepare failed");
                return Err(DbError::prepare(&name, err.message, err.code));
            }
        };

        let statement = Arc::new(PreparedStatement {
            handle,
            def: def.clone(),
            epoch,
            executing: tokio::sync::Mutex::new(()),
        });

        let superseded = {
            let mut entries = self.lock();
            match entries.get(&name) {
                Some(Entry::Preparing { generation: g }) if *g == generation => {
                    entries.insert(name.clone(), Entry::Ready(statement));
                    None
                }
                _ => Some(statement),
            }
        };

        match superseded {
            None => {
                info!(
                    statement = %name,
                    params = def.parameter_specs.len(),
                    epoch,
                    "Statement prepared"
                );
            }
            Some(statement) => {
                debug!(statement = %name, "Prepared handle superseded before registration");
                self.release(&name, statement).await;
            }
        }
        Ok(())
    }

    /// Execute the statement registered under `name` with `args`.
    pub async fn execute(&self, name: &str, args: &Args) -> DbResult<DriverResult> {
        let statement = self.current(name).await?;

        let request = params::build(args, &statement.def.parameter_specs)?;
        let _executing = statement.executing.lock().await;

        debug!(statement = %name, params = request.len(), "Executing prepared statement");
        self.connections
            .driver()
            .execute_prepared(&statement.handle, &request)
            .await
            .map_err(DbError::from)
    }

    /// Release the handle registered under `name`.
    pub async fn unprepare(&self, name: &str) -> DbResult<()> {
        let entry = self
            .lock()
            .remove(name)
            .ok_or_else(|| DbError::unknown_statement(name))?;

        match entry {
            // the in-flight prepare notices the removal and releases its handle
            Entry::Preparing { .. } => Ok(()),
            Entry::Ready(statement) => {
                let _executing = statement.executing.lock().await;
                self.connections
                    .driver()
                    .unprepare(&statement.handle)
                    .await
                    .map_err(DbError::from)?;
                info!(statement = %name, "Statement unprepared");
                Ok(())
            }
        }
    }

    fn ready(&self, name: &str) -> DbResult<Arc<PreparedStatement<D::Statement>>> {
        match self.lock().get(name) {
            Some(Entry::Ready(statement)) => Ok(Arc::clone(statement)),
            Some(Entry::Preparing { .. }) => Err(DbError::not_prepared(
                name,
                "statement is still being prepared",
            )),
            None => Err(DbError::not_prepared(name, "statement has not been prepared")),
        }
    }

    /// The ready statement under `name`, prepared again first if the
    /// connection it was prepared on has been replaced.
    async fn current(&self, name: &str) -> DbResult<Arc<PreparedStatement<D::Statement>>> {
        let statement = self.ready(name)?;
        let (_, epoch) = self.connections.acquire_with_epoch().await?;
        if statement.epoch >= epoch {
            return Ok(statement);
        }

        let _refreshing = self.refreshing.lock().await;
        let statement = self.ready(name)?;
        if statement.epoch >= epoch {
            return Ok(statement);
        }
        info!(
            statement = %name,
            prepared_in = statement.epoch,
            epoch,
            "Connection was replaced, preparing statement again"
        );
        self.prepare(&statement.def).await?;
        self.ready(name)
    }

    /// Lifecycle state of `name`.
    pub fn state(&self, name: &str) -> StatementState {
        match self.lock().get(name) {
            None => StatementState::Unprepared,
            Some(Entry::Preparing { .. }) => StatementState::Preparing,
            Some(Entry::Ready(statement)) => {
                if statement.executing.try_lock().is_ok() {
                    StatementState::Ready
                } else {
                    StatementState::Executing
                }
            }
        }
    }

    /// Names of all registered statements, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn remove_pending(&self, name: &str, generation: u64) {
        let mut entries = self.lock();
        if matches!(entries.get(name), Some(Entry::Preparing { generation: g }) if *g == generation)
        {
            entries.remove(name);
        }
    }

    /// Best-effort release of a handle that is no longer registered.
    async fn release(&self, name: &str, statement: Arc<PreparedStatement<D::Statement>>) {
        let _executing = statement.executing.lock().await;
        if let Err(err) = self.connections.driver().unprepare(&statement.handle).await {
            warn!(statement = %name, error = %err, "Failed to release replaced statement");
        }
    }
}

/// Drops the `Preparing` entry if the preparing caller goes away mid-flight.
struct PendingPrepare<'a, D: Driver> {
    registry: &'a StatementRegistry<D>,
    name: &'a str,
    generation: u64,
    finished: bool,
}

impl<D: Driver> Drop for PendingPrepare<'_, D> {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.remove_pending(self.name, self.generation);
        }
    }
}
