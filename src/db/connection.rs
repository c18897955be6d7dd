//! Connection lifecycle management.
//!
//! A [`ConnectionManager`] owns at most one physical connection. The first
//! caller to find it disconnected performs the connect; callers arriving
//! while that connect is in flight queue up and are released in FIFO order
//! with the same connection, or all fail with `ConnectError` if it fails.
//!
//! Each successful connect starts a new epoch. Anything bound to a physical
//! connection, such as a prepared handle, records the epoch it was made in
//! and is stale once the epoch moves on.

use crate::db::driver::Driver;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, ConnectionState};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Waiter<C> = oneshot::Sender<DbResult<(C, u64)>>;

enum Slot<C> {
    Disconnected,
    Connecting { waiters: VecDeque<Waiter<C>> },
    Connected { conn: C, epoch: u64 },
}

impl<C> Slot<C> {
    fn state(&self) -> ConnectionState {
        match self {
            Slot::Disconnected => ConnectionState::Disconnected,
            Slot::Connecting { .. } => ConnectionState::Connecting,
            Slot::Connected { .. } => ConnectionState::Connected,
        }
    }
}

/// Owner of the single managed connection.
pub struct ConnectionManager<D: Driver> {
    driver: Arc<D>,
    config: ConnectionConfig,
    slot: Mutex<Slot<D::Connection>>,
    connects: AtomicUsize,
    epoch: AtomicU64,
}

impl<D: Driver> ConnectionManager<D> {
    /// Create a manager in the `Disconnected` state. No I/O happens until
    /// the first [`acquire`](Self::acquire).
    pub fn new(driver: Arc<D>, config: ConnectionConfig) -> Self {
        Self {
            driver,
            config,
            slot: Mutex::new(Slot::Disconnected),
            connects: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state()
    }

    /// Number of connect calls issued to the driver so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Slot<D::Connection>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get the connection, connecting first if needed.
    pub async fn acquire(&self) -> DbResult<D::Connection> {
        self.acquire_with_epoch().await.map(|(conn, _)| conn)
    }

    /// Get the connection together with the epoch it was opened in.
    pub async fn acquire_with_epoch(&self) -> DbResult<(D::Connection, u64)> {
        let waiter = {
            let mut slot = self.lock();
            match &mut *slot {
                Slot::Connected { conn, epoch } => return Ok((conn.clone(), *epoch)),
                Slot::Connecting { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push_back(tx);
                    debug!(queued = waiters.len(), "Waiting for in-flight connect");
                    Some(rx)
                }
                Slot::Disconnected => {
                    *slot = Slot::Connecting {
                        waiters: VecDeque::new(),
                    };
                    None
                }
            }
        };

        match waiter {
            Some(rx) => rx.await.unwrap_or_else(|_| {
                Err(DbError::connect(
                    "connection attempt was abandoned",
                    "Acquire the connection again",
                ))
            }),
            None => self.connect_as_initiator().await,
        }
    }

    async fn connect_as_initiator(&self) -> DbResult<(D::Connection, u64)> {
        let mut attempt = ConnectAttempt {
            manager: self,
            finished: false,
        };

        info!(
            target_db = %self.config.masked_connection_string(),
            "Connecting to database"
        );
        self.connects.fetch_add(1, Ordering::SeqCst);

        let result = match self.config.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.driver.connect(&self.config)).await
            {
                Ok(result) => result.map_err(DbError::from),
                Err(_) => Err(DbError::connect(
                    format!("connect timed out after {}ms", limit.as_millis()),
                    "Check that the database server is reachable",
                )),
            },
            None => self.driver.connect(&self.config).await.map_err(DbError::from),
        };

        attempt.finished = true;
        match result {
            Ok(conn) => {
                let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                let waiters = self.settle(Slot::Connected {
                    conn: conn.clone(),
                    epoch,
                });
                info!(epoch, released = waiters.len(), "Connected successfully");
                for waiter in waiters {
                    let _ = waiter.send(Ok((conn.clone(), epoch)));
                }
                Ok((conn, epoch))
            }
            Err(err) => {
                let message = err.to_string();
                let waiters = self.settle(Slot::Disconnected);
                warn!(error = %message, failed_waiters = waiters.len(), "Connect failed");
                fail_waiters(waiters, &message);
                Err(err)
            }
        }
    }

    /// Replace a `Connecting` slot, handing back its queued waiters.
    fn settle(&self, next: Slot<D::Connection>) -> VecDeque<Waiter<D::Connection>> {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, next) {
            Slot::Connecting { waiters } => waiters,
            _ => VecDeque::new(),
        }
    }

    /// Forget a connection the caller found to be dropped.
    ///
    /// The next `acquire` performs a fresh connect. An in-flight connect is
    /// left alone.
    pub fn reset(&self) {
        let mut slot = self.lock();
        if matches!(*slot, Slot::Connected { .. }) {
            debug!("Resetting connection state");
            *slot = Slot::Disconnected;
        }
    }

    /// Close the connection if one is established.
    pub async fn disconnect(&self) -> DbResult<()> {
        let conn = {
            let mut slot = self.lock();
            match std::mem::replace(&mut *slot, Slot::Disconnected) {
                Slot::Connected { conn, .. } => Some(conn),
                other => {
                    *slot = other;
                    None
                }
            }
        };

        if let Some(conn) = conn {
            self.driver.close(conn).await?;
            info!("Disconnected");
        }
        Ok(())
    }
}

fn fail_waiters<C>(waiters: VecDeque<Waiter<C>>, message: &str) {
    for waiter in waiters {
        let _ = waiter.send(Err(DbError::connect(
            message.to_string(),
            "The connect attempt this call was waiting on failed; acquire again to retry",
        )));
    }
}

/// Resets the slot if the initiating caller is dropped mid-connect, so the
/// queued waiters are not left pending forever.
struct ConnectAttempt<'a, D: Driver> {
    manager: &'a ConnectionManager<D>,
    finished: bool,
}

impl<D: Driver> Drop for ConnectAttempt<'_, D> {
    fn drop(&mut self) {
        if !self.finished {
            let waiters = self.manager.settle(Slot::Disconnected);
            warn!(
                failed_waiters = waiters.len(),
                "Connect attempt abandoned by its caller"
            );
            fail_waiters(waiters, "connection attempt was abandoned");
        }
    }
}

impl<D: Driver> std::fmt::Debug for ConnectionManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("connects", &self.connect_count())
            .finish()
    }
}
