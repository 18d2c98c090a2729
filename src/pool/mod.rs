//! Connection pool over the embedded engine
//!
//! Physical handles are expensive and the engine serializes access per
//! handle, so the pool lends each one to exactly one borrower at a time.
//! Acquisition order: idle handle (LIFO - reuse keeps page caches warm),
//! then lazy creation under the cap, then a FIFO wait queue with a timer.
//! Release serves the longest-waiting caller first.

use rusqlite::Connection;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::{PoolConfig, PragmaConfig};
use crate::error::ServiceError;

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// A physical engine handle on loan from the pool
///
/// Owned exclusively by one borrower until handed back through
/// [`ConnectionPool::release`] or [`ConnectionPool::invalidate`].
#[derive(Debug)]
pub struct PooledConnection {
    id: u64,
    conn: Connection,
    created_at: Instant,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Monotonic pool counters plus point-in-time occupancy
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ConnectionPoolStats {
    pub created: u64,
    pub acquired: u64,
    pub released: u64,
    pub destroyed: u64,
    pub size: u32,
    pub available: u32,
    pub waiting: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Healthy,
    Warning,
    Critical,
}

/// Utilization-based health view
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolHealth {
    pub status: PoolStatus,
    pub utilization: f64,
    pub size: u32,
    pub available: u32,
    pub waiting: u32,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<PooledConnection>,
}

#[derive(Default)]
struct Counters {
    created: u64,
    acquired: u64,
    released: u64,
    destroyed: u64,
}

struct PoolState {
    idle: Vec<PooledConnection>,
    waiters: VecDeque<Waiter>,
    size: u32,
    closing: bool,
    counters: Counters,
    next_conn_id: u64,
    next_waiter_id: u64,
}

/// Pool of engine handles with FIFO waiting and utilization health
pub struct ConnectionPool {
    conn_str: String,
    pragmas: PragmaConfig,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    /// Pool over a database file
    pub fn new(path: &Path, pragmas: PragmaConfig, config: PoolConfig) -> Self {
        Self::with_conn_str(path.to_string_lossy().into_owned(), pragmas, config)
    }

    /// Pool over a shared in-memory database (for tests). A shared-cache
    /// URI is required so every pooled handle sees the same data.
    pub fn in_memory(pragmas: PragmaConfig, config: PoolConfig) -> Self {
        let seq = MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed);
        let uri = format!(
            "file:indexstore_mem_{}_{}?mode=memory&cache=shared",
            std::process::id(),
            seq
        );
        Self::with_conn_str(uri, pragmas, config)
    }

    fn with_conn_str(conn_str: String, pragmas: PragmaConfig, config: PoolConfig) -> Self {
        Self {
            conn_str,
            pragmas,
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                waiters: VecDeque::new(),
                size: 0,
                closing: false,
                counters: Counters::default(),
                next_conn_id: 1,
                next_waiter_id: 1,
            }),
        }
    }

    /// Open an engine handle and apply every configured tuning parameter
    /// before it is handed to any borrower
    fn open_connection(&self, id: u64) -> Result<PooledConnection, ServiceError> {
        let conn = Connection::open(&self.conn_str)
            .map_err(|e| ServiceError::from_sqlite("pool.open", &e))?;
        conn.execute_batch(&self.pragmas.to_sql())
            .map_err(|e| ServiceError::from_sqlite("pool.configure", &e))?;
        debug!(connection_id = id, "opened pooled connection");
        Ok(PooledConnection {
            id,
            conn,
            created_at: Instant::now(),
        })
    }

    /// Borrow a connection: idle handle, new handle under the cap, or FIFO
    /// wait bounded by the configured acquire timeout
    pub async fn acquire(&self) -> Result<PooledConnection, ServiceError> {
        let (waiter_id, mut rx) = {
            let mut state = self.state.lock().expect("pool lock poisoned");
            if state.closing {
                return Err(ServiceError::connection_failed("pool.acquire", "pool is closed"));
            }
            if let Some(conn) = state.idle.pop() {
                state.counters.acquired += 1;
                return Ok(conn);
            }
            if state.size < self.config.max_connections {
                let id = state.next_conn_id;
                state.next_conn_id += 1;
                state.size += 1;
                match self.open_connection(id) {
                    Ok(conn) => {
                        state.counters.created += 1;
                        state.counters.acquired += 1;
                        return Ok(conn);
                    }
                    Err(err) => {
                        state.size -= 1;
                        return Err(err);
                    }
                }
            }
            let (tx, rx) = oneshot::channel();
            let waiter_id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id: waiter_id, tx });
            (waiter_id, rx)
        };

        let timeout = self.config.acquire_timeout();
        let started = Instant::now();
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(_)) => {
                // Sender dropped: the pool rejected us while closing
                Err(ServiceError::connection_failed("pool.acquire", "pool is closing"))
            }
            Err(_) => {
                {
                    let mut state = self.state.lock().expect("pool lock poisoned");
                    state.waiters.retain(|w| w.id != waiter_id);
                }
                // A release may have raced the timer; keep the handle if so
                if let Ok(conn) = rx.try_recv() {
                    return Ok(conn);
                }
                Err(ServiceError::timeout("pool.acquire", timeout, started.elapsed()))
            }
        }
    }

    /// Hand a connection back: the longest-waiting caller is served first,
    /// otherwise the handle returns to the idle set. During shutdown the
    /// handle is destroyed instead of pooled.
    pub fn release(&self, conn: PooledConnection) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.counters.released += 1;
        if state.closing {
            Self::destroy(&mut state, conn);
            return;
        }
        let mut conn = conn;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(conn) {
                Ok(()) => {
                    state.counters.acquired += 1;
                    return;
                }
                // Waiter timed out between queueing and this release
                Err(returned) => conn = returned,
            }
        }
        state.idle.push(conn);
    }

    /// Destroy a handle the borrower deems unhealthy (a timed-out
    /// transaction leaves the engine state unknown). A replacement is
    /// created immediately when someone is waiting.
    pub fn invalidate(&self, conn: PooledConnection) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.counters.released += 1;
        warn!(connection_id = conn.id(), "invalidating pooled connection");
        Self::destroy(&mut state, conn);

        if !state.closing
            && !state.waiters.is_empty()
            && state.size < self.config.max_connections
        {
            let id = state.next_conn_id;
            state.next_conn_id += 1;
            state.size += 1;
            match self.open_connection(id) {
                Ok(replacement) => {
                    state.counters.created += 1;
                    let mut conn = replacement;
                    while let Some(waiter) = state.waiters.pop_front() {
                        match waiter.tx.send(conn) {
                            Ok(()) => {
                                state.counters.acquired += 1;
                                return;
                            }
                            Err(returned) => conn = returned,
                        }
                    }
                    state.idle.push(conn);
                }
                Err(err) => {
                    state.size -= 1;
                    warn!(error = %err, "failed to open replacement connection");
                }
            }
        }
    }

    fn destroy(state: &mut PoolState, conn: PooledConnection) {
        state.counters.destroyed += 1;
        state.size -= 1;
        drop(conn);
    }

    /// Reject every waiter, destroy every idle handle. Idempotent;
    /// outstanding borrowed handles are destroyed when released.
    pub fn close_all(&self) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        if state.closing {
            return;
        }
        state.closing = true;
        let rejected = state.waiters.len();
        // Dropping the senders fails each waiter with a closing error
        state.waiters.clear();
        while let Some(conn) = state.idle.pop() {
            Self::destroy(&mut state, conn);
        }
        debug!(
            rejected_waiters = rejected,
            remaining_borrowed = state.size,
            "connection pool closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("pool lock poisoned").closing
    }

    pub fn stats(&self) -> ConnectionPoolStats {
        let state = self.state.lock().expect("pool lock poisoned");
        ConnectionPoolStats {
            created: state.counters.created,
            acquired: state.counters.acquired,
            released: state.counters.released,
            destroyed: state.counters.destroyed,
            size: state.size,
            available: state.idle.len() as u32,
            waiting: state.waiters.len() as u32,
        }
    }

    /// Utilization-based health: above 90% is critical, above 80% or any
    /// queued waiter is a warning
    pub fn health_check(&self) -> PoolHealth {
        let stats = self.stats();
        let utilization = if stats.size > 0 {
            f64::from(stats.size - stats.available) / f64::from(stats.size)
        } else {
            0.0
        };
        let status = if utilization > 0.9 {
            PoolStatus::Critical
        } else if utilization > 0.8 || stats.waiting > 0 {
            PoolStatus::Warning
        } else {
            PoolStatus::Healthy
        };
        PoolHealth {
            status,
            utilization,
            size: stats.size,
            available: stats.available,
            waiting: stats.waiting,
        }
    }

    pub fn max_connections(&self) -> u32 {
        self.config.max_connections
    }

    /// Connection string the pool opens handles against
    pub fn conn_str(&self) -> &str {
        &self.conn_str
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionPool")
            .field("max_connections", &self.config.max_connections)
            .field("size", &stats.size)
            .field("available", &stats.available)
            .field("waiting", &stats.waiting)
            .finish()
    }
}
