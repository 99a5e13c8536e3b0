//! Bounded per-backend connection pool.
//!
//! A semaphore with `max_connections` permits gates checked-out handles. A
//! connection is dialed only when the idle set is empty, so the number of
//! live connections (idle plus checked out) never exceeds the permit count.
//! Acquisition blocks while every permit is held; that wait is the proxy's
//! only backpressure against a slow backend.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::core::Backend;
use crate::error::PoolError;

/// Default maximum connections per backend.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Default dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Produces new connections to a backend.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn dial(&self, backend: &Backend) -> io::Result<Self::Conn>;
}

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum live connections to one backend.
    pub max_connections: usize,
    /// Deadline for establishing a connection.
    pub dial_timeout: Option<Duration>,
    /// Deadline for waiting on a saturated pool.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            dial_timeout: Some(DEFAULT_DIAL_TIMEOUT),
            acquire_timeout: None,
        }
    }
}

/// Snapshot of pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently open (idle or checked out).
    pub live: usize,
    /// Connections sitting in the idle set.
    pub idle: usize,
    /// Total connections dialed.
    pub created: u64,
    /// Total acquisitions served from the idle set.
    pub reused: u64,
    /// Total connections closed instead of returned.
    pub evicted: u64,
    /// Total dial attempts that failed.
    pub dial_failures: u64,
    /// Total acquisitions that had to wait for a permit.
    pub waits: u64,
}

#[derive(Default)]
struct PoolStatsInner {
    live: AtomicUsize,
    idle: AtomicUsize,
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    dial_failures: AtomicU64,
    waits: AtomicU64,
}

struct PoolInner<D: Dialer> {
    backend: Backend,
    dialer: Arc<D>,
    settings: PoolSettings,
    idle: Mutex<Vec<D::Conn>>,
    slots: Arc<Semaphore>,
    stats: PoolStatsInner,
}

impl<D: Dialer> PoolInner<D> {
    fn idle_set(&self) -> MutexGuard<'_, Vec<D::Conn>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop_idle(&self) -> Option<D::Conn> {
        let mut idle = self.idle_set();
        let conn = idle.pop()?;
        self.stats.idle.fetch_sub(1, Ordering::Relaxed);
        Some(conn)
    }

    /// Hands `conn` back when the pool is closed. Checked under the idle lock
    /// so nothing lands in the idle set after `close` drained it.
    fn push_idle(&self, conn: D::Conn) -> Result<(), D::Conn> {
        let mut idle = self.idle_set();
        if self.slots.is_closed() {
            return Err(conn);
        }
        idle.push(conn);
        self.stats.idle.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn forget_live(&self) {
        self.stats.live.fetch_sub(1, Ordering::Relaxed);
        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pool of connections to a single backend.
pub struct BackendPool<D: Dialer> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Dialer> Clone for BackendPool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dialer> BackendPool<D> {
    pub fn new(backend: Backend, dialer: Arc<D>, settings: PoolSettings) -> Self {
        let permits = settings.max_connections.min(Semaphore::MAX_PERMITS);

        Self {
            inner: Arc::new(PoolInner {
                backend,
                dialer,
                idle: Mutex::new(Vec::new()),
                slots: Arc::new(Semaphore::new(permits)),
                settings,
                stats: PoolStatsInner::default(),
            }),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Check out a connection.
    ///
    /// Reuses an idle connection when one exists, dials a new one while below
    /// capacity, and otherwise waits for a release or an eviction.
    ///
    /// # Errors
    ///
    /// `PoolError::DialFailed` when dialing fails (not retried),
    /// `PoolError::Exhausted` when the acquire deadline elapses and
    /// `PoolError::Closed` once the pool has been closed.
    pub async fn acquire(&self) -> Result<PooledConnection<D>, PoolError> {
        let permit = self.acquire_slot().await?;

        if let Some(conn) = self.inner.pop_idle() {
            self.inner.stats.reused.fetch_add(1, Ordering::Relaxed);
            trace!(backend = %self.inner.backend, "Reusing pooled connection");
            return Ok(self.checked_out(conn, permit, true));
        }

        let conn = self.dial().await?;
        self.inner.stats.live.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.created.fetch_add(1, Ordering::Relaxed);
        debug!(backend = %self.inner.backend, "Created new backend connection");

        Ok(self.checked_out(conn, permit, false))
    }

    /// Close the pool: wake every waiter with `PoolError::Closed` and drop
    /// idle connections. Checked-out connections are closed when handed back.
    pub fn close(&self) {
        self.inner.slots.close();

        let drained: Vec<D::Conn> = {
            let mut idle = self.inner.idle_set();
            let drained = std::mem::take(&mut *idle);
            self.inner.stats.idle.fetch_sub(drained.len(), Ordering::Relaxed);
            self.inner.stats.live.fetch_sub(drained.len(), Ordering::Relaxed);
            drained
        };
        let count = drained.len();
        drop(drained);

        debug!(backend = %self.inner.backend, closed = count, "Closed connection pool");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.slots.is_closed()
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        let stats = &self.inner.stats;
        PoolStats {
            live: stats.live.load(Ordering::Relaxed),
            idle: stats.idle.load(Ordering::Relaxed),
            created: stats.created.load(Ordering::Relaxed),
            reused: stats.reused.load(Ordering::Relaxed),
            evicted: stats.evicted.load(Ordering::Relaxed),
            dial_failures: stats.dial_failures.load(Ordering::Relaxed),
            waits: stats.waits.load(Ordering::Relaxed),
        }
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        let slots = Arc::clone(&self.inner.slots);

        match Arc::clone(&slots).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(self.closed()),
            Err(TryAcquireError::NoPermits) => {}
        }

        self.inner.stats.waits.fetch_add(1, Ordering::Relaxed);
        debug!(backend = %self.inner.backend, "Pool saturated, waiting for a connection");

        let started = Instant::now();
        let waiting = slots.acquire_owned();
        let acquired = match self.inner.settings.acquire_timeout {
            Some(limit) => timeout(limit, waiting).await.map_err(|_| {
                PoolError::Exhausted {
                    backend: self.inner.backend.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                }
            })?,
            None => waiting.await,
        };

        acquired.map_err(|_| self.closed())
    }

    async fn dial(&self) -> Result<D::Conn, PoolError> {
        let backend = &self.inner.backend;
        let dialing = self.inner.dialer.dial(backend);

        let result = match self.inner.settings.dial_timeout {
            Some(limit) => timeout(limit, dialing).await.unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial timed out after {}ms", limit.as_millis()),
                ))
            }),
            None => dialing.await,
        };

        result.map_err(|source| {
            self.inner.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
            warn!(backend = %backend, error = %source, "Failed to dial backend");
            PoolError::DialFailed {
                backend: backend.to_string(),
                source,
            }
        })
    }

    fn checked_out(
        &self,
        conn: D::Conn,
        permit: OwnedSemaphorePermit,
        reused: bool,
    ) -> PooledConnection<D> {
        PooledConnection {
            conn,
            lease: Lease {
                pool: Arc::clone(&self.inner),
                returned: false,
                _permit: permit,
            },
            reused,
        }
    }

    fn closed(&self) -> PoolError {
        PoolError::Closed {
            backend: self.inner.backend.to_string(),
        }
    }
}

/// Accounting for one checked-out connection. Dropping a lease that was not
/// returned counts the connection as evicted; the permit is released last.
struct Lease<D: Dialer> {
    pool: Arc<PoolInner<D>>,
    returned: bool,
    _permit: OwnedSemaphorePermit,
}

impl<D: Dialer> Drop for Lease<D> {
    fn drop(&mut self) {
        if !self.returned {
            self.pool.forget_live();
        }
    }
}

/// A connection checked out of a [`BackendPool`].
///
/// Hand it back with [`release`](Self::release) after a clean round trip or
/// discard it with [`evict`](Self::evict) after any I/O failure. Dropping the
/// handle without either evicts it.
pub struct PooledConnection<D: Dialer> {
    conn: D::Conn,
    lease: Lease<D>,
    reused: bool,
}

impl<D: Dialer> PooledConnection<D> {
    pub fn get_ref(&self) -> &D::Conn {
        &self.conn
    }

    pub fn get_mut(&mut self) -> &mut D::Conn {
        &mut self.conn
    }

    pub fn backend(&self) -> &Backend {
        &self.lease.pool.backend
    }

    /// Whether this connection came from the idle set.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Return a healthy connection to the idle set.
    pub fn release(self) {
        let PooledConnection { conn, mut lease, .. } = self;

        // Must be idle before the permit is released, or a waiter could dial past capacity
        match lease.pool.push_idle(conn) {
            Ok(()) => lease.returned = true,
            // Lease drop accounts for the close
            Err(conn) => drop(conn),
        }
    }

    /// Close the connection instead of returning it.
    pub fn evict(self) {
        let PooledConnection { conn, lease, .. } = self;
        drop(conn);
        trace!(backend = %lease.pool.backend, "Evicted backend connection");
        drop(lease);
    }
}
