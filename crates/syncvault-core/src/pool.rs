//! Connection pool
//!
//! Arbitrates concurrent access to a single embedded database file by
//! lending out a bounded set of [`DatabaseConnection`]s, one per
//! logical operation. Connections are created lazily through a
//! caller-supplied factory, validated on checkout with a trivial
//! query, and evicted when idle too long or unhealthy.
//!
//! Creation and validation failures are absorbed and retried
//! transparently; the caller only sees an acquisition failure once no
//! healthy connection can be produced within the acquire timeout.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::contract::DatabaseConnection;
use crate::error::{StorageError, StoreResult};

/// Query used to validate a connection on checkout
const VALIDATION_QUERY: &str = "SELECT 1";

/// Health score below which the pool reports unhealthy
const HEALTH_FLOOR: f64 = 0.5;

/// Creates fresh connections for the pool
pub type ConnectionFactory =
    Box<dyn Fn() -> StoreResult<Box<dyn DatabaseConnection>> + Send + Sync>;

/// Pool sizing and timing configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections
    pub max_size: usize,
    /// How long an acquire may wait for a connection
    pub acquire_timeout: Duration,
    /// Idle connections older than this are destroyed on checkout sweep
    pub idle_timeout: Option<Duration>,
    /// Run the validation query on every checkout
    pub validate_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(300)),
            validate_on_checkout: true,
        }
    }
}

/// Counter snapshot returned by [`ConnectionPool::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquire_successes: u64,
    pub acquire_failures: u64,
    pub validation_failures: u64,
    pub creation_failures: u64,
    pub created: u64,
    pub destroyed: u64,
    pub in_use: usize,
    pub idle: usize,
    pub waiting: usize,
}

/// Health assessment returned by [`ConnectionPool::health`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolHealth {
    /// Combined score in `[0, 1]`
    pub score: f64,
    pub healthy: bool,
}

struct IdleConnection {
    conn: Box<dyn DatabaseConnection>,
    since: Instant,
}

struct PoolState {
    idle: Vec<IdleConnection>,
    /// Idle plus lent-out connections
    total: usize,
    waiting: usize,
    closed: bool,
}

#[derive(Default)]
struct Counters {
    acquire_successes: AtomicU64,
    acquire_failures: AtomicU64,
    validations: AtomicU64,
    validation_failures: AtomicU64,
    creation_failures: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
}

/// Bounded pool of database connections
pub struct ConnectionPool {
    factory: ConnectionFactory,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    counters: Counters,
}

impl ConnectionPool {
    pub fn new(factory: ConnectionFactory, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            factory,
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
                waiting: 0,
                closed: false,
            }),
            available: Condvar::new(),
            counters: Counters::default(),
        })
    }

    /// Acquire a connection, run `operation`, and always release the
    /// connection afterwards, whatever the outcome.
    pub fn with_connection<T>(
        self: &Arc<Self>,
        operation: impl FnOnce(&dyn DatabaseConnection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let conn = self.acquire()?;
        operation(&*conn)
        // conn drops here, returning itself to the pool
    }

    /// Manually acquire a connection for callers that must hold one
    /// across several operations. Released when the guard drops.
    pub fn acquire(self: &Arc<Self>) -> StoreResult<PooledConnection> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let start = Instant::now();
        let mut failures: u64 = 0;

        loop {
            // Failures are retried, but not past pool capacity.
            if failures >= self.config.max_size as u64 {
                self.counters.acquire_failures.fetch_add(1, Ordering::Relaxed);
                return Err(StorageError::AcquireTimeout {
                    waited_ms: start.elapsed().as_millis() as u64,
                    failures,
                });
            }

            let mut state = self.state.lock().expect("pool mutex poisoned");
            if state.closed {
                self.counters.acquire_failures.fetch_add(1, Ordering::Relaxed);
                return Err(StorageError::PoolClosed);
            }

            self.evict_idle(&mut state);

            if let Some(idle) = state.idle.pop() {
                drop(state);
                match self.validate(idle.conn) {
                    Some(conn) => {
                        self.counters.acquire_successes.fetch_add(1, Ordering::Relaxed);
                        return Ok(PooledConnection {
                            conn: Some(conn),
                            pool: Arc::clone(self),
                        });
                    }
                    None => {
                        // Destroyed; loop around and replace it.
                        failures += 1;
                        let mut state = self.state.lock().expect("pool mutex poisoned");
                        state.total -= 1;
                        self.available.notify_one();
                        continue;
                    }
                }
            }

            if state.total < self.config.max_size {
                // Reserve a slot before creating so concurrent
                // acquires cannot overshoot max_size.
                state.total += 1;
                drop(state);
                match (self.factory)() {
                    Ok(conn) => {
                        self.counters.created.fetch_add(1, Ordering::Relaxed);
                        self.counters.acquire_successes.fetch_add(1, Ordering::Relaxed);
                        return Ok(PooledConnection {
                            conn: Some(conn),
                            pool: Arc::clone(self),
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "connection creation failed");
                        self.counters.creation_failures.fetch_add(1, Ordering::Relaxed);
                        failures += 1;
                        let mut state = self.state.lock().expect("pool mutex poisoned");
                        state.total -= 1;
                        self.available.notify_one();
                        continue;
                    }
                }
            }

            // At capacity: wait for a release or the deadline.
            let now = Instant::now();
            if now >= deadline {
                self.counters.acquire_failures.fetch_add(1, Ordering::Relaxed);
                return Err(StorageError::AcquireTimeout {
                    waited_ms: start.elapsed().as_millis() as u64,
                    failures,
                });
            }
            state.waiting += 1;
            let (mut state, _timeout) = self
                .available
                .wait_timeout(state, deadline - now)
                .expect("pool mutex poisoned");
            state.waiting -= 1;
        }
    }

    /// Stop lending connections and destroy all idle ones.
    ///
    /// Connections currently lent out are destroyed as they return.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        state.closed = true;
        let drained = state.idle.drain(..).count();
        state.total -= drained;
        self.counters
            .destroyed
            .fetch_add(drained as u64, Ordering::Relaxed);
        self.available.notify_all();
        debug!(destroyed = drained, "connection pool closed");
    }

    /// Snapshot of pool counters and current occupancy
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().expect("pool mutex poisoned");
        PoolStats {
            acquire_successes: self.counters.acquire_successes.load(Ordering::Relaxed),
            acquire_failures: self.counters.acquire_failures.load(Ordering::Relaxed),
            validation_failures: self.counters.validation_failures.load(Ordering::Relaxed),
            creation_failures: self.counters.creation_failures.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            in_use: state.total - state.idle.len(),
            idle: state.idle.len(),
            waiting: state.waiting,
        }
    }

    /// Computed health assessment.
    ///
    /// The score combines validation success rate, acquisition
    /// success rate, and distance of utilization from 50%. The pool
    /// is unhealthy below the score floor, when outstanding requests
    /// exceed capacity, or when it holds zero connections.
    pub fn health(&self) -> PoolHealth {
        let stats = self.stats();

        let validations = self.counters.validations.load(Ordering::Relaxed);
        let validation_rate = if validations == 0 {
            1.0
        } else {
            1.0 - stats.validation_failures as f64 / validations as f64
        };

        let acquires = stats.acquire_successes + stats.acquire_failures;
        let acquire_rate = if acquires == 0 {
            1.0
        } else {
            stats.acquire_successes as f64 / acquires as f64
        };

        let utilization = if self.config.max_size == 0 {
            0.0
        } else {
            stats.in_use as f64 / self.config.max_size as f64
        };
        let balance = 1.0 - (utilization - 0.5).abs() * 2.0;

        let score = 0.4 * validation_rate + 0.4 * acquire_rate + 0.2 * balance;
        let healthy = score >= HEALTH_FLOOR
            && stats.waiting <= self.config.max_size
            && stats.in_use + stats.idle > 0;

        PoolHealth { score, healthy }
    }

    /// Validate a checked-out connection, destroying it on failure.
    /// Returns the connection if it is healthy.
    fn validate(
        &self,
        conn: Box<dyn DatabaseConnection>,
    ) -> Option<Box<dyn DatabaseConnection>> {
        if !self.config.validate_on_checkout {
            return Some(conn);
        }
        self.counters.validations.fetch_add(1, Ordering::Relaxed);
        match conn.query_one(VALIDATION_QUERY, &[]) {
            Ok(_) => Some(conn),
            Err(err) => {
                warn!(error = %err, "connection failed validation, discarding");
                self.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
                self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Destroy idle connections past the idle timeout. Caller holds
    /// the state lock.
    fn evict_idle(&self, state: &mut PoolState) {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return;
        };
        let before = state.idle.len();
        state.idle.retain(|idle| idle.since.elapsed() < idle_timeout);
        let evicted = before - state.idle.len();
        if evicted > 0 {
            state.total -= evicted;
            self.counters
                .destroyed
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "evicted idle connections");
        }
    }

    fn release(&self, conn: Box<dyn DatabaseConnection>) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        if state.closed {
            state.total -= 1;
            self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        } else {
            state.idle.push(IdleConnection {
                conn,
                since: Instant::now(),
            });
        }
        self.available.notify_one();
    }
}

/// A connection on loan from the pool. Returned on drop.
pub struct PooledConnection {
    conn: Option<Box<dyn DatabaseConnection>>,
    pool: Arc<ConnectionPool>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = dyn DatabaseConnection;

    fn deref(&self) -> &Self::Target {
        // Only None after drop, which the borrow checker rules out.
        self.conn.as_deref().expect("connection already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
