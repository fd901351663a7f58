//! Bounded connection pool with overflow.
//!
//! Checkout takes an idle connection, creates a new one while under
//! `size + max_overflow`, or blocks up to the checkout timeout. Checkin
//! destroys connections that are unhealthy, older than the recycle age, or
//! in excess of the base size; the rest return to the idle set. One mutex
//! guards all pool state; connections are never shared between concurrent
//! holders.

use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{BrokerError, MontebusResult};

/// Creates fresh connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: PooledResource;

    async fn connect(&self) -> MontebusResult<Self::Conn>;
}

/// A transport-level connection the pool can health-check.
pub trait PooledResource: Send + 'static {
    fn is_healthy(&self) -> bool;
}

/// Bookkeeping for one pooled connection.
#[derive(Debug)]
struct Entry<C> {
    conn: C,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
}

struct State<C> {
    idle: Vec<Entry<C>>,
    /// Connections currently alive: idle plus checked out plus in-flight
    /// creations.
    open: usize,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    cfg: PoolConfig,
    state: Mutex<State<F::Conn>>,
    available: Notify,
}

pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ConnectionFactory> Pool<F> {
    pub fn new(factory: F, cfg: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                cfg,
                state: Mutex::new(State {
                    idle: Vec::new(),
                    open: 0,
                }),
                available: Notify::new(),
            }),
        }
    }

    /// Number of connections currently alive (idle + checked out).
    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().expect("pool mutex").open
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.state.lock().expect("pool mutex").idle.len()
    }

    pub async fn checkout(&self) -> MontebusResult<PooledConnection<F>> {
        let deadline = Instant::now() + self.inner.cfg.checkout_timeout;
        loop {
            enum Plan<C> {
                Reuse(Entry<C>),
                Create,
                Wait,
            }

            let plan = {
                let mut state = self.inner.state.lock().expect("pool mutex");
                loop {
                    match state.idle.pop() {
                        Some(entry) if entry.conn.is_healthy() => break Plan::Reuse(entry),
                        Some(_) => {
                            // Dead idle connection: drop it and keep looking.
                            state.open -= 1;
                        }
                        None => {
                            if state.open < self.inner.cfg.max_open() {
                                state.open += 1;
                                break Plan::Create;
                            }
                            break Plan::Wait;
                        }
                    }
                }
            };

            match plan {
                Plan::Reuse(mut entry) => {
                    entry.last_used_at = Instant::now();
                    entry.use_count += 1;
                    return Ok(PooledConnection {
                        entry: Some(entry),
                        pool: self.inner.clone(),
                    });
                }
                Plan::Create => {
                    match self.inner.factory.connect().await {
                        Ok(conn) => {
                            let now = Instant::now();
                            return Ok(PooledConnection {
                                entry: Some(Entry {
                                    conn,
                                    created_at: now,
                                    last_used_at: now,
                                    use_count: 1,
                                }),
                                pool: self.inner.clone(),
                            });
                        }
                        Err(e) => {
                            let mut state = self.inner.state.lock().expect("pool mutex");
                            state.open -= 1;
                            drop(state);
                            self.inner.available.notify_one();
                            return Err(e);
                        }
                    }
                }
                Plan::Wait => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(BrokerError::PoolExhausted(
                            self.inner.cfg.checkout_timeout,
                        )
                        .into());
                    }
                    if tokio::time::timeout(remaining, self.inner.available.notified())
                        .await
                        .is_err()
                    {
                        return Err(BrokerError::PoolExhausted(
                            self.inner.cfg.checkout_timeout,
                        )
                        .into());
                    }
                }
            }
        }
    }
}

/// A checked-out connection. Returns to the pool on drop; unhealthy, aged or
/// overflow connections are destroyed instead.
pub struct PooledConnection<F: ConnectionFactory> {
    entry: Option<Entry<F::Conn>>,
    pool: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub fn use_count(&self) -> u64 {
        self.entry.as_ref().expect("present until drop").use_count
    }

    pub fn age(&self) -> std::time::Duration {
        self.entry
            .as_ref()
            .expect("present until drop")
            .created_at
            .elapsed()
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Conn;

    fn deref(&self) -> &Self::Target {
        &self.entry.as_ref().expect("present until drop").conn
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(mut entry) = self.entry.take() else {
            return;
        };
        entry.last_used_at = Instant::now();

        let mut state = self.pool.state.lock().expect("pool mutex");
        let over_base = state.open > self.pool.cfg.size;
        let expired = entry.created_at.elapsed() >= self.pool.cfg.recycle_after;
        let healthy = entry.conn.is_healthy();

        if over_base || expired || !healthy {
            debug!(
                over_base,
                expired, healthy, "destroying pooled connection on checkin"
            );
            state.open -= 1;
        } else {
            state.idle.push(entry);
        }
        drop(state);
        self.pool.available.notify_one();
    }
}
