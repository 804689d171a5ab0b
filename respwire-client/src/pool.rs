//! # Connection Pool
//!
//! Purpose: Reuse connections across callers so concurrent work runs on
//! separate sockets instead of interleaving on one.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable dispatchers.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 3. **Fail Fast**: Exceeding the pool limit returns an error immediately.
//! 4. **Only Healthy Returns**: A connection goes back only in `Ready` state
//!    with no MULTI/WATCH pending; anything else is discarded.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::ConnectionState;
use crate::dispatcher::Dispatcher;
use crate::error::{ClientError, ClientResult};

struct PoolState {
    idle: VecDeque<Dispatcher>,
    total: usize,
}

struct PoolInner {
    config: Arc<ClientConfig>,
    state: Mutex<PoolState>,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool; connections are opened on demand.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
        };
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config: Arc::new(config),
                state: Mutex::new(state),
            }),
        })
    }

    /// Acquires an idle connection or opens a new one.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        if let Some(conn) = self.pop_idle() {
            return Ok(PooledConnection::new(self.clone(), conn));
        }

        if !self.try_reserve() {
            return Err(ClientError::PoolExhausted);
        }

        match Dispatcher::connect_shared(Arc::clone(&self.inner.config)) {
            Ok(conn) => Ok(PooledConnection::new(self.clone(), conn)),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Opens a connection that never counts against or returns to the pool.
    pub fn dedicated(&self) -> ClientResult<Dispatcher> {
        Dispatcher::connect_shared(Arc::clone(&self.inner.config))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// `(idle, total)` connection counts.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.inner.state.lock();
        (state.idle.len(), state.total)
    }

    fn pop_idle(&self) -> Option<Dispatcher> {
        let mut state = self.inner.state.lock();
        state.idle.pop_front()
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.total >= self.inner.config.max_total {
            return false;
        }
        state.total += 1;
        true
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.total = state.total.saturating_sub(1);
    }

    fn return_connection(&self, conn: Dispatcher) {
        let mut state = self.inner.state.lock();
        if state.idle.len() < self.inner.config.max_idle {
            state.idle.push_back(conn);
        } else {
            state.total = state.total.saturating_sub(1);
        }
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<Dispatcher>,
}

impl PooledConnection {
    fn new(pool: ConnectionPool, conn: Dispatcher) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
        }
    }

    /// Removes the connection from the pool's accounting and hands it over,
    /// e.g. to switch it into push mode.
    pub fn detach(mut self) -> Dispatcher {
        let conn = self.conn.take().expect("connection exists");
        self.pool.release_slot();
        conn
    }
}

impl Deref for PooledConnection {
    type Target = Dispatcher;

    fn deref(&self) -> &Dispatcher {
        self.conn.as_ref().expect("connection exists")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Dispatcher {
        self.conn.as_mut().expect("connection exists")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if conn.state() == ConnectionState::Ready && !conn.in_transaction() {
            self.pool.return_connection(conn);
        } else {
            debug!(
                state = %conn.state(),
                in_transaction = conn.in_transaction(),
                "discarding pooled connection"
            );
            self.pool.release_slot();
        }
    }
}
