//! # Client Facade
//!
//! Purpose: Expose a compact, blocking API over the pool, dispatcher, and
//! subscription engine for callers that do not manage connections themselves.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides pooling; each call checks out one
//!    connection, runs one exchange, and returns it.
//! 2. **Explicit Ownership**: A `Client` is constructed and passed around by
//!    the caller; there is no process-wide default instance.
//! 3. **Dedicated Push Connections**: `subscribe`/`monitor` open a fresh
//!    connection outside the pool.

use respwire_proto::{Command, Reply};

use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::subscription::{Monitor, Subscriber};

/// Synchronous client with connection pooling.
///
/// `Client` is `Send + Sync`; share it by reference or clone it (clones share
/// the same pool).
#[derive(Clone)]
pub struct Client {
    pool: ConnectionPool,
}

impl Client {
    /// Creates a client for `host:port` with default settings.
    pub fn connect(host: impl Into<String>, port: u16) -> ClientResult<Self> {
        Self::with_config(ClientConfig::new(host, port))
    }

    /// Creates a client with a custom configuration.
    ///
    /// Connections are opened lazily on first use.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        Ok(Client {
            pool: ConnectionPool::new(config)?,
        })
    }

    /// Sends one command and returns its reply.
    pub fn call(&self, cmd: &Command) -> ClientResult<Reply> {
        self.pool.acquire()?.call(cmd)
    }

    /// Sends a batch back-to-back and returns one reply per command, in order.
    pub fn pipeline(&self, cmds: &[Command]) -> ClientResult<Vec<Reply>> {
        self.pool.acquire()?.pipeline(cmds)
    }

    /// Runs `cmds` inside MULTI/EXEC; `None` means the transaction was aborted.
    pub fn transaction(&self, cmds: &[Command]) -> ClientResult<Option<Vec<Reply>>> {
        self.pool.acquire()?.transaction(cmds)
    }

    /// Checks out one connection for a multi-step exchange (e.g. WATCH, then
    /// reads, then `transaction`).
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        self.pool.acquire()
    }

    /// Opens a dedicated connection subscribed to `channels`.
    pub fn subscribe<I, C>(&self, channels: I) -> ClientResult<Subscriber>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        self.pool.dedicated()?.subscribe(channels)
    }

    /// Opens a dedicated connection subscribed to `patterns`.
    pub fn psubscribe<I, C>(&self, patterns: I) -> ClientResult<Subscriber>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        self.pool.dedicated()?.psubscribe(patterns)
    }

    /// Opens a dedicated connection in MONITOR mode.
    pub fn monitor(&self) -> ClientResult<Monitor> {
        self.pool.dedicated()?.monitor()
    }

    pub fn config(&self) -> &ClientConfig {
        self.pool.config()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}
