//! # Respwire Sync Client
//!
//! Purpose: Provide a synchronous RESP2 client engine: connection lifecycle,
//! ordered request/reply dispatch, pipelining, transactions, pub/sub, and
//! MONITOR streaming, with optional pooling on top.
//!
//! ## Design Principles
//! 1. **One Owner Per Socket**: A `Connection` is driven by exactly one caller
//!    at a time; cross-thread use goes through `CloseHandle` or the pool.
//! 2. **Typed Modes**: Push modes are separate types (`Subscriber`, `Monitor`),
//!    so request/reply calls cannot interleave with pushed messages.
//! 3. **Minimal Allocation**: Reuse read/write buffers across exchanges.
//! 4. **Explicit Failure**: Any socket or framing error leaves the connection
//!    `Disconnected`; recovery is an explicit `reconnect` or one policy retry.

mod client;
mod config;
mod connection;
mod dispatcher;
mod error;
mod pool;
mod reconnect;
mod subscription;
mod tls;

pub use client::Client;
pub use config::ClientConfig;
pub use connection::{CloseHandle, Connection, ConnectionState};
pub use dispatcher::Dispatcher;
pub use error::{check_reply, ClientError, ClientResult, ErrorKind, HandshakeStep, IoOp};
pub use pool::{ConnectionPool, PooledConnection};
pub use reconnect::{FailureContext, ReconnectPolicy};
pub use subscription::{Messages, Monitor, PushMessage, Subscriber, SubscriptionKind};

pub use respwire_proto::{Command, ProtocolError, Reply};
