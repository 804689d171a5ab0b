//! # Dispatcher
//!
//! Purpose: Turn caller commands into request/reply exchanges on one
//! connection, preserving request order.
//!
//! ## Design Principles
//! 1. **FIFO Matching**: RESP has no correlation ids; reply `i` belongs to
//!    request `i`, so every exchange writes N commands then reads N replies.
//! 2. **Caller-Sized Batches**: `pipeline` is the only batching mechanism;
//!    there is no background queue or flusher.
//! 3. **Explicit Mode Switches**: SUBSCRIBE/PSUBSCRIBE/MONITOR are refused here
//!    and routed through `subscribe`/`monitor`, which consume the dispatcher.
//! 4. **One Transparent Retry**: Recovery is delegated to `ReconnectPolicy`,
//!    and never attempted while a MULTI or WATCH opened through `call` or
//!    `pipeline` is still pending on the server.

use std::sync::Arc;

use respwire_proto::{Command, Reply};
use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::{CloseHandle, Connection, ConnectionState, WriteFailure};
use crate::error::{check_reply, ClientError, ClientResult};
use crate::reconnect::{FailureContext, ReconnectPolicy};
use crate::subscription::{Monitor, Subscriber};

const PUSH_MODE_COMMANDS: [&[u8]; 4] = [b"SUBSCRIBE", b"PSUBSCRIBE", b"SSUBSCRIBE", b"MONITOR"];

/// A failed exchange plus how far it got.
struct ExchangeFailure {
    error: ClientError,
    /// Set when the write itself failed.
    flushed: Option<usize>,
    /// Replies read before a read failed.
    received: usize,
    bytes_written: bool,
}

impl ExchangeFailure {
    fn from_write(failure: WriteFailure) -> Self {
        ExchangeFailure {
            bytes_written: failure.bytes > 0,
            flushed: Some(failure.flushed),
            received: 0,
            error: failure.error,
        }
    }

    fn from_read(error: ClientError, received: usize) -> Self {
        ExchangeFailure {
            error,
            flushed: None,
            received,
            bytes_written: true,
        }
    }

    /// The error as surfaced to the caller for a batch of `total` commands.
    fn into_error(self, total: usize) -> ClientError {
        match self.flushed {
            Some(flushed) if total > 1 => ClientError::PipelineWrite {
                flushed,
                total,
                source: Box::new(self.error),
            },
            None if total > 1 => ClientError::PipelineRead {
                received: self.received,
                total,
                source: Box::new(self.error),
            },
            _ => self.error,
        }
    }
}

/// Server-side transaction state implied by the commands seen so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Boundary {
    multi: bool,
    watching: bool,
}

impl Boundary {
    fn is_open(&self) -> bool {
        self.multi || self.watching
    }

    fn observe(&mut self, cmd: &Command, reply: &Reply) {
        if cmd.is_named(b"EXEC") || cmd.is_named(b"DISCARD") {
            // Both end the transaction and drop every WATCH.
            *self = Boundary::default();
            return;
        }
        // Inside MULTI everything else is only queued.
        if self.multi {
            return;
        }
        if cmd.is_named(b"MULTI") && !reply.is_error() {
            self.multi = true;
        } else if cmd.is_named(b"WATCH") && !reply.is_error() {
            self.watching = true;
        } else if cmd.is_named(b"UNWATCH") {
            self.watching = false;
        }
    }
}

/// Ordered command execution over one exclusively owned connection.
#[derive(Debug)]
pub struct Dispatcher {
    conn: Connection,
    policy: ReconnectPolicy,
    boundary: Boundary,
}

impl Dispatcher {
    /// Opens a connection using `config` and its reconnect settings.
    pub fn connect(config: ClientConfig) -> ClientResult<Self> {
        Self::connect_shared(Arc::new(config))
    }

    pub(crate) fn connect_shared(config: Arc<ClientConfig>) -> ClientResult<Self> {
        let policy = ReconnectPolicy::from_config(&config);
        let conn = Connection::connect(config)?;
        Ok(Dispatcher::from_connection(conn, policy))
    }

    /// Wraps an already connected connection.
    pub fn from_connection(conn: Connection, policy: ReconnectPolicy) -> Self {
        Dispatcher {
            conn,
            policy,
            boundary: Boundary::default(),
        }
    }

    /// Replaces the reconnect policy.
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sends one command and returns its reply.
    ///
    /// An error reply is returned as `ClientError::Command`; the connection
    /// stays usable in that case.
    pub fn call(&mut self, cmd: &Command) -> ClientResult<Reply> {
        let replies = self.exchange(std::slice::from_ref(cmd), false)?;
        let reply = replies
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::unexpected("one reply"))?;
        check_reply(reply)
    }

    /// Writes every command before reading any reply, then reads exactly
    /// `cmds.len()` replies in submission order.
    ///
    /// Error replies stay in place as `Reply::Error` so positions line up.
    pub fn pipeline(&mut self, cmds: &[Command]) -> ClientResult<Vec<Reply>> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        self.exchange(cmds, false)
    }

    /// Runs `cmds` inside MULTI/EXEC as a single pipeline.
    ///
    /// Returns `None` when EXEC replies with a null array (a WATCHed key
    /// changed). Never retried transparently.
    pub fn transaction(&mut self, cmds: &[Command]) -> ClientResult<Option<Vec<Reply>>> {
        let mut batch = Vec::with_capacity(cmds.len() + 2);
        batch.push(Command::new("MULTI"));
        batch.extend(cmds.iter().cloned());
        batch.push(Command::new("EXEC"));

        let mut replies = self.exchange(&batch, true)?.into_iter();
        let exec = replies
            .next_back()
            .ok_or_else(|| ClientError::unexpected("EXEC reply"))?;
        if let Some(multi) = replies.next() {
            check_reply(multi)?;
        }

        // A command rejected at queue time makes EXEC fail with EXECABORT;
        // report the rejection itself.
        let mut rejected = None;
        for queued in replies {
            match queued {
                Reply::Error(message) => {
                    rejected.get_or_insert(message);
                }
                reply if reply.is_status(b"QUEUED") => {}
                _ => return Err(ClientError::unexpected("+QUEUED")),
            }
        }

        match exec {
            Reply::Array(Some(results)) => Ok(Some(results)),
            Reply::Array(None) => Ok(None),
            Reply::Error(message) => Err(ClientError::Command {
                message: rejected.unwrap_or(message),
            }),
            _ => Err(ClientError::unexpected("EXEC array")),
        }
    }

    /// Switches this connection into pub/sub mode.
    pub fn subscribe<I, C>(self, channels: I) -> ClientResult<Subscriber>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let mut subscriber = Subscriber::new(self.conn, self.policy)?;
        subscriber.subscribe(channels)?;
        Ok(subscriber)
    }

    /// Switches this connection into pub/sub mode with pattern subscriptions.
    pub fn psubscribe<I, C>(self, patterns: I) -> ClientResult<Subscriber>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let mut subscriber = Subscriber::new(self.conn, self.policy)?;
        subscriber.psubscribe(patterns)?;
        Ok(subscriber)
    }

    /// Switches this connection into MONITOR mode for the rest of its life.
    pub fn monitor(self) -> ClientResult<Monitor> {
        Monitor::start(self.conn)
    }

    /// Re-establishes the connection after a failure.
    ///
    /// A MULTI or WATCH opened on the old socket is gone afterwards.
    pub fn reconnect(&mut self) -> ClientResult<()> {
        self.boundary = Boundary::default();
        self.conn.reconnect()
    }

    /// True while a MULTI or WATCH sent through `call`/`pipeline` is pending.
    pub fn in_transaction(&self) -> bool {
        self.boundary.is_open()
    }

    pub fn close(&mut self) {
        self.conn.close();
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn close_handle(&self) -> Option<CloseHandle> {
        self.conn.close_handle()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn exchange(&mut self, cmds: &[Command], in_transaction: bool) -> ClientResult<Vec<Reply>> {
        check_commands(cmds)?;
        let state = self.conn.state();
        if state != ConnectionState::Ready {
            return Err(ClientError::State {
                state,
                operation: "send commands",
            });
        }

        let failure = match self.round_trip(cmds) {
            Ok(replies) => return Ok(replies),
            Err(failure) => failure,
        };

        let ctx = FailureContext {
            state,
            commands: cmds.len(),
            bytes_written: failure.bytes_written,
            in_transaction: in_transaction || self.boundary.is_open(),
        };
        if !self.policy.should_retry(&failure.error, &ctx) {
            return Err(failure.into_error(cmds.len()));
        }

        self.policy.pause(&failure.error);
        let retry = match self.conn.reconnect() {
            Ok(()) => self
                .round_trip(cmds)
                .map_err(|retry| retry.into_error(cmds.len())),
            Err(err) => Err(err),
        };
        retry.map_err(|retry| {
            debug!(error = %retry, "retry after reconnect failed");
            ClientError::ReconnectFailed {
                original: Box::new(failure.into_error(cmds.len())),
                retry: Box::new(retry),
            }
        })
    }

    fn round_trip(&mut self, cmds: &[Command]) -> Result<Vec<Reply>, ExchangeFailure> {
        self.conn.send(cmds).map_err(ExchangeFailure::from_write)?;

        let mut replies = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            let reply = self
                .conn
                .read_reply()
                .map_err(|error| ExchangeFailure::from_read(error, replies.len()))?;
            self.boundary.observe(cmd, &reply);
            replies.push(reply);
        }
        Ok(replies)
    }
}

fn check_commands(cmds: &[Command]) -> ClientResult<()> {
    for cmd in cmds {
        if cmd.is_empty() {
            return Err(ClientError::InvalidCommand("empty command"));
        }
        if PUSH_MODE_COMMANDS.iter().any(|name| cmd.is_named(name)) {
            return Err(ClientError::InvalidCommand(
                "push-mode commands must go through subscribe() or monitor()",
            ));
        }
    }
    Ok(())
}
