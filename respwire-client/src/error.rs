//! # Error Classification
//!
//! Purpose: Map socket failures, framing errors, and server error replies into
//! the small taxonomy callers act on.
//!
//! ## Design Principles
//! 1. **One Error Type**: Every public operation returns `ClientResult<T>`.
//! 2. **Kind Over Variant**: `ErrorKind` is the stable five-way classification;
//!    variants carry the context (step, flushed count, original error).
//! 3. **Verbatim Server Text**: Command errors keep the exact bytes the server sent.

use std::fmt;
use std::io;

use bytes::Bytes;
use respwire_proto::{ProtocolError, Reply};
use thiserror::Error;

use crate::connection::ConnectionState;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// The I/O operation that was in progress when a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Connect,
    Read,
    Write,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoOp::Connect => "connect",
            IoOp::Read => "read",
            IoOp::Write => "write",
        };
        f.write_str(name)
    }
}

/// Setup step issued right after the socket connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    Tls,
    Auth,
    Select,
    SetName,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStep::Tls => "TLS",
            HandshakeStep::Auth => "AUTH",
            HandshakeStep::Select => "SELECT",
            HandshakeStep::SetName => "CLIENT SETNAME",
        };
        f.write_str(name)
    }
}

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed framing; the connection is torn down.
    Protocol,
    /// Server error reply; the connection stays usable.
    Command,
    /// Socket-level failure; reconnect candidate.
    Connection,
    /// Deadline exceeded; the connection is torn down.
    Timeout,
    /// Operation not valid in the current connection state.
    State,
}

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// RESP framing error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Command { message: Bytes },

    /// Network failure while connecting, reading, or writing.
    #[error("connection error during {op}: {source}")]
    Connection {
        op: IoOp,
        #[source]
        source: io::Error,
    },

    /// The configured deadline elapsed.
    #[error("{op} timed out")]
    Timeout { op: IoOp },

    /// Operation rejected because of the connection state.
    #[error("cannot {operation} while connection is {state}")]
    State {
        state: ConnectionState,
        operation: &'static str,
    },

    /// A setup command failed after the socket connected.
    #[error("handshake failed at {step}: {source}")]
    Handshake {
        step: HandshakeStep,
        #[source]
        source: Box<ClientError>,
    },

    /// Writing a pipeline failed after `flushed` of `total` commands reached the socket.
    #[error("pipeline write failed after {flushed}/{total} commands: {source}")]
    PipelineWrite {
        flushed: usize,
        total: usize,
        #[source]
        source: Box<ClientError>,
    },

    /// Reading pipeline replies failed after `received` of `total` arrived.
    #[error("pipeline read failed after {received}/{total} replies: {source}")]
    PipelineRead {
        received: usize,
        total: usize,
        #[source]
        source: Box<ClientError>,
    },

    /// The single transparent retry also failed.
    #[error("connection failed after reconnect attempt: {retry} (original: {original})")]
    ReconnectFailed {
        original: Box<ClientError>,
        retry: Box<ClientError>,
    },

    /// The command cannot be sent as given.
    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),

    /// Configuration rejected before connecting.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// TLS setup failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Pool is at capacity and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,
}

impl ClientError {
    /// Classifies an I/O error raised during `op`.
    pub fn from_io(op: IoOp, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ClientError::Timeout { op },
            _ => ClientError::Connection { op, source: err },
        }
    }

    /// Connection closed by the peer before a full reply arrived.
    pub(crate) fn eof() -> Self {
        ClientError::Connection {
            op: IoOp::Read,
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server"),
        }
    }

    pub(crate) fn unexpected(expected: &'static str) -> Self {
        ClientError::Protocol(ProtocolError::UnexpectedReply { expected })
    }

    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Protocol(_) => ErrorKind::Protocol,
            ClientError::Command { .. } => ErrorKind::Command,
            ClientError::Connection { .. }
            | ClientError::Handshake { .. }
            | ClientError::ReconnectFailed { .. }
            | ClientError::Tls(_)
            | ClientError::PoolExhausted => ErrorKind::Connection,
            ClientError::Timeout { .. } => ErrorKind::Timeout,
            ClientError::PipelineWrite { source, .. } | ClientError::PipelineRead { source, .. } => {
                source.kind()
            }
            ClientError::State { .. }
            | ClientError::InvalidCommand(_)
            | ClientError::InvalidConfig(_) => ErrorKind::State,
        }
    }

    /// True when a reconnect followed by one retry may succeed.
    ///
    /// Exhausted retries and handshake failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Connection { .. } | ClientError::Timeout { .. })
    }

    /// True when the connection that raised this error must not be reused.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Protocol | ErrorKind::Connection | ErrorKind::Timeout
        )
    }

    /// Server error text for command errors.
    pub fn server_message(&self) -> Option<&[u8]> {
        match self {
            ClientError::Command { message } => Some(message),
            _ => None,
        }
    }
}

/// Turns an error reply into `ClientError::Command`; other replies pass through.
pub fn check_reply(reply: Reply) -> ClientResult<Reply> {
    match reply {
        Reply::Error(message) => Err(ClientError::Command { message }),
        other => Ok(other),
    }
}
