//! # Reconnect Policy
//!
//! Purpose: Decide whether a failed exchange may be repaired by reconnecting
//! and sending the same commands once more.
//!
//! ## Rules
//! - Only socket failures and timeouts qualify; protocol, command, and state
//!   errors never do.
//! - Never inside a MULTI/EXEC transaction.
//! - Never for a connection in push mode (Subscribed/Monitoring): restoring
//!   subscriptions is a caller-visible state change.
//! - A single command may be retried even if it was written; a multi-command
//!   pipeline only if none of its bytes reached the socket.
//! - At most one retry, with the commands resent verbatim.

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::config::ClientConfig;
use crate::connection::ConnectionState;
use crate::error::ClientError;

/// What the dispatcher knows about a failed exchange.
#[derive(Debug, Clone, Copy)]
pub struct FailureContext {
    /// Connection state when the exchange started.
    pub state: ConnectionState,
    /// Number of commands in the exchange.
    pub commands: usize,
    /// Whether any bytes of the exchange were written.
    pub bytes_written: bool,
    /// Whether the exchange is a MULTI/EXEC block.
    pub in_transaction: bool,
}

/// Single-retry reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempts: u8,
    delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(attempts: u8, delay: Duration) -> Self {
        ReconnectPolicy {
            attempts: attempts.min(1),
            delay,
        }
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        ReconnectPolicy::new(0, Duration::ZERO)
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        ReconnectPolicy::new(config.reconnect_attempts, config.reconnect_delay)
    }

    pub fn is_enabled(&self) -> bool {
        self.attempts > 0
    }

    /// Returns true when the exchange described by `ctx` may be retried once.
    pub fn should_retry(&self, err: &ClientError, ctx: &FailureContext) -> bool {
        if !self.is_enabled() || !err.is_retryable() || ctx.in_transaction {
            return false;
        }
        if matches!(
            ctx.state,
            ConnectionState::Subscribed | ConnectionState::Monitoring
        ) {
            return false;
        }
        ctx.commands <= 1 || !ctx.bytes_written
    }

    /// Sleeps for the configured delay before reconnecting.
    pub(crate) fn pause(&self, err: &ClientError) {
        warn!(error = %err, delay_ms = self.delay.as_millis() as u64, "reconnecting after failure");
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::new(1, Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoOp;
    use respwire_proto::ProtocolError;

    fn ctx(commands: usize, bytes_written: bool) -> FailureContext {
        FailureContext {
            state: ConnectionState::Ready,
            commands,
            bytes_written,
            in_transaction: false,
        }
    }

    fn reset() -> ClientError {
        ClientError::from_io(IoOp::Read, std::io::Error::from(std::io::ErrorKind::ConnectionReset))
    }

    #[test]
    fn retries_single_command_after_socket_failure() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(&reset(), &ctx(1, true)));
        assert!(policy.should_retry(&ClientError::Timeout { op: IoOp::Read }, &ctx(1, true)));
    }

    #[test]
    fn pipelines_retry_only_before_any_write() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(&reset(), &ctx(3, false)));
        assert!(!policy.should_retry(&reset(), &ctx(3, true)));
    }

    #[test]
    fn never_retries_non_socket_errors() {
        let policy = ReconnectPolicy::default();
        let protocol = ClientError::from(ProtocolError::MissingCrlf);
        let command = ClientError::Command {
            message: bytes::Bytes::from_static(b"ERR nope"),
        };
        assert!(!policy.should_retry(&protocol, &ctx(1, true)));
        assert!(!policy.should_retry(&command, &ctx(1, true)));
    }

    #[test]
    fn never_retries_transactions_or_push_mode() {
        let policy = ReconnectPolicy::default();
        let mut in_multi = ctx(4, false);
        in_multi.in_transaction = true;
        assert!(!policy.should_retry(&reset(), &in_multi));

        for state in [ConnectionState::Subscribed, ConnectionState::Monitoring] {
            let mut push = ctx(1, true);
            push.state = state;
            assert!(!policy.should_retry(&reset(), &push));
        }
    }

    #[test]
    fn disabled_policy_and_attempt_cap() {
        assert!(!ReconnectPolicy::disabled().should_retry(&reset(), &ctx(1, false)));
        assert_eq!(ReconnectPolicy::new(5, Duration::ZERO), ReconnectPolicy::default());
    }
}
