//! # Subscription Engine
//!
//! Purpose: Drive connections that the server switched into push mode
//! (SUBSCRIBE/PSUBSCRIBE or MONITOR) and hand the unsolicited replies to the
//! caller one at a time.
//!
//! ## Design Principles
//! 1. **Dedicated Connection**: A `Subscriber` or `Monitor` owns its socket for
//!    its whole life; it never goes back to a pool while in push mode.
//! 2. **Caller-Driven**: Messages are pulled through `next_message` /
//!    `next_line` or the iterators; the engine never decides when to stop.
//! 3. **Nothing Lost**: Messages that arrive while a (un)subscribe call waits
//!    for its confirmations are queued and delivered first.
//! 4. **Close To Cancel**: Dropping the value, or a `CloseHandle` from another
//!    thread, closes the socket and ends the stream.
//! 5. **No Idle Deadline**: The read timeout covers replies to our own
//!    requests only; waiting for pushed messages blocks indefinitely.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use respwire_proto::{Command, Reply};
use tracing::debug;

use crate::connection::{CloseHandle, Connection, ConnectionState};
use crate::dispatcher::Dispatcher;
use crate::error::{check_reply, ClientError, ClientResult};
use crate::reconnect::ReconnectPolicy;

/// Channel subscriptions versus pattern subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
}

/// One decoded push reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    /// Published on a channel this connection subscribed to.
    Message { channel: Bytes, payload: Bytes },
    /// Published on a channel matching a subscribed pattern.
    PMessage {
        pattern: Bytes,
        channel: Bytes,
        payload: Bytes,
    },
    /// Subscription confirmation; `count` is the server's total after it.
    Subscribe {
        kind: SubscriptionKind,
        channel: Bytes,
        count: i64,
    },
    /// Unsubscription confirmation; `channel` is null when nothing was subscribed.
    Unsubscribe {
        kind: SubscriptionKind,
        channel: Option<Bytes>,
        count: i64,
    },
    /// Reply to PING while subscribed.
    Pong(Bytes),
    /// Any other reply, passed through untouched.
    Other(Reply),
}

impl PushMessage {
    /// Classifies a reply read from a subscribed connection.
    pub fn from_reply(reply: Reply) -> Self {
        let items = match reply {
            Reply::Array(Some(items)) => items,
            other => return PushMessage::Other(other),
        };
        match parse_push(&items) {
            Some(message) => message,
            None => PushMessage::Other(Reply::Array(Some(items))),
        }
    }

    /// `(is_subscribe, kind, count)` for (un)subscribe confirmations.
    fn confirmation(&self) -> Option<(bool, SubscriptionKind, i64)> {
        match self {
            PushMessage::Subscribe { kind, count, .. } => Some((true, *kind, *count)),
            PushMessage::Unsubscribe { kind, count, .. } => Some((false, *kind, *count)),
            _ => None,
        }
    }
}

fn parse_push(items: &[Reply]) -> Option<PushMessage> {
    let bulk = |idx: usize| -> Option<Bytes> {
        match items.get(idx)? {
            Reply::Bulk(Some(data)) | Reply::Simple(data) => Some(data.clone()),
            _ => None,
        }
    };
    let kind = bulk(0)?;

    match (kind.as_ref(), items.len()) {
        (b"message", 3) => Some(PushMessage::Message {
            channel: bulk(1)?,
            payload: bulk(2)?,
        }),
        (b"pmessage", 4) => Some(PushMessage::PMessage {
            pattern: bulk(1)?,
            channel: bulk(2)?,
            payload: bulk(3)?,
        }),
        (b"subscribe", 3) | (b"psubscribe", 3) => Some(PushMessage::Subscribe {
            kind: kind_of(&kind),
            channel: bulk(1)?,
            count: items[2].as_integer()?,
        }),
        (b"unsubscribe", 3) | (b"punsubscribe", 3) => Some(PushMessage::Unsubscribe {
            kind: kind_of(&kind),
            channel: bulk(1),
            count: items[2].as_integer()?,
        }),
        (b"pong", 2) => Some(PushMessage::Pong(bulk(1)?)),
        _ => None,
    }
}

fn kind_of(name: &[u8]) -> SubscriptionKind {
    if name.starts_with(b"p") {
        SubscriptionKind::Pattern
    } else {
        SubscriptionKind::Channel
    }
}

/// A connection in pub/sub mode.
#[derive(Debug)]
pub struct Subscriber {
    conn: Connection,
    policy: ReconnectPolicy,
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
    pending: VecDeque<PushMessage>,
}

impl Subscriber {
    pub(crate) fn new(conn: Connection, policy: ReconnectPolicy) -> ClientResult<Self> {
        match conn.state() {
            ConnectionState::Ready | ConnectionState::Subscribed => Ok(Subscriber {
                conn,
                policy,
                channels: HashSet::new(),
                patterns: HashSet::new(),
                pending: VecDeque::new(),
            }),
            state => Err(ClientError::State {
                state,
                operation: "subscribe",
            }),
        }
    }

    /// Subscribes to `channels` and waits for every confirmation.
    pub fn subscribe<I, C>(&mut self, channels: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let cmd = Command::new("SUBSCRIBE").args_from(channels);
        if cmd.len() < 2 {
            return Err(ClientError::InvalidCommand("SUBSCRIBE needs at least one channel"));
        }
        self.change(cmd, true, SubscriptionKind::Channel)
    }

    /// Subscribes to glob-style `patterns` and waits for every confirmation.
    pub fn psubscribe<I, C>(&mut self, patterns: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let cmd = Command::new("PSUBSCRIBE").args_from(patterns);
        if cmd.len() < 2 {
            return Err(ClientError::InvalidCommand("PSUBSCRIBE needs at least one pattern"));
        }
        self.change(cmd, true, SubscriptionKind::Pattern)
    }

    /// Unsubscribes from `channels`, or from every channel when empty.
    pub fn unsubscribe<I, C>(&mut self, channels: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let cmd = Command::new("UNSUBSCRIBE").args_from(channels);
        self.change(cmd, false, SubscriptionKind::Channel)
    }

    /// Unsubscribes from `patterns`, or from every pattern when empty.
    pub fn punsubscribe<I, C>(&mut self, patterns: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let cmd = Command::new("PUNSUBSCRIBE").args_from(patterns);
        self.change(cmd, false, SubscriptionKind::Pattern)
    }

    /// Sends PING and waits for the matching pong.
    pub fn ping(&mut self, payload: Option<&[u8]>) -> ClientResult<Bytes> {
        self.require_subscribed("ping")?;
        let cmd = match payload {
            Some(data) => Command::new("PING").arg(data),
            None => Command::new("PING"),
        };
        self.conn.restore_read_timeout()?;
        self.send(&cmd)?;
        let pong = loop {
            match self.read_push()? {
                PushMessage::Pong(data) => break data,
                other => self.pending.push_back(other),
            }
        };
        self.settle_read_timeout()?;
        Ok(pong)
    }

    /// Returns the next push message, blocking until one arrives.
    ///
    /// Fails with a state error once the last subscription is gone and the
    /// queue is drained.
    pub fn next_message(&mut self) -> ClientResult<PushMessage> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }
        self.require_subscribed("read push messages")?;
        self.read_push()
    }

    /// Iterator over push messages; ends when the connection leaves push mode.
    pub fn messages(&mut self) -> Messages<'_> {
        Messages { subscriber: self }
    }

    /// Channels currently subscribed, as confirmed by the server.
    pub fn channels(&self) -> impl Iterator<Item = &[u8]> {
        self.channels.iter().map(|c| c.as_ref())
    }

    /// Patterns currently subscribed, as confirmed by the server.
    pub fn patterns(&self) -> impl Iterator<Item = &[u8]> {
        self.patterns.iter().map(|p| p.as_ref())
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn close_handle(&self) -> Option<CloseHandle> {
        self.conn.close_handle()
    }

    /// Closes the connection, ending the stream.
    pub fn close(mut self) {
        self.conn.close();
    }

    /// Returns the connection to ordinary command use.
    ///
    /// Only possible once every channel and pattern has been unsubscribed and
    /// no undelivered messages remain.
    pub fn into_dispatcher(self) -> ClientResult<Dispatcher> {
        let state = self.conn.state();
        if state != ConnectionState::Ready || !self.pending.is_empty() {
            return Err(ClientError::State {
                state,
                operation: "leave pub/sub mode",
            });
        }
        let mut conn = self.conn;
        conn.restore_read_timeout()?;
        Ok(Dispatcher::from_connection(conn, self.policy))
    }

    fn change(&mut self, cmd: Command, subscribing: bool, kind: SubscriptionKind) -> ClientResult<()> {
        let state = self.conn.state();
        if !matches!(state, ConnectionState::Ready | ConnectionState::Subscribed) {
            return Err(ClientError::State {
                state,
                operation: "change subscriptions",
            });
        }

        // Bare UNSUBSCRIBE confirms each current entry, or once with a null
        // channel when there is none.
        let expected = match cmd.len() - 1 {
            0 => self.set(kind).len().max(1),
            n => n,
        };
        self.conn.restore_read_timeout()?;
        self.send(&cmd)?;

        let mut confirmed = 0;
        while confirmed < expected {
            let message = self.read_push()?;
            match message.confirmation() {
                Some((is_subscribe, confirmed_kind, _))
                    if is_subscribe == subscribing && confirmed_kind == kind =>
                {
                    confirmed += 1;
                }
                _ => self.pending.push_back(message),
            }
        }
        self.settle_read_timeout()?;
        debug!(
            command = %String::from_utf8_lossy(cmd.name()),
            channels = self.channels.len(),
            patterns = self.patterns.len(),
            "subscriptions changed"
        );
        Ok(())
    }

    fn send(&mut self, cmd: &Command) -> ClientResult<()> {
        self.conn
            .send(std::slice::from_ref(cmd))
            .map_err(|failure| failure.error)
    }

    /// Reads one reply and mirrors any confirmation into the local sets.
    fn read_push(&mut self) -> ClientResult<PushMessage> {
        let reply = check_reply(self.conn.read_reply()?)?;
        let message = PushMessage::from_reply(reply);
        match &message {
            PushMessage::Subscribe {
                kind,
                channel,
                count,
            } => {
                self.set_mut(*kind).insert(channel.clone());
                self.apply_count(*count);
            }
            PushMessage::Unsubscribe {
                kind,
                channel,
                count,
            } => {
                if let Some(channel) = channel {
                    self.set_mut(*kind).remove(channel);
                }
                self.apply_count(*count);
            }
            _ => {}
        }
        Ok(message)
    }

    fn apply_count(&mut self, count: i64) {
        let state = if count > 0 {
            ConnectionState::Subscribed
        } else {
            self.channels.clear();
            self.patterns.clear();
            ConnectionState::Ready
        };
        self.conn.set_state(state);
    }

    /// Confirmations are awaited under the configured read timeout; an idle
    /// subscription blocks until a message arrives or the socket is closed.
    fn settle_read_timeout(&mut self) -> ClientResult<()> {
        match self.conn.state() {
            ConnectionState::Subscribed => self.conn.set_read_timeout(None),
            _ => self.conn.restore_read_timeout(),
        }
    }

    fn require_subscribed(&self, operation: &'static str) -> ClientResult<()> {
        match self.conn.state() {
            ConnectionState::Subscribed => Ok(()),
            state => Err(ClientError::State { state, operation }),
        }
    }

    fn set(&self, kind: SubscriptionKind) -> &HashSet<Bytes> {
        match kind {
            SubscriptionKind::Channel => &self.channels,
            SubscriptionKind::Pattern => &self.patterns,
        }
    }

    fn set_mut(&mut self, kind: SubscriptionKind) -> &mut HashSet<Bytes> {
        match kind {
            SubscriptionKind::Channel => &mut self.channels,
            SubscriptionKind::Pattern => &mut self.patterns,
        }
    }
}

/// Borrowing iterator over a subscriber's push messages.
///
/// Yields `Err` once if the connection fails, then ends.
pub struct Messages<'a> {
    subscriber: &'a mut Subscriber,
}

impl Iterator for Messages<'_> {
    type Item = ClientResult<PushMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        let sub = &mut *self.subscriber;
        if sub.pending.is_empty() && sub.conn.state() != ConnectionState::Subscribed {
            return None;
        }
        Some(sub.next_message())
    }
}

/// A connection in MONITOR mode.
///
/// Redis has no way to leave MONITOR, so the connection is closed when this
/// value is closed or dropped.
#[derive(Debug)]
pub struct Monitor {
    conn: Connection,
}

impl Monitor {
    pub(crate) fn start(mut conn: Connection) -> ClientResult<Self> {
        let state = conn.state();
        if state != ConnectionState::Ready {
            return Err(ClientError::State {
                state,
                operation: "start monitoring",
            });
        }

        conn.send(&[Command::new("MONITOR")])
            .map_err(|failure| failure.error)?;
        let reply = check_reply(conn.read_reply()?)?;
        if !reply.is_status(b"OK") {
            conn.mark_broken();
            return Err(ClientError::unexpected("+OK after MONITOR"));
        }
        conn.set_state(ConnectionState::Monitoring);
        // Monitor lines arrive only when other clients issue commands.
        conn.set_read_timeout(None)?;
        Ok(Monitor { conn })
    }

    /// Blocks for the next monitor log line.
    pub fn next_line(&mut self) -> ClientResult<Bytes> {
        let state = self.conn.state();
        if state != ConnectionState::Monitoring {
            return Err(ClientError::State {
                state,
                operation: "read monitor lines",
            });
        }
        match self.conn.read_reply()? {
            Reply::Simple(line) => Ok(line),
            Reply::Error(message) => Err(ClientError::Command { message }),
            _ => {
                self.conn.mark_broken();
                Err(ClientError::unexpected("monitor line"))
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn close_handle(&self) -> Option<CloseHandle> {
        self.conn.close_handle()
    }

    pub fn close(mut self) {
        self.conn.close();
    }
}

/// Yields `Err` once if the connection fails, then ends.
impl Iterator for Monitor {
    type Item = ClientResult<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.conn.state() != ConnectionState::Monitoring {
            return None;
        }
        Some(self.next_line())
    }
}
