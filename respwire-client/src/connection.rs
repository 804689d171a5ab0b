//! # Connection Manager
//!
//! Purpose: Own one TCP (optionally TLS) socket, apply the configured
//! timeouts, run the AUTH/SELECT handshake, and expose framed read/write
//! primitives to the dispatcher and subscription engine.
//!
//! ## Design Principles
//! 1. **Single Owner**: A `Connection` is driven by one caller at a time; it is
//!    `Send` but deliberately not shared.
//! 2. **Broken Means Gone**: Any I/O, timeout, or framing failure drops the
//!    socket and moves to `Disconnected`; a desynchronized stream is never reused.
//! 3. **Buffer Reuse**: Read and write buffers live on the connection.
//! 4. **Out-of-Band Cancel**: `CloseHandle` shuts the socket down from another
//!    thread, unblocking a pending read.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use respwire_proto::{encode_command, Command, Decoder, Reply};
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::error::{check_reply, ClientError, ClientResult, HandshakeStep, IoOp};
use crate::tls::{self, TlsStream};

const READ_CHUNK: usize = 16 * 1024;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable socket; `reconnect` is required.
    Disconnected,
    /// Socket or handshake in progress.
    Connecting,
    /// Accepting ordinary commands.
    Ready,
    /// Pub/sub push mode.
    Subscribed,
    /// MONITOR push mode; left only by closing.
    Monitoring,
    /// Closed by the caller.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Subscribed => "subscribed",
            ConnectionState::Monitoring => "monitoring",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(tcp) => tcp,
            Stream::Tls(tls) => &tls.sock,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(tcp) => tcp.read(buf),
            Stream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(tcp) => tcp.write(buf),
            Stream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(tcp) => tcp.flush(),
            Stream::Tls(tls) => tls.flush(),
        }
    }
}

/// Shuts a connection's socket down from any thread.
///
/// A blocked read on the owning side returns with a connection error. The
/// handle refers to the socket that existed when it was taken; after a
/// reconnect, take a new one.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    socket: Arc<TcpStream>,
}

impl CloseHandle {
    /// Idempotent; errors from an already-closed socket are ignored.
    pub fn close(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// How much of a batch was written before a write failed.
#[derive(Debug)]
pub(crate) struct WriteFailure {
    /// Commands whose encoding reached the socket in full.
    pub flushed: usize,
    /// Raw bytes written.
    pub bytes: usize,
    pub error: ClientError,
}

/// Single server connection with reusable buffers.
pub struct Connection {
    config: Arc<ClientConfig>,
    stream: Option<Stream>,
    closer: Option<CloseHandle>,
    state: ConnectionState,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    scratch: Box<[u8]>,
}

impl Connection {
    /// Connects to the configured server and runs the handshake.
    pub fn connect(config: Arc<ClientConfig>) -> ClientResult<Self> {
        config.validate()?;
        let mut conn = Connection {
            config,
            stream: None,
            closer: None,
            state: ConnectionState::Disconnected,
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(256),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        };
        conn.establish()?;
        Ok(conn)
    }

    /// Drops the current socket (if any) and connects again.
    pub fn reconnect(&mut self) -> ClientResult<()> {
        self.shutdown_stream();
        self.establish()
    }

    fn establish(&mut self) -> ClientResult<()> {
        self.state = ConnectionState::Connecting;
        self.decoder.reset();
        self.read_buf.clear();
        self.write_buf.clear();

        let tcp = match open_socket(&self.config) {
            Ok(tcp) => tcp,
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                return Err(err);
            }
        };
        let closer = tcp
            .try_clone()
            .map_err(|e| ClientError::from_io(IoOp::Connect, e));
        let stream = if self.config.tls {
            tls::connect(tcp, &self.config)
                .map(|tls| Stream::Tls(Box::new(tls)))
                .map_err(|err| ClientError::Handshake {
                    step: HandshakeStep::Tls,
                    source: Box::new(err),
                })
        } else {
            Ok(Stream::Plain(tcp))
        };
        let (stream, closer) = match (stream, closer) {
            (Ok(stream), Ok(closer)) => (stream, closer),
            (Err(err), _) | (_, Err(err)) => {
                self.state = ConnectionState::Disconnected;
                return Err(err);
            }
        };

        self.stream = Some(stream);
        self.closer = Some(CloseHandle {
            socket: Arc::new(closer),
        });

        if let Err(err) = self.handshake() {
            self.mark_broken();
            return Err(err);
        }

        self.state = ConnectionState::Ready;
        debug!(addr = %self.config.addr(), db = self.config.db, tls = self.config.tls, "connected");
        Ok(())
    }

    fn handshake(&mut self) -> ClientResult<()> {
        let config = Arc::clone(&self.config);
        if let Some(password) = &config.password {
            let cmd = match &config.username {
                Some(user) => Command::new("AUTH").arg(user).arg(password),
                None => Command::new("AUTH").arg(password),
            };
            self.handshake_step(HandshakeStep::Auth, &cmd)?;
        }
        if config.db != 0 {
            let cmd = Command::new("SELECT").arg(config.db.to_string());
            self.handshake_step(HandshakeStep::Select, &cmd)?;
        }
        if let Some(name) = &config.client_name {
            let cmd = Command::new("CLIENT").arg("SETNAME").arg(name);
            self.handshake_step(HandshakeStep::SetName, &cmd)?;
        }
        Ok(())
    }

    fn handshake_step(&mut self, step: HandshakeStep, cmd: &Command) -> ClientResult<()> {
        debug!(%step, "handshake");
        self.send(std::slice::from_ref(cmd))
            .map_err(|failure| failure.error)
            .and_then(|_| self.read_reply())
            .and_then(check_reply)
            .map(|_| ())
            .map_err(|err| ClientError::Handshake {
                step,
                source: Box::new(err),
            })
    }

    /// Encodes and writes `commands` back-to-back.
    ///
    /// On failure the connection is `Disconnected` and the returned
    /// `WriteFailure` says how much of the batch reached the socket.
    pub(crate) fn send(&mut self, commands: &[Command]) -> Result<(), WriteFailure> {
        self.write_buf.clear();
        let mut ends = Vec::with_capacity(commands.len());
        for cmd in commands {
            encode_command(cmd, &mut self.write_buf);
            ends.push(self.write_buf.len());
        }

        let mut written = 0;
        let result = self.write_tracked(&mut written);
        trace!(bytes = written, commands = commands.len(), "wrote frames");
        result.map_err(|error| WriteFailure {
            flushed: ends.iter().take_while(|&&end| end <= written).count(),
            bytes: written,
            error,
        })
    }

    fn write_tracked(&mut self, written: &mut usize) -> ClientResult<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(not_connected(self.state, "write"));
        };

        let data = &self.write_buf[..];
        let mut outcome = Ok(());
        while *written < data.len() {
            match stream.write(&data[*written..]) {
                Ok(0) => {
                    outcome = Err(ClientError::from_io(
                        IoOp::Write,
                        io::Error::from(io::ErrorKind::WriteZero),
                    ));
                    break;
                }
                Ok(n) => *written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    outcome = Err(ClientError::from_io(IoOp::Write, e));
                    break;
                }
            }
        }
        if outcome.is_ok() {
            outcome = stream
                .flush()
                .map_err(|e| ClientError::from_io(IoOp::Write, e));
        }

        if outcome.is_err() {
            self.mark_broken();
        }
        outcome
    }

    /// Reads exactly one reply, pulling more bytes from the socket as needed.
    pub(crate) fn read_reply(&mut self) -> ClientResult<Reply> {
        loop {
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(reply)) => return Ok(reply),
                Ok(None) => {}
                Err(err) => {
                    self.mark_broken();
                    return Err(err.into());
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(not_connected(self.state, "read"));
            };
            match stream.read(&mut self.scratch) {
                Ok(0) => {
                    self.mark_broken();
                    return Err(ClientError::eof());
                }
                Ok(n) => {
                    trace!(bytes = n, "read");
                    self.read_buf.extend_from_slice(&self.scratch[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.mark_broken();
                    return Err(ClientError::from_io(IoOp::Read, e));
                }
            }
        }
    }

    /// Closes the socket. Safe to call repeatedly and on broken connections.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            debug!(addr = %self.config.addr(), state = %self.state, "closing connection");
        }
        self.shutdown_stream();
        self.state = ConnectionState::Closed;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Changes the socket read timeout; `None` blocks until data or close.
    pub(crate) fn set_read_timeout(&mut self, timeout: Option<Duration>) -> ClientResult<()> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(not_connected(self.state, "set read timeout"));
        };
        let result = stream.tcp().set_read_timeout(timeout);
        result.map_err(|e| {
            self.mark_broken();
            ClientError::from_io(IoOp::Read, e)
        })
    }

    /// Restores the configured read timeout.
    pub(crate) fn restore_read_timeout(&mut self) -> ClientResult<()> {
        self.set_read_timeout(self.config.read_timeout)
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "connection state");
            self.state = state;
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn shared_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    /// Handle for closing this socket from another thread.
    pub fn close_handle(&self) -> Option<CloseHandle> {
        self.closer.clone()
    }

    pub(crate) fn mark_broken(&mut self) {
        self.shutdown_stream();
        self.set_state(ConnectionState::Disconnected);
    }

    fn shutdown_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Stream::Tls(tls) = &mut stream {
                let tls = &mut **tls;
                tls.conn.send_close_notify();
                let _ = tls.conn.complete_io(&mut tls.sock);
            }
            let _ = stream.tcp().shutdown(Shutdown::Both);
        }
        self.closer = None;
        self.decoder.reset();
        self.read_buf.clear();
        self.write_buf.clear();
    }
}

fn not_connected(state: ConnectionState, operation: &'static str) -> ClientError {
    ClientError::State { state, operation }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Close handles hold a duplicate descriptor, so dropping the stream
        // alone would leave the socket open.
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.config.addr())
            .field("state", &self.state)
            .finish()
    }
}

fn open_socket(config: &ClientConfig) -> ClientResult<TcpStream> {
    let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| ClientError::from_io(IoOp::Connect, e))?
        .collect();

    let mut last_err = ClientError::Connection {
        op: IoOp::Connect,
        source: io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses"),
    };
    for addr in addrs {
        let attempt = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                configure_socket(&stream, config)
                    .map_err(|e| ClientError::from_io(IoOp::Connect, e))?;
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "connect attempt failed");
                last_err = ClientError::from_io(IoOp::Connect, e);
            }
        }
    }
    Err(last_err)
}

fn configure_socket(stream: &TcpStream, config: &ClientConfig) -> io::Result<()> {
    stream.set_read_timeout(config.read_timeout)?;
    stream.set_write_timeout(config.write_timeout)?;
    // Disable Nagle to keep request latency low for small payloads.
    stream.set_nodelay(true)
}
