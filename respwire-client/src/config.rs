//! # Client Configuration
//!
//! Purpose: Describe where and how to connect, and load that description from
//! a TOML document when the caller does not build it in code.
//!
//! TOML layout (every section and key is optional):
//!
//! ```text
//! [connection]
//! host = "127.0.0.1"
//! port = 6379
//! db = 0
//! username = "app"
//! password = "secret"
//! client_name = "worker-1"
//!
//! [timeouts]          # milliseconds, 0 disables
//! connect_ms = 5000
//! read_ms = 5000
//! write_ms = 5000
//!
//! [tls]
//! enabled = false
//! server_name = "cache.internal"
//!
//! [reconnect]
//! attempts = 1
//! delay_ms = 0
//!
//! [pool]
//! max_idle = 8
//! max_total = 16
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ClientError, ClientResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for connections, reconnects, and the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server host name or IP address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Database index selected during the handshake (0 skips SELECT).
    pub db: u32,
    /// ACL user name; sent only together with `password`.
    pub username: Option<String>,
    /// Credential sent with AUTH during the handshake.
    pub password: Option<String>,
    /// Name registered with CLIENT SETNAME during the handshake.
    pub client_name: Option<String>,
    /// TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Per-read socket timeout.
    pub read_timeout: Option<Duration>,
    /// Per-write socket timeout.
    pub write_timeout: Option<Duration>,
    /// Wrap the socket in TLS.
    pub tls: bool,
    /// SNI / certificate name; defaults to `host`.
    pub tls_server_name: Option<String>,
    /// Transparent reconnect-and-retry attempts (0 or 1).
    pub reconnect_attempts: u8,
    /// Pause before reconnecting.
    pub reconnect_delay: Duration,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum total pooled connections (idle + in-use).
    pub max_total: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            username: None,
            password: None,
            client_name: None,
            connect_timeout: Some(DEFAULT_TIMEOUT),
            read_timeout: Some(DEFAULT_TIMEOUT),
            write_timeout: Some(DEFAULT_TIMEOUT),
            tls: false,
            tls_server_name: None,
            reconnect_attempts: 1,
            reconnect_delay: Duration::ZERO,
            max_idle: 8,
            max_total: 16,
        }
    }
}

impl ClientConfig {
    /// Default configuration pointed at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientConfig {
            host: host.into(),
            port,
            ..ClientConfig::default()
        }
    }

    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> ClientResult<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| ClientError::InvalidConfig(e.to_string()))?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ClientError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// `host:port` as used for resolution and logging.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Rejects settings no connection could honor.
    pub fn validate(&self) -> ClientResult<()> {
        if self.host.is_empty() {
            return Err(ClientError::InvalidConfig("host must not be empty".into()));
        }
        if self.reconnect_attempts > 1 {
            return Err(ClientError::InvalidConfig(format!(
                "reconnect_attempts must be 0 or 1, got {}",
                self.reconnect_attempts
            )));
        }
        if self.max_total == 0 {
            return Err(ClientError::InvalidConfig("max_total must be at least 1".into()));
        }
        if self.max_idle > self.max_total {
            return Err(ClientError::InvalidConfig(format!(
                "max_idle ({}) exceeds max_total ({})",
                self.max_idle, self.max_total
            )));
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(ClientError::InvalidConfig("username requires a password".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    connection: ConnectionSection,
    #[serde(default)]
    timeouts: TimeoutSection,
    #[serde(default)]
    tls: TlsSection,
    #[serde(default)]
    reconnect: ReconnectSection,
    #[serde(default)]
    pool: PoolSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConnectionSection {
    host: Option<String>,
    port: Option<u16>,
    db: Option<u32>,
    username: Option<String>,
    password: Option<String>,
    client_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TimeoutSection {
    connect_ms: Option<u64>,
    read_ms: Option<u64>,
    write_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TlsSection {
    #[serde(default)]
    enabled: bool,
    server_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ReconnectSection {
    attempts: Option<u8>,
    delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PoolSection {
    max_idle: Option<usize>,
    max_total: Option<usize>,
}

impl ConfigFile {
    fn into_config(self) -> ClientConfig {
        let defaults = ClientConfig::default();
        ClientConfig {
            host: self.connection.host.unwrap_or(defaults.host),
            port: self.connection.port.unwrap_or(defaults.port),
            db: self.connection.db.unwrap_or(defaults.db),
            username: self.connection.username,
            password: self.connection.password,
            client_name: self.connection.client_name,
            connect_timeout: timeout_or(self.timeouts.connect_ms, defaults.connect_timeout),
            read_timeout: timeout_or(self.timeouts.read_ms, defaults.read_timeout),
            write_timeout: timeout_or(self.timeouts.write_ms, defaults.write_timeout),
            tls: self.tls.enabled,
            tls_server_name: self.tls.server_name,
            reconnect_attempts: self.reconnect.attempts.unwrap_or(defaults.reconnect_attempts),
            reconnect_delay: self
                .reconnect
                .delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_delay),
            max_idle: self.pool.max_idle.unwrap_or(defaults.max_idle),
            max_total: self.pool.max_total.unwrap_or(defaults.max_total),
        }
    }
}

// 0 ms means "no timeout" rather than an immediately expiring one.
fn timeout_or(ms: Option<u64>, default: Option<Duration>) -> Option<Duration> {
    match ms {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => default,
    }
}
