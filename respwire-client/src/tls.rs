//! TLS wrapping for client sockets (rustls with the webpki trust store).

use std::net::TcpStream;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, RootCertStore, StreamOwned};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult, IoOp};

pub(crate) type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Wraps `tcp` in a TLS session and completes the handshake eagerly.
///
/// The socket timeouts are already set, so a stalled handshake fails with a
/// timeout instead of blocking.
pub(crate) fn connect(tcp: TcpStream, config: &ClientConfig) -> ClientResult<TlsStream> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = config
        .tls_server_name
        .clone()
        .unwrap_or_else(|| config.host.clone());
    let server_name = ServerName::try_from(name)
        .map_err(|e| ClientError::InvalidConfig(format!("invalid TLS server name: {}", e)))?;

    let session = ClientConnection::new(Arc::new(tls_config), server_name)?;
    let mut stream = StreamOwned::new(session, tcp);
    while stream.conn.is_handshaking() {
        stream
            .conn
            .complete_io(&mut stream.sock)
            .map_err(|e| ClientError::from_io(IoOp::Connect, e))?;
    }
    Ok(stream)
}
