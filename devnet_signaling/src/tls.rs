//! TLS termination for `wss`
//!
//! [`TlsListener`] wraps the bound TCP listener so `axum::serve` sees
//! already-decrypted streams. A client that fails or stalls its handshake is
//! logged and dropped without reaching the router.

use crate::error::ConfigError;
use axum::serve::Listener;
use rustls::ServerConfig;
use rustls::pki_types::pem::{self, PemObject};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, warn};

/// Time a client gets to finish its TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build an acceptor from a PEM certificate chain and private key
pub fn load_acceptor(crt: &Path, key: &Path) -> Result<TlsAcceptor, ConfigError> {
    let pem_error = |path: &Path| {
        let path = path.display().to_string();
        move |source: pem::Error| ConfigError::Pem { path, source }
    };

    let certs = CertificateDer::pem_file_iter(crt)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .map_err(pem_error(crt))?;
    let key = PrivateKeyDer::from_pem_file(key).map_err(pem_error(key))?;

    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// A TCP listener that completes the TLS handshake before handing out a stream
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    pub fn new(listener: TcpListener, acceptor: TlsAcceptor) -> Self {
        Self { listener, acceptor }
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    // Usually out of file descriptors; back off like axum does.
                    warn!(error = %err, "accept failed");
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            match timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream)).await {
                Ok(Ok(stream)) => return (stream, addr),
                Ok(Err(err)) => debug!(%addr, error = %err, "tls handshake failed"),
                Err(_) => debug!(%addr, "tls handshake timed out"),
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.listener.local_addr()
    }
}
