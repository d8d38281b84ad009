//! HTTPS listener for external callers
use clusterproxy_transport::tls::{crypto_provider, load_certs, load_private_key};
use http::StatusCode;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeError, BridgeHandler};
use crate::hijack::{ClientIo, RawConnection, ResponseWriter};
use crate::request::RequestError;

/// Default port of the user-facing listener
pub const DEFAULT_HTTPS_PORT: u16 = 9092;

#[derive(Debug, Error)]
pub enum HttpsServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct HttpsServerConfig {
    pub bind_addr: SocketAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl HttpsServerConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTPS_PORT)),
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    /// TLS 1.3 only, and HTTP/1.1 as the only ALPN protocol: an h2
    /// connection cannot be upgraded to SPDY for exec/port-forward.
    pub fn build_tls_config(&self) -> Result<ServerConfig, HttpsServerError> {
        info!("Loading TLS certificate from: {}", self.cert_path.display());
        let certs = load_certs(&self.cert_path)
            .map_err(|e| HttpsServerError::TlsError(e.to_string()))?;
        info!("Loading TLS private key from: {}", self.key_path.display());
        let key = load_private_key(&self.key_path)
            .map_err(|e| HttpsServerError::TlsError(e.to_string()))?;

        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| HttpsServerError::TlsError(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| HttpsServerError::TlsError(format!("Invalid cert/key: {}", e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }
}

/// Read one request off `io` and bridge it.
///
/// The request head must arrive within the bridge's `request_timeout`;
/// a slow client is dropped without an answer.
pub async fn serve_connection<IO: ClientIo>(
    bridge: &BridgeHandler,
    io: IO,
    cancel: &CancellationToken,
) -> Result<(), BridgeError> {
    let mut conn = RawConnection::new(io);
    let request_timeout = bridge.config().request_timeout;

    let read = tokio::select! {
        read = tokio::time::timeout(request_timeout, conn.read_request()) => read,
        _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
    };

    let request = match read {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => {
            let err = BridgeError::BadRequest(e);
            if let Err(write_err) = conn
                .write_response(StatusCode::BAD_REQUEST, &err.to_string())
                .await
            {
                debug!("Failed to write 400 response: {}", write_err);
            }
            return Err(err);
        }
        Err(_) => {
            debug!(?request_timeout, "Client sent no request head in time");
            return Err(BridgeError::BadRequest(RequestError::Timeout(request_timeout)));
        }
    };

    bridge.handle(&request, &mut conn, cancel).await
}

pub struct HttpsServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    bridge: Arc<BridgeHandler>,
}

impl HttpsServer {
    pub async fn bind(
        config: &HttpsServerConfig,
        bridge: BridgeHandler,
    ) -> Result<Self, HttpsServerError> {
        let acceptor = TlsAcceptor::from(Arc::new(config.build_tls_config()?));

        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            HttpsServerError::BindError {
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            listener,
            acceptor,
            bridge: Arc::new(bridge),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HttpsServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires; in-flight bridges are
    /// cancelled with it.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), HttpsServerError> {
        info!("HTTPS server listening on {}", self.local_addr()?);

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };

            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept HTTPS connection: {}", e);
                    continue;
                }
            };

            let acceptor = self.acceptor.clone();
            let bridge = self.bridge.clone();
            let cancel = shutdown.child_token();

            tokio::spawn(async move {
                debug!("New HTTPS connection from {}", peer_addr);

                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("TLS handshake failed from {}: {}", peer_addr, e);
                        return;
                    }
                };

                if let Err(e) = serve_connection(&bridge, tls_stream, &cancel).await {
                    debug!("HTTPS connection from {} ended: {}", peer_addr, e);
                }
            });
        }

        info!("HTTPS server shutting down");
        Ok(())
    }
}
