//! TLS listener (hub) and connector (agent) for the tunnel RPC

use clusterproxy_transport::{TransportError, TransportResult};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::config::H2Config;
use crate::connection::{H2ClientConnection, H2ServerConnection};

pub struct H2Listener {
    tcp_listener: TcpListener,
    tls_acceptor: tokio_rustls::TlsAcceptor,
    config: Arc<H2Config>,
}

impl std::fmt::Debug for H2Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Listener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .finish()
    }
}

impl H2Listener {
    pub async fn bind(bind_addr: SocketAddr, config: Arc<H2Config>) -> TransportResult<Self> {
        config.validate()?;

        let tls_acceptor = config.build_tls_acceptor()?;

        let tcp_listener =
            TcpListener::bind(bind_addr)
                .await
                .map_err(|e| TransportError::BindError {
                    address: bind_addr.ip().to_string(),
                    port: bind_addr.port(),
                    reason: e.to_string(),
                })?;

        let local_addr = tcp_listener.local_addr()?;
        info!("Tunnel RPC listener bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            tls_acceptor,
            config,
        })
    }

    /// Accept the next TCP connection. The TLS and HTTP/2 handshakes are
    /// left to [`H2Incoming::handshake`] so a slow peer cannot stall the
    /// accept loop.
    pub async fn accept(&self) -> TransportResult<H2Incoming> {
        let (tcp_stream, remote_addr) = self.tcp_listener.accept().await?;
        debug!("Incoming TCP connection from {}", remote_addr);

        Ok(H2Incoming {
            tcp_stream,
            remote_addr,
            tls_acceptor: self.tls_acceptor.clone(),
            config: self.config.clone(),
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.tcp_listener.local_addr()?)
    }
}

/// An accepted TCP connection that has not completed TLS yet
pub struct H2Incoming {
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
    tls_acceptor: tokio_rustls::TlsAcceptor,
    config: Arc<H2Config>,
}

impl H2Incoming {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub async fn handshake(self) -> TransportResult<H2ServerConnection> {
        let tls_stream = self
            .tls_acceptor
            .accept(self.tcp_stream)
            .await
            .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

        debug!("TLS handshake complete from {}", self.remote_addr);

        let conn = H2ServerConnection::new(tls_stream, self.remote_addr, &self.config).await?;
        info!("HTTP/2 connection established from {}", self.remote_addr);
        Ok(conn)
    }
}

pub struct H2Connector {
    tls_connector: tokio_rustls::TlsConnector,
    config: Arc<H2Config>,
}

impl std::fmt::Debug for H2Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connector").finish()
    }
}

impl H2Connector {
    pub fn new(config: Arc<H2Config>) -> TransportResult<Self> {
        config.validate()?;
        let tls_connector = config.build_tls_connector()?;

        Ok(Self {
            tls_connector,
            config,
        })
    }

    /// Connect to `addr` ("host:port") and verify the hub as `server_name`
    pub async fn connect(&self, addr: &str, server_name: &str) -> TransportResult<H2ClientConnection> {
        debug!("Connecting to hub: {} ({})", server_name, addr);

        let tcp_stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;
        let remote_addr = tcp_stream.peer_addr()?;

        let dns_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;

        let tls_stream = self
            .tls_connector
            .connect(dns_name, tcp_stream)
            .await
            .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

        let conn = H2ClientConnection::new(tls_stream, remote_addr, &self.config).await?;
        info!("HTTP/2 connection established to {} ({})", server_name, remote_addr);

        Ok(conn)
    }
}
