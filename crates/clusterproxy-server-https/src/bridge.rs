//! The HTTP -> tunnel bridge
//!
//! One inbound request moves through
//! `ParseTarget -> AwaitTunnel -> Establish -> Hijack -> Forward -> Closed`.
//! Each early exit answers with its own status; the logical connection is
//! released on every path.

use bytes::Bytes;
use clusterproxy_control::{LogicalConnection, TunnelError, TunnelManager};
use clusterproxy_proto::{Packet, EOF_MESSAGE};
use http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::hijack::{plain_response, HijackError, ResponseWriter};
use crate::parser::ClusterNameParser;
use crate::request::{InboundRequest, RequestError};

pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Bad request: {0}")]
    BadRequest(#[from] RequestError),

    #[error("Failed to parse cluster name from request: {0}")]
    ParseTarget(String),

    #[error("Cluster {0} not available")]
    NoTunnel(String),

    #[error("Cluster {cluster} not available: {reason}")]
    Establish { cluster: String, reason: String },

    #[error("Failed to send request to agent: {0}")]
    Handshake(TunnelError),

    #[error("{0}")]
    Hijack(#[from] HijackError),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Client connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Forwarding task failed: {0}")]
    TaskFailed(String),

    #[error("Forwarding cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Status answered for errors raised before the socket is hijacked
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            BridgeError::BadRequest(_) | BridgeError::ParseTarget(_) => {
                Some(StatusCode::BAD_REQUEST)
            }
            BridgeError::NoTunnel(_) | BridgeError::Establish { .. } => {
                Some(StatusCode::SERVICE_UNAVAILABLE)
            }
            BridgeError::Handshake(_) | BridgeError::Agent(_) => Some(StatusCode::BAD_GATEWAY),
            BridgeError::Hijack(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bound on receiving the request head from the client
    pub request_timeout: Duration,
    /// Bound on allocating the logical connection and sending the handshake
    pub setup_timeout: Duration,
    /// Read size for client -> agent forwarding
    pub buffer_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Closes the logical connection however the request ends; the agent is
/// told to release its side as well
struct ConnectionGuard(Arc<LogicalConnection>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.close(None);
    }
}

pub struct BridgeHandler {
    manager: TunnelManager,
    parser: Arc<dyn ClusterNameParser>,
    config: BridgeConfig,
}

impl std::fmt::Debug for BridgeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandler")
            .field("config", &self.config)
            .finish()
    }
}

impl BridgeHandler {
    pub fn new(manager: TunnelManager, parser: Arc<dyn ClusterNameParser>) -> Self {
        Self {
            manager,
            parser,
            config: BridgeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Carry `request` to its cluster and pump bytes until either side stops.
    ///
    /// Errors before the hijack have already been answered on `writer` when
    /// this returns.
    pub async fn handle(
        &self,
        request: &InboundRequest,
        writer: &mut dyn ResponseWriter,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        match self.bridge(request, writer, cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(status) = e.status() {
                    if !matches!(e, BridgeError::Agent(_)) {
                        if let Err(write_err) = writer.write_response(status, &e.to_string()).await
                        {
                            debug!("Failed to write {} response: {}", status, write_err);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn bridge(
        &self,
        request: &InboundRequest,
        writer: &mut dyn ResponseWriter,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        // ParseTarget
        let cluster = self
            .parser
            .parse_cluster_name(request)
            .map_err(|e| BridgeError::ParseTarget(format!("{}, path:{}", e, request.path())))?;

        debug!(cluster = %cluster, method = %request.method, path = %request.path(), "Routing request");

        // AwaitTunnel
        let tunnel = self
            .manager
            .get_tunnel(&cluster)
            .await
            .map_err(|_| BridgeError::NoTunnel(cluster.clone()))?;

        // Establish
        let conn = tunnel
            .new_logical_connection()
            .map_err(|e| BridgeError::Establish {
                cluster: cluster.clone(),
                reason: e.to_string(),
            })?;
        let guard = ConnectionGuard(conn);
        let conn = &guard.0;

        let handshake = async {
            // Empty packet: the agent prepares its side of the connection
            conn.send(Packet::data(conn.id(), Vec::new())).await?;
            conn.send(Packet::data(conn.id(), request.serialize())).await
        };
        match tokio::time::timeout(self.config.setup_timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BridgeError::Handshake(e)),
            Err(_) => {
                return Err(BridgeError::Establish {
                    cluster,
                    reason: format!(
                        "connection setup timed out after {:?}",
                        self.config.setup_timeout
                    ),
                })
            }
        }

        // Hijack
        let hijacked = writer.hijack()?;

        info!(cluster = %cluster, conn_id = conn.id(), "Established HTTP tunnel");

        // Forward
        let result = forward(
            hijacked.io,
            hijacked.buffered,
            conn.clone(),
            self.config.buffer_size,
            cancel,
        )
        .await;

        match &result {
            Ok(()) => debug!(conn_id = conn.id(), "HTTP tunnel closed"),
            Err(e) => debug!(conn_id = conn.id(), "HTTP tunnel ended: {}", e),
        }
        result
    }
}

/// Pump bytes both ways until the first direction finishes
pub async fn forward<IO>(
    io: IO,
    early: Bytes,
    conn: Arc<LogicalConnection>,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<(), BridgeError>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    if !early.is_empty() {
        conn.send_data(early.to_vec()).await?;
    }

    let (client_read, client_write) = tokio::io::split(io);
    let mut tasks = JoinSet::new();
    tasks.spawn(client_to_agent(client_read, conn.clone(), buffer_size));
    tasks.spawn(agent_to_client(conn, client_write));

    let result = tokio::select! {
        joined = tasks.join_next() => match joined {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(BridgeError::TaskFailed(e.to_string())),
            None => Ok(()),
        },
        _ = cancel.cancelled() => Err(BridgeError::Cancelled),
    };

    // Both socket halves must drop before the client sees the close
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}

    result
}

async fn client_to_agent<R>(
    mut client: R,
    conn: Arc<LogicalConnection>,
    buffer_size: usize,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];
    loop {
        let n = client.read(&mut buffer).await?;
        if n == 0 {
            debug!(conn_id = conn.id(), "Client connection closed");
            return Ok(());
        }
        conn.send_data(&buffer[..n]).await?;
        trace!(conn_id = conn.id(), bytes = n, "Forwarded data to agent");
    }
}

async fn agent_to_client<W>(conn: Arc<LogicalConnection>, mut client: W) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = false;

    let result = loop {
        let Some(packet) = conn.recv().await else {
            debug!(conn_id = conn.id(), "Logical connection closed");
            break Ok(());
        };

        if packet.is_error() {
            if written && packet.error_message == EOF_MESSAGE {
                break Ok(());
            }
            warn!(conn_id = conn.id(), "Received error from agent: {}", packet.error_message);
            if !written {
                let response = plain_response(StatusCode::BAD_GATEWAY, &packet.error_message);
                if let Err(e) = client.write_all(&response).await {
                    debug!(conn_id = conn.id(), "Failed to write error response: {}", e);
                }
            }
            break Err(BridgeError::Agent(packet.error_message));
        }

        if packet.data.is_empty() {
            continue;
        }
        client.write_all(&packet.data).await?;
        client.flush().await?;
        written = true;
        trace!(conn_id = conn.id(), bytes = packet.data.len(), "Forwarded data to client");
    };

    if let Err(e) = client.shutdown().await {
        debug!(conn_id = conn.id(), "Failed to shut down client connection: {}", e);
    }
    result
}
