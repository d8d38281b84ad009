//! Agent-facing `Tunnel` RPC endpoint

use clusterproxy_proto::{CLUSTER_NAME_METADATA, TUNNEL_RPC_PATH};
use clusterproxy_transport::{BoxPacketSink, BoxPacketSource};
use clusterproxy_transport_h2::{H2Listener, H2ServerConnection, TunnelCall};
use http::{HeaderMap, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::TunnelManager;
use crate::tunnel::Tunnel;
use crate::TunnelError;

/// Read the agent's cluster name from call metadata
pub fn cluster_name_from_metadata(metadata: &HeaderMap) -> Result<String, TunnelError> {
    let value = metadata.get(CLUSTER_NAME_METADATA).ok_or_else(|| {
        TunnelError::Protocol(format!("missing {} metadata", CLUSTER_NAME_METADATA))
    })?;

    let name = value
        .to_str()
        .map_err(|_| {
            TunnelError::Protocol(format!("{} metadata is not valid text", CLUSTER_NAME_METADATA))
        })?
        .trim();

    if name.is_empty() {
        return Err(TunnelError::Protocol(format!(
            "empty {} metadata",
            CLUSTER_NAME_METADATA
        )));
    }

    Ok(name.to_string())
}

/// Accepts agent tunnel calls and keeps the [`TunnelManager`] in sync with them
#[derive(Debug, Clone)]
pub struct TunnelServer {
    manager: TunnelManager,
}

impl TunnelServer {
    pub fn new(manager: TunnelManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &TunnelManager {
        &self.manager
    }

    pub async fn get_tunnel(&self, cluster_name: &str) -> Result<Tunnel, TunnelError> {
        self.manager.get_tunnel(cluster_name).await
    }

    /// The `Tunnel` RPC: validate metadata, register, serve until the
    /// stream ends, deregister. A call without `cluster-name` fails before
    /// anything is registered.
    pub async fn tunnel(
        &self,
        metadata: &HeaderMap,
        sink: BoxPacketSink,
        source: BoxPacketSource,
    ) -> Result<(), TunnelError> {
        let cluster_name = cluster_name_from_metadata(metadata)?;
        self.serve_tunnel(&cluster_name, sink, source).await
    }

    async fn serve_tunnel(
        &self,
        cluster_name: &str,
        sink: BoxPacketSink,
        source: BoxPacketSource,
    ) -> Result<(), TunnelError> {
        let tunnel = self.manager.new_tunnel(cluster_name, sink, source).await;
        let result = tunnel.serve().await;

        // serve() deregisters on its own; this covers a tunnel it never got to run
        self.manager.remove_tunnel(cluster_name, tunnel.id()).await;

        match &result {
            Ok(()) => info!(cluster = %cluster_name, tunnel_id = %tunnel.id(), "Agent disconnected"),
            Err(e) => warn!(
                cluster = %cluster_name,
                tunnel_id = %tunnel.id(),
                "Agent tunnel failed: {}",
                e
            ),
        }
        result
    }

    /// Route one HTTP/2 call: unknown methods are 404, bad metadata 400
    pub async fn handle_call(&self, call: TunnelCall) -> Result<(), TunnelError> {
        if call.method() != Method::POST || call.path() != TUNNEL_RPC_PATH {
            debug!("Rejecting call to {} {}", call.method(), call.path());
            let message = format!("unknown method {}", call.path());
            call.reject(StatusCode::NOT_FOUND, &message)?;
            return Ok(());
        }

        let cluster_name = match cluster_name_from_metadata(call.metadata()) {
            Ok(name) => name,
            Err(e) => {
                warn!(remote = %call.remote_addr(), "Rejecting tunnel call: {}", e);
                call.reject(StatusCode::BAD_REQUEST, &e.to_string())?;
                return Err(e);
            }
        };

        info!(
            cluster = %cluster_name,
            remote = %call.remote_addr(),
            "Agent tunnel call accepted"
        );
        let (sink, source) = call.accept()?;
        self.serve_tunnel(&cluster_name, Box::new(sink), Box::new(source))
            .await
    }

    /// Serve every call on one agent connection
    pub async fn serve_connection(&self, connection: H2ServerConnection) {
        while let Some(call) = connection.accept_call().await {
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_call(call).await {
                    debug!("Tunnel call ended: {}", e);
                }
            });
        }
        debug!(
            "[{}] Agent connection from {} closed",
            connection.connection_id(),
            connection.remote_address()
        );
    }

    /// Accept agent connections until `shutdown` fires, then close every tunnel
    pub async fn run(&self, listener: H2Listener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("Tunnel RPC server listening on {}", addr);
        }

        loop {
            let incoming = tokio::select! {
                incoming = listener.accept() => incoming,
                _ = shutdown.cancelled() => break,
            };

            let incoming = match incoming {
                Ok(incoming) => incoming,
                Err(e) => {
                    error!("Failed to accept agent connection: {}", e);
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                let remote = incoming.remote_addr();
                match incoming.handshake().await {
                    Ok(connection) => server.serve_connection(connection).await,
                    Err(e) => warn!("Agent handshake from {} failed: {}", remote, e),
                }
            });
        }

        info!("Tunnel RPC server shutting down");
        self.manager.close_all().await;
    }
}
