//! clusterproxy - reach managed clusters through agent-initiated tunnels
//!
//! `clusterproxy hub` accepts agent tunnels and bridges user HTTPS requests
//! into them; `clusterproxy agent` runs inside a managed cluster and dials
//! the hub.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clusterproxy_agent::{Agent, AgentConfig};
use clusterproxy_control::{TunnelManager, TunnelServer};
use clusterproxy_server_https::{
    BridgeConfig, BridgeHandler, HttpsServer, HttpsServerConfig, PathPrefixParser,
};
use clusterproxy_transport_h2::{H2Config, H2Listener};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// clusterproxy - HTTPS access to managed clusters over reverse tunnels
#[derive(Parser, Debug)]
#[command(name = "clusterproxy")]
#[command(version = VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the hub: the agent tunnel endpoint plus the user-facing HTTPS server
    #[command(long_about = r#"
Run the hub. Agents connect to the RPC address and register a tunnel under
their cluster name; users send HTTPS requests to /<cluster>/... on the HTTPS
address and are bridged into that cluster's tunnel.

EXAMPLES:
  clusterproxy hub --cert hub.crt --key hub.key

ENVIRONMENT VARIABLES:
  CLUSTERPROXY_RPC_ADDR       Agent tunnel listener (default 0.0.0.0:8091)
  CLUSTERPROXY_HTTPS_ADDR     User HTTPS listener (default 0.0.0.0:9092)
  CLUSTERPROXY_CERT           TLS certificate (PEM)
  CLUSTERPROXY_KEY            TLS private key (PEM)
  CLUSTERPROXY_SETUP_TIMEOUT  Connection setup timeout in seconds
    "#)]
    Hub {
        /// Address agents connect to
        #[arg(long, env = "CLUSTERPROXY_RPC_ADDR", default_value = "0.0.0.0:8091")]
        rpc_addr: SocketAddr,

        /// Address users connect to
        #[arg(long, env = "CLUSTERPROXY_HTTPS_ADDR", default_value = "0.0.0.0:9092")]
        https_addr: SocketAddr,

        /// TLS certificate (PEM), served on both listeners
        #[arg(long, env = "CLUSTERPROXY_CERT")]
        cert: PathBuf,

        /// TLS private key (PEM)
        #[arg(long, env = "CLUSTERPROXY_KEY")]
        key: PathBuf,

        /// Seconds allowed for opening a logical connection and sending the request
        #[arg(long, env = "CLUSTERPROXY_SETUP_TIMEOUT", default_value = "30")]
        setup_timeout: u64,
    },

    /// Run an agent inside a managed cluster
    #[command(long_about = r#"
Connect to the hub, register a tunnel for this cluster, and forward every
logical connection to the target address. Reconnects with exponential
backoff if the tunnel drops.

EXAMPLES:
  clusterproxy agent --hub hub.example.com:8091 \
    --cluster-name edge-1 \
    --target-address 127.0.0.1:6443

ENVIRONMENT VARIABLES:
  CLUSTERPROXY_HUB             Hub RPC address
  CLUSTERPROXY_SERVER_NAME     TLS server name of the hub
  CLUSTERPROXY_CA_CERT         CA bundle for the hub certificate
  CLUSTERPROXY_INSECURE        Skip certificate verification
  CLUSTERPROXY_CLUSTER_NAME    Cluster name to register
  CLUSTERPROXY_TARGET_ADDRESS  Address logical connections are dialed to
    "#)]
    Agent {
        /// Hub RPC address (e.g., hub.example.com:8091)
        #[arg(long, env = "CLUSTERPROXY_HUB")]
        hub: String,

        /// TLS server name of the hub (defaults to the host of --hub)
        #[arg(long, env = "CLUSTERPROXY_SERVER_NAME")]
        server_name: Option<String>,

        /// CA bundle for the hub certificate (system roots if unset)
        #[arg(long, env = "CLUSTERPROXY_CA_CERT")]
        ca_cert: Option<PathBuf>,

        /// Skip certificate verification (insecure, for development only)
        #[arg(long, env = "CLUSTERPROXY_INSECURE")]
        insecure: bool,

        /// Cluster name announced to the hub
        #[arg(long, env = "CLUSTERPROXY_CLUSTER_NAME")]
        cluster_name: String,

        /// Address to forward connections to (e.g., 127.0.0.1:6443)
        #[arg(long, env = "CLUSTERPROXY_TARGET_ADDRESS")]
        target_address: String,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },
}

/// Setup logging; `RUST_LOG` wins over the default level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `shutdown` on Ctrl+C
fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        shutdown.cancel();
    });
}

async fn run_hub(
    rpc_addr: SocketAddr,
    https_addr: SocketAddr,
    cert: PathBuf,
    key: PathBuf,
    setup_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let manager = TunnelManager::new();

    let h2_config = Arc::new(H2Config::server(cert.clone(), key.clone()));
    let listener = H2Listener::bind(rpc_addr, h2_config)
        .await
        .context("Failed to start tunnel RPC listener")?;
    let tunnel_server = TunnelServer::new(manager.clone());

    let bridge = BridgeHandler::new(manager, Arc::new(PathPrefixParser)).with_config(BridgeConfig {
        setup_timeout,
        ..Default::default()
    });
    let https_config = HttpsServerConfig::new(cert, key).with_bind_addr(https_addr);
    let https_server = HttpsServer::bind(&https_config, bridge)
        .await
        .context("Failed to start HTTPS server")?;

    info!("Hub ready (agents: {}, users: {})", rpc_addr, https_addr);

    let rpc_shutdown = shutdown.clone();
    let (_, https_result) = tokio::join!(
        async move { tunnel_server.run(listener, rpc_shutdown).await },
        https_server.run(shutdown),
    );
    https_result.context("HTTPS server failed")?;

    info!("Hub stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    match cli.command {
        Commands::Hub {
            rpc_addr,
            https_addr,
            cert,
            key,
            setup_timeout,
        } => {
            run_hub(
                rpc_addr,
                https_addr,
                cert,
                key,
                Duration::from_secs(setup_timeout),
                shutdown,
            )
            .await
        }
        Commands::Agent {
            hub,
            server_name,
            ca_cert,
            insecure,
            cluster_name,
            target_address,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            let mut config = AgentConfig::new(hub, cluster_name, target_address);
            config.server_name = server_name;
            config.ca_cert_path = ca_cert;
            config.insecure = insecure;
            config.initial_backoff = Duration::from_secs(reconnect_delay);
            config.max_backoff = Duration::from_secs(max_reconnect_delay);

            info!("Cluster: {}", config.cluster_name);
            info!("Hub: {}", config.hub_addr);
            info!("Target address: {}", config.target_address);
            if insecure {
                warn!("Certificate verification disabled (insecure mode)");
            }

            let agent = Agent::new(config).context("Failed to create agent")?;
            agent.run(shutdown).await.context("Agent failed")?;
            Ok(())
        }
    }
}
