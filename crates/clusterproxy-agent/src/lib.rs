//! Cluster-side agent
//!
//! The agent dials the hub, opens the `Tunnel` call announcing its cluster
//! name, and then serves every logical connection the hub opens by dialing a
//! target (usually the cluster's API server) over TCP and pumping bytes both
//! ways. When the tunnel drops it reconnects with exponential backoff.
//!
//! ```no_run
//! use clusterproxy_agent::{Agent, AgentConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), clusterproxy_agent::AgentError> {
//! let config = AgentConfig::new("hub.example.com:8091", "edge-1", "127.0.0.1:6443");
//! let agent = Agent::new(config)?;
//! agent.run(CancellationToken::new()).await
//! # }
//! ```

mod agent;
mod config;
mod forwarder;
mod session;

pub use agent::{Agent, AgentError, Backoff};
pub use config::AgentConfig;
pub use forwarder::{ForwarderError, TcpForwarder};
pub use session::AgentSession;
