//! Hub-side tunnel multiplexer
//!
//! Agents dial in and hold one packet stream each ([`TunnelServer`]). Every
//! stream becomes a [`Tunnel`] registered under the agent's cluster name in
//! the [`TunnelManager`]. Callers open [`LogicalConnection`]s on a tunnel;
//! a single reader task per tunnel routes inbound packets to them by id.
pub mod connection;
pub mod error;
pub mod handler;
pub mod manager;
pub mod tunnel;

pub use connection::LogicalConnection;
pub use error::TunnelError;
pub use handler::{cluster_name_from_metadata, TunnelServer};
pub use manager::TunnelManager;
pub use tunnel::{Tunnel, TunnelId, TunnelInfo, CONNECTION_CLOSED_MESSAGE, DEFAULT_QUEUE_DEPTH};
