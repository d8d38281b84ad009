use clusterproxy_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// Missing or malformed call metadata; the call is rejected untouched
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No tunnel registered for cluster {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Tunnel closed")]
    Closed,

    #[error("Tunnel is already being served")]
    AlreadyServing,
}
