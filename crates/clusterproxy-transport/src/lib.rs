//! Transport abstraction for the physical tunnel stream
//!
//! A tunnel rides on exactly one ordered, bidirectional stream of packets
//! between the hub and one agent instance. This crate splits that stream into
//! its two halves so that the hub can have a single reader task draining
//! [`PacketSource`] while writers share a serialized [`PacketSink`].
//!
//! ```text
//!            hub                                   agent
//! ┌──────────────────────┐                ┌──────────────────────┐
//! │ PacketSink   ────────┼── Packet ... ──▶│ PacketSource         │
//! │ PacketSource ◀───────┼── Packet ... ───┼ PacketSink           │
//! └──────────────────────┘                └──────────────────────┘
//! ```
//!
//! Implementations live in `clusterproxy-transport-h2` (HTTP/2 RPC stream) and
//! in [`memory`] (in-process channels).

pub mod memory;
pub mod tls;

use async_trait::async_trait;
use clusterproxy_proto::{CodecError, Packet};
use std::fmt::Debug;
use thiserror::Error;

pub use memory::{memory_pair, MemorySink, MemorySource, MemoryStream};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Stream closed")]
    Closed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        TransportError::ProtocolError(err.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Write half of a physical tunnel stream
#[async_trait]
pub trait PacketSink: Send + Debug {
    /// Write one packet; returns once the transport has accepted it
    async fn send_packet(&mut self, packet: Packet) -> TransportResult<()>;

    /// Close the sending side
    async fn finish(&mut self) -> TransportResult<()>;
}

/// Read half of a physical tunnel stream
#[async_trait]
pub trait PacketSource: Send + Debug {
    /// Receive the next packet
    ///
    /// Returns `None` when the peer closed the stream cleanly.
    async fn recv_packet(&mut self) -> TransportResult<Option<Packet>>;
}

pub type BoxPacketSink = Box<dyn PacketSink>;
pub type BoxPacketSource = Box<dyn PacketSource>;
