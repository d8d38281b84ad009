//! Tunnel Protocol Definitions
//!
//! Wire types shared by the hub and the agents: the [`Packet`] exchanged over
//! one physical tunnel stream, its control codes, and the length-delimited
//! codec that frames packets on the stream.

pub mod codec;
pub mod packet;

pub use codec::{CodecError, PacketCodec};
pub use packet::{ConnectionId, ControlCode, Packet};

/// Maximum encoded packet size (16MB)
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Call metadata key carrying the agent's cluster name
pub const CLUSTER_NAME_METADATA: &str = "cluster-name";

/// Path of the bidirectional `Tunnel` RPC
pub const TUNNEL_RPC_PATH: &str = "/tunnel.v1.TunnelService/Tunnel";

/// Error message an agent sends when the target side of a connection closes
pub const EOF_MESSAGE: &str = "EOF";
