//! HTTP/2 carriage for the agent tunnel RPC
//!
//! Each agent holds one long-lived HTTP/2 stream, opened as
//! `POST /tunnel.v1.TunnelService/Tunnel` with a `cluster-name` request
//! header. After a 200 response both bodies stay open and carry
//! length-prefixed packets until either side ends its half.
//!
//! - Hub: [`H2Listener`] -> [`H2Incoming::handshake`] -> [`H2ServerConnection::accept_call`]
//! - Agent: [`H2Connector::connect`] -> [`H2ClientConnection::open_tunnel`]

pub mod config;
pub mod connection;
pub mod listener;
pub mod stream;

pub use config::H2Config;
pub use connection::{H2ClientConnection, H2ServerConnection, TunnelCall, ERROR_MESSAGE_HEADER};
pub use listener::{H2Connector, H2Incoming, H2Listener};
pub use stream::{H2PacketSink, H2PacketSource};
