//! User-facing HTTPS entry point
//!
//! Requests are read straight off the TLS socket, routed to a cluster by a
//! [`ClusterNameParser`], and handed to that cluster's tunnel as a new
//! logical connection. After the request is sent the socket is hijacked and
//! bytes flow raw in both directions, which keeps upgrade-based protocols
//! (SPDY exec/port-forward, websockets) working end to end.

pub mod bridge;
pub mod hijack;
pub mod parser;
pub mod request;
pub mod server;

pub use bridge::{BridgeConfig, BridgeError, BridgeHandler};
pub use hijack::{ClientIo, HijackError, Hijacked, RawConnection, ResponseWriter};
pub use parser::{ClusterNameParser, PathPrefixParser, TargetParseError};
pub use request::{InboundRequest, RequestError};
pub use server::{serve_connection, HttpsServer, HttpsServerConfig, HttpsServerError};
