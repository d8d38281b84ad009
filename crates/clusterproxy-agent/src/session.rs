//! Agent side of one tunnel stream

use clusterproxy_proto::{ConnectionId, Packet};
use clusterproxy_transport::{BoxPacketSink, BoxPacketSource, TransportError};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentError;
use crate::forwarder::TcpForwarder;

const OUTBOUND_QUEUE_DEPTH: usize = 256;
const INBOUND_QUEUE_DEPTH: usize = 64;

/// Serves the logical connections the hub opens on one tunnel stream.
///
/// All writes to the stream go through a single writer task; each logical
/// connection gets its own forwarder task and inbound queue.
#[derive(Debug, Clone)]
pub struct AgentSession {
    target_address: String,
    forwarder: TcpForwarder,
    connections: Arc<DashMap<ConnectionId, mpsc::Sender<Vec<u8>>>>,
}

impl AgentSession {
    pub fn new(target_address: impl Into<String>, forwarder: TcpForwarder) -> Self {
        Self {
            target_address: target_address.into(),
            forwarder,
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Serve the stream until the hub ends it, it fails, or `shutdown` fires.
    ///
    /// Every forwarder is stopped before this returns.
    pub async fn run(
        &self,
        mut sink: BoxPacketSink,
        mut source: BoxPacketSource,
        shutdown: &CancellationToken,
    ) -> Result<(), AgentError> {
        let session = shutdown.child_token();
        let (outbound, mut outbound_rx) = mpsc::channel::<Packet>(OUTBOUND_QUEUE_DEPTH);

        let writer_token = session.clone();
        let writer = tokio::spawn(async move {
            let result = loop {
                tokio::select! {
                    _ = writer_token.cancelled() => break Ok(()),
                    packet = outbound_rx.recv() => match packet {
                        Some(packet) => {
                            if let Err(e) = sink.send_packet(packet).await {
                                break Err(e);
                            }
                        }
                        None => break Ok(()),
                    },
                }
            };
            let _ = sink.finish().await;
            // A dead writer ends the session
            writer_token.cancel();
            result
        });

        let read_result = loop {
            tokio::select! {
                biased;
                _ = session.cancelled() => break Ok(()),
                received = source.recv_packet() => match received {
                    Ok(Some(packet)) => self.dispatch(packet, &outbound, &session).await,
                    Ok(None) => {
                        info!("Hub closed the tunnel stream");
                        break Ok(());
                    }
                    Err(e) => break Err(e),
                },
            }
        };

        session.cancel();
        self.connections.clear();
        drop(outbound);

        let write_result = match writer.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::ConnectionError(format!(
                "Writer task failed: {}",
                e
            ))),
        };

        read_result.and(write_result).map_err(AgentError::from)
    }

    async fn dispatch(
        &self,
        packet: Packet,
        outbound: &mpsc::Sender<Packet>,
        session: &CancellationToken,
    ) {
        let conn_id = packet.conn_id;

        if packet.is_error() {
            // Dropping the queue stops the forwarder
            if self.connections.remove(&conn_id).is_some() {
                debug!(conn_id, "Hub closed connection: {}", packet.error_message);
            }
            return;
        }

        let existing = self.connections.get(&conn_id).map(|e| e.value().clone());
        let sender = match existing {
            Some(sender) => sender,
            // Connections open with an empty packet
            None if packet.data.is_empty() => {
                let address = packet
                    .target_address
                    .unwrap_or_else(|| self.target_address.clone());
                self.establish(conn_id, address, outbound, session);
                return;
            }
            None => {
                warn!(conn_id, "Received data for unknown connection");
                return;
            }
        };

        if packet.data.is_empty() {
            return;
        }
        if sender.send(packet.data).await.is_err() {
            debug!(conn_id, "Connection already finished, dropping data");
        }
    }

    fn establish(
        &self,
        conn_id: ConnectionId,
        address: String,
        outbound: &mpsc::Sender<Packet>,
        session: &CancellationToken,
    ) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        self.connections.insert(conn_id, tx);

        let forwarder = self.forwarder.clone();
        let connections = self.connections.clone();
        let outbound = outbound.clone();
        let cancel = session.child_token();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!(conn_id, "Connection cancelled"),
                result = forwarder.forward(conn_id, &address, rx, &outbound) => {
                    if let Err(e) = result {
                        debug!(conn_id, "Connection ended with error: {}", e);
                    }
                }
            }
            connections.remove(&conn_id);
        });
    }
}
