//! Logical connections multiplexed over a tunnel

use clusterproxy_proto::{ConnectionId, Packet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tunnel::{TunnelShared, CONNECTION_CLOSED_MESSAGE};
use crate::TunnelError;

/// Close state shared between a connection handle and its registry entry
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    closed: AtomicBool,
    /// The agent already ended its side with an ERROR packet
    remote_closed: AtomicBool,
    cancelled: CancellationToken,
    /// Pending local ERROR, handed out by exactly one `recv`
    close_error: Mutex<Option<String>>,
}

impl ConnectionState {
    /// Returns false if the connection was already closed.
    pub(crate) fn close(&self, error: Option<String>) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(error) = error {
            if let Ok(mut slot) = self.close_error.lock() {
                *slot = Some(error);
            }
        }
        self.cancelled.cancel();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_remote_closed(&self) {
        self.remote_closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_remote_closed(&self) -> bool {
        self.remote_closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn closed(&self) {
        self.cancelled.cancelled().await
    }

    fn take_error(&self) -> Option<String> {
        self.close_error.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// One virtual connection inside a [`Tunnel`](crate::Tunnel).
///
/// The tunnel owns the registry entry; this handle only sends, receives
/// and closes. Dropping the last handle closes the connection.
#[derive(Debug)]
pub struct LogicalConnection {
    id: ConnectionId,
    tunnel: Weak<TunnelShared>,
    state: std::sync::Arc<ConnectionState>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
}

impl LogicalConnection {
    pub(crate) fn new(
        id: ConnectionId,
        tunnel: Weak<TunnelShared>,
        state: std::sync::Arc<ConnectionState>,
        inbound: mpsc::Receiver<Packet>,
    ) -> Self {
        Self {
            id,
            tunnel,
            state,
            inbound: tokio::sync::Mutex::new(inbound),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Write a packet to the tunnel stream, stamped with this connection's id.
    ///
    /// Writes from all connections of a tunnel are serialized.
    pub async fn send(&self, mut packet: Packet) -> Result<(), TunnelError> {
        if self.state.is_closed() {
            return Err(TunnelError::Closed);
        }
        let tunnel = self.tunnel.upgrade().ok_or(TunnelError::Closed)?;
        packet.conn_id = self.id;
        tunnel.write_packet(packet).await
    }

    pub async fn send_data(&self, data: impl Into<Vec<u8>>) -> Result<(), TunnelError> {
        self.send(Packet::data(self.id, data)).await
    }

    /// Next inbound packet for this connection.
    ///
    /// After the connection is closed this yields the close error (once, as
    /// an ERROR packet) if there was one, and `None` from then on.
    pub async fn recv(&self) -> Option<Packet> {
        let mut inbound = self.inbound.lock().await;

        if !self.state.is_closed() {
            tokio::select! {
                biased;
                packet = inbound.recv() => {
                    if packet.is_some() {
                        return packet;
                    }
                }
                _ = self.state.closed() => {}
            }
        }

        self.state
            .take_error()
            .map(|message| Packet::error(self.id, message))
    }

    /// Close the connection; later calls are no-ops.
    ///
    /// Removes the registry entry and wakes any pending `recv`. A non-`None`
    /// error is reported by the next `recv` as an ERROR packet. Unless the
    /// agent already ended the connection, it is sent an ERROR packet so it
    /// releases its side too.
    pub fn close(&self, error: Option<String>) {
        let reason = error.clone();
        if !self.state.close(error) {
            return;
        }
        if let Some(tunnel) = self.tunnel.upgrade() {
            tunnel.release_connection(
                self.id,
                &self.state,
                reason.as_deref().unwrap_or(CONNECTION_CLOSED_MESSAGE),
            );
        }
        debug!(conn_id = self.id, "Logical connection closed");
    }
}

impl Drop for LogicalConnection {
    fn drop(&mut self) {
        self.close(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn detached(id: ConnectionId) -> (LogicalConnection, mpsc::Sender<Packet>) {
        let (tx, rx) = mpsc::channel(4);
        let conn = LogicalConnection::new(id, Weak::new(), Arc::default(), rx);
        (conn, tx)
    }

    #[tokio::test]
    async fn test_recv_delivers_in_order() {
        let (conn, tx) = detached(3);
        tx.send(Packet::data(3, b"a".to_vec())).await.unwrap();
        tx.send(Packet::data(3, b"b".to_vec())).await.unwrap();

        assert_eq!(conn.recv().await.unwrap().data, b"a");
        assert_eq!(conn.recv().await.unwrap().data, b"b");
    }

    #[tokio::test]
    async fn test_close_with_error_surfaces_once() {
        let (conn, _tx) = detached(1);

        conn.close(Some("upstream reset".into()));
        conn.close(Some("second close".into()));

        let packet = conn.recv().await.unwrap();
        assert!(packet.is_error());
        assert_eq!(packet.error_message, "upstream reset");
        assert!(conn.recv().await.is_none());
        assert!(conn.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv() {
        let (conn, _tx) = detached(1);
        let conn = Arc::new(conn);

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.recv().await })
        };
        tokio::task::yield_now().await;
        conn.close(None);

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_send_without_tunnel_fails() {
        let (conn, _tx) = detached(1);
        assert!(matches!(
            conn.send_data(b"x".to_vec()).await,
            Err(TunnelError::Closed)
        ));
    }
}
