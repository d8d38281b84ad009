//! Per-agent multiplexer: one physical packet stream, many logical connections

use chrono::{DateTime, Utc};
use clusterproxy_proto::{ConnectionId, Packet};
use clusterproxy_transport::{BoxPacketSink, BoxPacketSource, TransportError};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectionState, LogicalConnection};
use crate::manager::ManagerShared;
use crate::TunnelError;

/// Inbound packets buffered per logical connection. A connection whose
/// consumer falls this far behind is closed; the reader never waits on it.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// ERROR text sent to the agent when the hub releases a connection
pub const CONNECTION_CLOSED_MESSAGE: &str = "connection closed by hub";

pub(crate) const QUEUE_FULL_MESSAGE: &str = "connection receive queue full";

/// Identity of one tunnel instance; a cluster may have several over time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TunnelId(pub u64);

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct ConnectionEntry {
    tx: mpsc::Sender<Packet>,
    state: Arc<ConnectionState>,
}

pub(crate) struct TunnelShared {
    id: TunnelId,
    cluster_name: String,
    connected_at: DateTime<Utc>,
    queue_depth: usize,
    sink: tokio::sync::Mutex<BoxPacketSink>,
    source: Mutex<Option<BoxPacketSource>>,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    next_id: AtomicI64,
    shutdown: CancellationToken,
    /// First stream failure seen by a writer
    failure: Mutex<Option<String>>,
    manager: Weak<ManagerShared>,
}

impl fmt::Debug for TunnelShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelShared")
            .field("id", &self.id)
            .field("cluster_name", &self.cluster_name)
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl TunnelShared {
    pub(crate) async fn write_packet(&self, packet: Packet) -> Result<(), TunnelError> {
        let conn_id = packet.conn_id;
        let len = packet.data.len();

        let mut sink = tokio::select! {
            sink = self.sink.lock() => sink,
            _ = self.shutdown.cancelled() => return Err(TunnelError::Closed),
        };

        let result = tokio::select! {
            result = sink.send_packet(packet) => result,
            _ = self.shutdown.cancelled() => return Err(TunnelError::Closed),
        };
        drop(sink);

        match result {
            Ok(()) => {
                trace!(tunnel_id = %self.id, conn_id, len, "Packet written");
                Ok(())
            }
            Err(e) => {
                warn!(
                    cluster = %self.cluster_name,
                    tunnel_id = %self.id,
                    "Tunnel stream write failed: {}",
                    e
                );
                self.fail(e.to_string());
                Err(TunnelError::Transport(e))
            }
        }
    }

    /// Drop the registry entry of a closed connection and tell the agent,
    /// unless the agent ended the connection itself.
    pub(crate) fn release_connection(
        self: &Arc<Self>,
        id: ConnectionId,
        state: &ConnectionState,
        reason: &str,
    ) {
        let registered = self.connections.remove(&id).is_some();
        if registered && !state.is_remote_closed() {
            self.notify_closed(id, reason.to_string());
        }
    }

    /// Best-effort ERROR to the agent, written off the caller's task
    fn notify_closed(self: &Arc<Self>, id: ConnectionId, reason: String) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(tunnel_id = %self.id, conn_id = id, "No runtime to notify agent of close");
            return;
        };

        let shared = self.clone();
        runtime.spawn(async move {
            if let Err(e) = shared.write_packet(Packet::error(id, reason)).await {
                debug!(tunnel_id = %shared.id, conn_id = id, "Failed to notify agent of close: {}", e);
            }
        });
    }

    fn fail(&self, reason: String) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(reason);
        }
        self.shutdown.cancel();
    }

    fn take_failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|mut f| f.take())
    }

    /// Hand a packet to its connection without waiting on the consumer
    fn dispatch(self: &Arc<Self>, packet: Packet) {
        let conn_id = packet.conn_id;

        let entry = self
            .connections
            .get(&conn_id)
            .map(|entry| (entry.tx.clone(), entry.state.clone()));

        let Some((tx, state)) = entry else {
            // Expected for data already in flight when a connection closes
            debug!(tunnel_id = %self.id, conn_id, "Dropping packet for unknown connection");
            return;
        };

        trace!(tunnel_id = %self.id, conn_id, len = packet.data.len(), "Dispatching packet");

        if packet.is_error() {
            state.mark_remote_closed();
        }

        match tx.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    cluster = %self.cluster_name,
                    tunnel_id = %self.id,
                    conn_id,
                    queue_depth = self.queue_depth,
                    "Connection is not draining its packets, closing it"
                );
                if state.close(Some(QUEUE_FULL_MESSAGE.to_string())) {
                    self.release_connection(conn_id, &state, QUEUE_FULL_MESSAGE);
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(tunnel_id = %self.id, conn_id, "Connection gone before delivery");
            }
        }
    }

    async fn terminate(&self, reason: &str) {
        self.shutdown.cancel();

        let message = format!("tunnel closed: {}", reason);
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        let mut closed = 0usize;
        for id in ids {
            if let Some((_, entry)) = self.connections.remove(&id) {
                if entry.state.close(Some(message.clone())) {
                    closed += 1;
                }
            }
        }

        if let Err(e) = self.sink.lock().await.finish().await {
            debug!(tunnel_id = %self.id, "Finishing tunnel stream failed: {}", e);
        }

        info!(
            cluster = %self.cluster_name,
            tunnel_id = %self.id,
            closed_connections = closed,
            "Tunnel terminated: {}",
            reason
        );

        if let Some(manager) = self.manager.upgrade() {
            manager.remove(&self.cluster_name, self.id).await;
        }
    }
}

/// Snapshot of a live tunnel
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub cluster_name: String,
    pub tunnel_id: TunnelId,
    pub connected_at: DateTime<Utc>,
    pub active_connections: usize,
}

/// Hub-side multiplexer bound to one agent stream. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Tunnel {
    shared: Arc<TunnelShared>,
}

impl Tunnel {
    /// A tunnel not attached to any manager
    pub fn new(
        id: TunnelId,
        cluster_name: impl Into<String>,
        sink: BoxPacketSink,
        source: BoxPacketSource,
    ) -> Self {
        Self::build(id, cluster_name.into(), sink, source, DEFAULT_QUEUE_DEPTH, Weak::new())
    }

    pub(crate) fn build(
        id: TunnelId,
        cluster_name: String,
        sink: BoxPacketSink,
        source: BoxPacketSource,
        queue_depth: usize,
        manager: Weak<ManagerShared>,
    ) -> Self {
        Self {
            shared: Arc::new(TunnelShared {
                id,
                cluster_name,
                connected_at: Utc::now(),
                queue_depth: queue_depth.max(1),
                sink: tokio::sync::Mutex::new(sink),
                source: Mutex::new(Some(source)),
                connections: DashMap::new(),
                next_id: AtomicI64::new(1),
                shutdown: CancellationToken::new(),
                failure: Mutex::new(None),
                manager,
            }),
        }
    }

    pub fn id(&self) -> TunnelId {
        self.shared.id
    }

    pub fn cluster_name(&self) -> &str {
        &self.shared.cluster_name
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.shared.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    pub fn active_connections(&self) -> usize {
        self.shared.connections.len()
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            cluster_name: self.shared.cluster_name.clone(),
            tunnel_id: self.shared.id,
            connected_at: self.shared.connected_at,
            active_connections: self.active_connections(),
        }
    }

    /// Register a new logical connection. Nothing is sent to the agent;
    /// the caller performs the handshake.
    pub fn new_logical_connection(&self) -> Result<Arc<LogicalConnection>, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.shared.queue_depth);
        let state = Arc::new(ConnectionState::default());

        self.shared.connections.insert(
            id,
            ConnectionEntry {
                tx,
                state: state.clone(),
            },
        );

        // Lost a race with terminate(): it may have cleared the registry already
        if self.is_closed() {
            self.shared.connections.remove(&id);
            state.close(None);
            return Err(TunnelError::Closed);
        }

        debug!(
            cluster = %self.shared.cluster_name,
            tunnel_id = %self.shared.id,
            conn_id = id,
            "Logical connection opened"
        );

        Ok(Arc::new(LogicalConnection::new(
            id,
            Arc::downgrade(&self.shared),
            state,
            rx,
        )))
    }

    /// Drain the stream until it ends, dispatching packets by connection id.
    ///
    /// On return every logical connection has been closed and the tunnel has
    /// left its manager. Clean EOF and [`Tunnel::close`] return `Ok`.
    pub async fn serve(&self) -> Result<(), TunnelError> {
        let mut source = self
            .shared
            .source
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(TunnelError::AlreadyServing)?;

        info!(
            cluster = %self.shared.cluster_name,
            tunnel_id = %self.shared.id,
            "Serving tunnel"
        );

        let (result, reason) = loop {
            tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => {
                    break match self.shared.take_failure() {
                        Some(reason) => (
                            Err(TunnelError::Transport(TransportError::ConnectionError(reason.clone()))),
                            reason,
                        ),
                        None => (Ok(()), "shut down".to_string()),
                    };
                }
                received = source.recv_packet() => match received {
                    Ok(Some(packet)) => self.shared.dispatch(packet),
                    Ok(None) => break (Ok(()), "stream ended".to_string()),
                    Err(e) => {
                        let reason = e.to_string();
                        break (Err(TunnelError::Transport(e)), reason);
                    }
                },
            }
        };

        drop(source);
        self.shared.terminate(&reason).await;
        result
    }

    /// Stop serving: `serve` returns and every connection is closed
    pub fn close(&self) {
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterproxy_transport::{memory_pair, PacketSink, PacketSource};
    use std::time::Duration;
    use tokio::time::timeout;

    fn tunnel_pair() -> (
        Tunnel,
        clusterproxy_transport::MemorySink,
        clusterproxy_transport::MemorySource,
    ) {
        let (hub, agent) = memory_pair(16);
        let (hub_sink, hub_source) = hub.split();
        let (agent_sink, agent_source) = agent.split();
        let tunnel = Tunnel::new(
            TunnelId(1),
            "edge",
            Box::new(hub_sink),
            Box::new(hub_source),
        );
        (tunnel, agent_sink, agent_source)
    }

    #[test]
    fn test_ids_are_distinct_and_increasing() {
        let (tunnel, _sink, _source) = tunnel_pair();

        let conns: Vec<_> = (0..50)
            .map(|_| tunnel.new_logical_connection().unwrap())
            .collect();
        let ids: Vec<_> = conns.iter().map(|c| c.id()).collect();

        assert_eq!(ids[0], 1);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(tunnel.active_connections(), 50);
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_close() {
        let (tunnel, _sink, _source) = tunnel_pair();

        let first = tunnel.new_logical_connection().unwrap();
        let first_id = first.id();
        first.close(None);
        drop(first);

        let second = tunnel.new_logical_connection().unwrap();
        assert!(second.id() > first_id);
        assert_eq!(tunnel.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_packets_reach_their_connection_only() {
        let (tunnel, mut agent_sink, _agent_source) = tunnel_pair();
        let a = tunnel.new_logical_connection().unwrap();
        let b = tunnel.new_logical_connection().unwrap();

        let serving = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.serve().await })
        };

        agent_sink
            .send_packet(Packet::data(b.id(), b"for b".to_vec()))
            .await
            .unwrap();
        agent_sink
            .send_packet(Packet::data(999, b"stale".to_vec()))
            .await
            .unwrap();
        agent_sink
            .send_packet(Packet::data(a.id(), b"for a".to_vec()))
            .await
            .unwrap();

        let got_a = timeout(Duration::from_secs(1), a.recv()).await.unwrap().unwrap();
        let got_b = timeout(Duration::from_secs(1), b.recv()).await.unwrap().unwrap();
        assert_eq!(got_a.data, b"for a");
        assert_eq!(got_b.data, b"for b");

        agent_sink.finish().await.unwrap();
        let result = timeout(Duration::from_secs(1), serving).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_outbound_packets_are_stamped() {
        let (tunnel, _agent_sink, mut agent_source) = tunnel_pair();
        let conn = tunnel.new_logical_connection().unwrap();

        conn.send(Packet::data(42, b"hello".to_vec())).await.unwrap();

        let packet = agent_source.recv_packet().await.unwrap().unwrap();
        assert_eq!(packet.conn_id, conn.id());
        assert_eq!(packet.data, b"hello");
        assert!(packet.target_address.is_none());
    }

    #[tokio::test]
    async fn test_serve_twice_is_rejected() {
        let (tunnel, _sink, _source) = tunnel_pair();
        let serving = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.serve().await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(tunnel.serve().await, Err(TunnelError::AlreadyServing)));

        tunnel.close();
        assert!(timeout(Duration::from_secs(1), serving).await.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_write_failure_tears_down_tunnel() {
        let (tunnel, _agent_sink, agent_source) = tunnel_pair();
        let conn = tunnel.new_logical_connection().unwrap();
        let sibling = tunnel.new_logical_connection().unwrap();

        let serving = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.serve().await })
        };

        // Agent side stops reading: the hub's next write fails
        drop(agent_source);
        assert!(conn.send_data(b"lost".to_vec()).await.is_err());

        let result = timeout(Duration::from_secs(1), serving).await.unwrap().unwrap();
        assert!(matches!(result, Err(TunnelError::Transport(_))));

        let packet = timeout(Duration::from_secs(1), sibling.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(packet.error_message.starts_with("tunnel closed:"));
        assert!(sibling.recv().await.is_none());
        assert!(tunnel.new_logical_connection().is_err());
    }

    #[tokio::test]
    async fn test_local_close_tells_agent() {
        let (tunnel, _agent_sink, mut agent_source) = tunnel_pair();
        let conn = tunnel.new_logical_connection().unwrap();

        conn.close(None);
        conn.close(Some("again".into()));

        let packet = timeout(Duration::from_secs(1), agent_source.recv_packet())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(packet.is_error());
        assert_eq!(packet.conn_id, conn.id());
        assert_eq!(packet.error_message, CONNECTION_CLOSED_MESSAGE);
        assert_eq!(tunnel.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_close_after_agent_error_sends_nothing_back() {
        let (tunnel, mut agent_sink, mut agent_source) = tunnel_pair();
        let ended = tunnel.new_logical_connection().unwrap();
        let other = tunnel.new_logical_connection().unwrap();
        let serving = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.serve().await })
        };

        agent_sink
            .send_packet(Packet::error(ended.id(), "EOF"))
            .await
            .unwrap();
        let packet = timeout(Duration::from_secs(1), ended.recv()).await.unwrap().unwrap();
        assert_eq!(packet.error_message, "EOF");

        ended.close(None);
        other.close(None);

        // Only the connection the agent still considers open is reported
        let packet = timeout(Duration::from_secs(1), agent_source.recv_packet())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(packet.conn_id, other.id());

        tunnel.close();
        timeout(Duration::from_secs(1), serving).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stalled_connection_does_not_block_siblings() {
        let (hub, agent) = memory_pair(16);
        let (hub_sink, hub_source) = hub.split();
        let (mut agent_sink, mut agent_source) = agent.split();
        let tunnel = Tunnel::build(
            TunnelId(1),
            "edge".into(),
            Box::new(hub_sink),
            Box::new(hub_source),
            2,
            Weak::new(),
        );
        let stalled = tunnel.new_logical_connection().unwrap();
        let sibling = tunnel.new_logical_connection().unwrap();
        let serving = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.serve().await })
        };

        // Nobody reads `stalled`
        for _ in 0..4 {
            agent_sink
                .send_packet(Packet::data(stalled.id(), b"backlog".to_vec()))
                .await
                .unwrap();
        }
        agent_sink
            .send_packet(Packet::data(sibling.id(), b"still flowing".to_vec()))
            .await
            .unwrap();

        let packet = timeout(Duration::from_secs(1), sibling.recv())
            .await
            .expect("sibling keeps receiving")
            .unwrap();
        assert_eq!(packet.data, b"still flowing");

        // The stalled connection was closed and the agent told
        assert!(stalled.is_closed());
        let packet = stalled.recv().await.unwrap();
        assert_eq!(packet.error_message, QUEUE_FULL_MESSAGE);
        let notice = timeout(Duration::from_secs(1), agent_source.recv_packet())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(notice.conn_id, stalled.id());
        assert_eq!(notice.error_message, QUEUE_FULL_MESSAGE);
        assert_eq!(tunnel.active_connections(), 1);

        tunnel.close();
        timeout(Duration::from_secs(1), serving).await.unwrap().unwrap().unwrap();
    }
}
