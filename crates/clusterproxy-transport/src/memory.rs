//! In-process packet stream built on tokio channels
//!
//! Used to run a tunnel without a network, and to inject stream failures.

use crate::{PacketSink, PacketSource, TransportError, TransportResult};
use async_trait::async_trait;
use clusterproxy_proto::Packet;
use tokio::sync::mpsc;

/// One end of an in-memory packet stream
#[derive(Debug)]
pub struct MemoryStream {
    sink: MemorySink,
    source: MemorySource,
}

/// Create two connected ends; what one end sends, the other receives
pub fn memory_pair(capacity: usize) -> (MemoryStream, MemoryStream) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);

    (
        MemoryStream {
            sink: MemorySink { tx: a_tx },
            source: MemorySource { rx: b_rx },
        },
        MemoryStream {
            sink: MemorySink { tx: b_tx },
            source: MemorySource { rx: a_rx },
        },
    )
}

impl MemoryStream {
    pub fn split(self) -> (MemorySink, MemorySource) {
        (self.sink, self.source)
    }
}

#[derive(Debug, Clone)]
pub struct MemorySink {
    tx: mpsc::Sender<TransportResult<Packet>>,
}

impl MemorySink {
    /// Make the peer's next read fail with `error`
    pub async fn fail(&self, error: TransportError) -> TransportResult<()> {
        self.tx
            .send(Err(error))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl PacketSink for MemorySink {
    async fn send_packet(&mut self, packet: Packet) -> TransportResult<()> {
        self.tx
            .send(Ok(packet))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn finish(&mut self) -> TransportResult<()> {
        // Replace the sender so the peer observes EOF once every clone is gone
        let (closed_tx, _) = mpsc::channel(1);
        self.tx = closed_tx;
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<TransportResult<Packet>>,
}

#[async_trait]
impl PacketSource for MemorySource {
    async fn recv_packet(&mut self) -> TransportResult<Option<Packet>> {
        match self.rx.recv().await {
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_packets_cross_in_order() {
        let (hub, agent) = memory_pair(8);
        let (mut hub_sink, _hub_source) = hub.split();
        let (_agent_sink, mut agent_source) = agent.split();

        hub_sink.send_packet(Packet::data(1, b"a".to_vec())).await.unwrap();
        hub_sink.send_packet(Packet::data(2, b"b".to_vec())).await.unwrap();

        assert_eq!(agent_source.recv_packet().await.unwrap().unwrap().conn_id, 1);
        assert_eq!(agent_source.recv_packet().await.unwrap().unwrap().conn_id, 2);
    }

    #[tokio::test]
    async fn test_dropping_peer_is_eof() {
        let (hub, agent) = memory_pair(8);
        let (_hub_sink, mut hub_source) = hub.split();
        drop(agent);

        assert!(hub_source.recv_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_is_eof_for_peer() {
        let (hub, agent) = memory_pair(8);
        let (mut hub_sink, _hub_source) = hub.split();
        let (_agent_sink, mut agent_source) = agent.split();

        hub_sink.finish().await.unwrap();
        assert!(agent_source.recv_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let (hub, agent) = memory_pair(8);
        let (_hub_sink, mut hub_source) = hub.split();
        let (agent_sink, _agent_source) = agent.split();

        agent_sink
            .fail(TransportError::ConnectionError("reset by peer".to_string()))
            .await
            .unwrap();

        let err = hub_source.recv_packet().await.unwrap_err();
        assert!(err.to_string().contains("reset by peer"));
    }
}
