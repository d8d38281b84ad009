//! Tunnel calls over an in-memory duplex pipe (no TLS)

use clusterproxy_proto::{Packet, CLUSTER_NAME_METADATA, TUNNEL_RPC_PATH};
use clusterproxy_transport::{PacketSink, PacketSource, TransportError};
use clusterproxy_transport_h2::{H2ClientConnection, H2Config, H2ServerConnection};
use http::StatusCode;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;

fn addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn connected_pair() -> (H2ServerConnection, H2ClientConnection) {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let config = H2Config::default();

    let (server, client) = tokio::join!(
        H2ServerConnection::new(server_io, addr(), &config),
        H2ClientConnection::new(client_io, addr(), &config),
    );
    (server.unwrap(), client.unwrap())
}

#[tokio::test]
async fn test_accepted_call_carries_packets_both_ways() {
    let (server, client) = connected_pair().await;

    let hub = tokio::spawn(async move {
        let call = server.accept_call().await.expect("call");
        assert_eq!(call.path(), TUNNEL_RPC_PATH);
        assert_eq!(
            call.metadata().get(CLUSTER_NAME_METADATA).unwrap(),
            "edge-1"
        );

        let (mut sink, mut source) = call.accept().unwrap();
        sink.send_packet(Packet::data(1, b"from hub".to_vec()))
            .await
            .unwrap();

        let reply = source.recv_packet().await.unwrap().unwrap();
        assert_eq!(reply.conn_id, 1);
        assert_eq!(reply.data, b"from agent");

        let big = source.recv_packet().await.unwrap().unwrap();
        assert_eq!(big.data.len(), 3 * 1024 * 1024);
        assert!(big.data.iter().all(|b| *b == 0xAB));

        // Agent finished its half
        assert!(source.recv_packet().await.unwrap().is_none());
        sink.finish().await.unwrap();
        server
    });

    let (mut sink, mut source) = client.open_tunnel("edge-1").await.unwrap();
    let first = source.recv_packet().await.unwrap().unwrap();
    assert_eq!(first.data, b"from hub");

    sink.send_packet(Packet::data(1, b"from agent".to_vec()))
        .await
        .unwrap();
    // Larger than the stream window, exercises the capacity loop
    sink.send_packet(Packet::data(2, vec![0xAB; 3 * 1024 * 1024]))
        .await
        .unwrap();
    sink.finish().await.unwrap();

    assert!(timeout(Duration::from_secs(5), source.recv_packet())
        .await
        .unwrap()
        .unwrap()
        .is_none());

    hub.await.unwrap();
}

#[tokio::test]
async fn test_rejected_call_reports_status() {
    let (server, client) = connected_pair().await;

    let hub = tokio::spawn(async move {
        let call = server.accept_call().await.expect("call");
        assert!(call.metadata().get(CLUSTER_NAME_METADATA).is_none());
        call.reject(StatusCode::BAD_REQUEST, "missing cluster-name")
            .unwrap();
        server
    });

    let err = client.open_call(http::HeaderMap::new()).await.unwrap_err();
    match err {
        TransportError::ProtocolError(msg) => {
            assert!(msg.contains("400"), "{}", msg);
            assert!(msg.contains("missing cluster-name"), "{}", msg);
        }
        other => panic!("unexpected error: {:?}", other),
    }

    hub.await.unwrap();
}

#[tokio::test]
async fn test_sink_rejects_after_finish() {
    let (server, client) = connected_pair().await;

    let hub = tokio::spawn(async move {
        let call = server.accept_call().await.expect("call");
        let (_sink, _source) = call.accept().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        server
    });

    let (mut sink, _source) = client.open_tunnel("edge-2").await.unwrap();
    sink.finish().await.unwrap();
    assert!(matches!(
        sink.send_packet(Packet::data(1, b"late".to_vec())).await,
        Err(TransportError::Closed)
    ));

    hub.await.unwrap();
}
