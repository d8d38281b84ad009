//! Integration tests for tunnel registration, stream failure and teardown
//!
//! The agent side of each tunnel is driven by hand through an in-memory
//! packet stream, or through a real HTTP/2 connection over a duplex pipe.

use clusterproxy_control::{TunnelError, TunnelManager, TunnelServer};
use clusterproxy_proto::{Packet, CLUSTER_NAME_METADATA};
use clusterproxy_transport::{
    memory_pair, MemorySink, MemorySource, PacketSink, PacketSource, TransportError,
};
use clusterproxy_transport_h2::{H2ClientConnection, H2Config, H2ServerConnection};
use http::{HeaderMap, HeaderValue};
use std::time::Duration;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("clusterproxy_control=debug")
        .with_test_writer()
        .try_init();
}

fn metadata(cluster: &'static str) -> HeaderMap {
    let mut metadata = HeaderMap::new();
    metadata.insert(CLUSTER_NAME_METADATA, HeaderValue::from_static(cluster));
    metadata
}

/// Start the `Tunnel` RPC for `cluster` over an in-memory stream and wait
/// for it to register. Returns the agent's ends of the stream.
async fn connect_agent(
    server: &TunnelServer,
    cluster: &'static str,
) -> (
    MemorySink,
    MemorySource,
    tokio::task::JoinHandle<Result<(), TunnelError>>,
) {
    let before = server.manager().tunnel_count().await;
    let (hub, agent) = memory_pair(32);
    let (hub_sink, hub_source) = hub.split();
    let (agent_sink, agent_source) = agent.split();

    let handle = {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .tunnel(&metadata(cluster), Box::new(hub_sink), Box::new(hub_source))
                .await
        })
    };

    timeout(Duration::from_secs(2), async {
        while server.manager().tunnel_count().await == before {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("tunnel registered");

    (agent_sink, agent_source, handle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_failure_closes_every_connection() {
    init_tracing();
    let server = TunnelServer::new(TunnelManager::new());
    let (agent_sink, _agent_source, handle) = connect_agent(&server, "edge").await;

    let tunnel = server.get_tunnel("edge").await.unwrap();
    let conns: Vec<_> = (0..3)
        .map(|_| tunnel.new_logical_connection().unwrap())
        .collect();
    assert_eq!(tunnel.active_connections(), 3);

    let waiters: Vec<_> = conns
        .iter()
        .cloned()
        .map(|conn| tokio::spawn(async move { conn.recv().await }))
        .collect();

    agent_sink
        .fail(TransportError::ConnectionError("connection reset".into()))
        .await
        .unwrap();

    for waiter in waiters {
        let packet = timeout(Duration::from_secs(2), waiter)
            .await
            .expect("recv observed closure")
            .unwrap()
            .expect("close error delivered");
        assert!(packet.is_error());
        assert!(packet.error_message.contains("tunnel closed"));
        assert!(packet.error_message.contains("connection reset"));
    }
    for conn in &conns {
        assert!(conn.recv().await.is_none());
        assert!(conn.is_closed());
    }

    let result = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(TunnelError::Transport(_))));

    assert_eq!(server.manager().tunnel_count().await, 0);
    assert!(matches!(
        server.get_tunnel("edge").await,
        Err(TunnelError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_missing_cluster_name_registers_nothing() {
    init_tracing();
    let server = TunnelServer::new(TunnelManager::new());
    let (hub, _agent) = memory_pair(4);
    let (sink, source) = hub.split();

    let result = timeout(
        Duration::from_secs(1),
        server.tunnel(&HeaderMap::new(), Box::new(sink), Box::new(source)),
    )
    .await
    .expect("rejected immediately");

    assert!(matches!(result, Err(TunnelError::Protocol(_))));
    assert_eq!(server.manager().tunnel_count().await, 0);
}

#[tokio::test]
async fn test_clean_eof_deregisters_and_keeps_sibling_tunnel() {
    init_tracing();
    let server = TunnelServer::new(TunnelManager::new());
    let (old_sink, _old_source, old_handle) = connect_agent(&server, "edge").await;
    let (_new_sink, mut new_source, _new_handle) = connect_agent(&server, "edge").await;
    assert_eq!(server.manager().tunnel_count().await, 2);

    // Old agent instance goes away cleanly
    drop(old_sink);
    let result = timeout(Duration::from_secs(2), old_handle).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(server.manager().tunnel_count().await, 1);

    // The remaining instance still carries traffic
    let tunnel = server.get_tunnel("edge").await.unwrap();
    let conn = tunnel.new_logical_connection().unwrap();
    conn.send_data(b"ping".to_vec()).await.unwrap();
    let packet = timeout(Duration::from_secs(1), new_source.recv_packet())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(packet.conn_id, conn.id());
    assert_eq!(packet.data, b"ping");
}

#[tokio::test]
async fn test_agent_error_reaches_only_its_connection() {
    init_tracing();
    let server = TunnelServer::new(TunnelManager::new());
    let (mut agent_sink, _agent_source, _handle) = connect_agent(&server, "edge").await;

    let tunnel = server.get_tunnel("edge").await.unwrap();
    let failing = tunnel.new_logical_connection().unwrap();
    let healthy = tunnel.new_logical_connection().unwrap();

    agent_sink
        .send_packet(Packet::error(failing.id(), "dial tcp: connection refused"))
        .await
        .unwrap();
    agent_sink
        .send_packet(Packet::data(healthy.id(), b"ok".to_vec()))
        .await
        .unwrap();

    let packet = timeout(Duration::from_secs(1), failing.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(packet.is_error());
    assert_eq!(packet.error_message, "dial tcp: connection refused");

    let packet = timeout(Duration::from_secs(1), healthy.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(packet.data, b"ok");
    assert!(!tunnel.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_h2_calls_register_and_reject() {
    init_tracing();
    let server = TunnelServer::new(TunnelManager::new());

    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let config = H2Config::default();
    let addr = "127.0.0.1:0".parse().unwrap();
    let (hub_conn, agent_conn) = tokio::join!(
        H2ServerConnection::new(server_io, addr, &config),
        H2ClientConnection::new(client_io, addr, &config),
    );
    let (hub_conn, agent_conn) = (hub_conn.unwrap(), agent_conn.unwrap());

    {
        let server = server.clone();
        tokio::spawn(async move { server.serve_connection(hub_conn).await });
    }

    // No cluster-name: rejected, nothing registered
    let err = timeout(Duration::from_secs(2), agent_conn.open_call(HeaderMap::new()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.to_string().contains("400"), "{}", err);
    assert_eq!(server.manager().tunnel_count().await, 0);

    // With cluster-name: registered and reachable
    let (_sink, mut source) = timeout(Duration::from_secs(2), agent_conn.open_tunnel("edge-h2"))
        .await
        .unwrap()
        .unwrap();

    let tunnel = timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(tunnel) = server.get_tunnel("edge-h2").await {
                return tunnel;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let conn = tunnel.new_logical_connection().unwrap();
    conn.send_data(Vec::new()).await.unwrap();
    let packet = timeout(Duration::from_secs(2), source.recv_packet())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(packet.conn_id, conn.id());
    assert!(packet.data.is_empty());
}
