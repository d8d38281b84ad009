//! Hub- and agent-side HTTP/2 connections carrying tunnel calls

use bytes::{Bytes, BytesMut};
use clusterproxy_proto::{CLUSTER_NAME_METADATA, TUNNEL_RPC_PATH};
use clusterproxy_transport::{TransportError, TransportResult};
use h2::client::SendRequest;
use h2::server::SendResponse;
use h2::RecvStream;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use crate::config::H2Config;
use crate::stream::{H2PacketSink, H2PacketSource};

/// Rejection bodies larger than this are truncated when read by the agent
const MAX_REJECTION_BODY: usize = 4 * 1024;

/// Response header carrying a human readable rejection reason
pub const ERROR_MESSAGE_HEADER: &str = "x-tunnel-error";

/// Hub side of one agent connection
pub struct H2ServerConnection {
    connection_id: String,
    remote_addr: SocketAddr,
    /// Incoming requests, fed by the connection driver task
    accept_rx: Mutex<mpsc::Receiver<(Request<RecvStream>, SendResponse<Bytes>)>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for H2ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2ServerConnection")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl H2ServerConnection {
    pub async fn new<T>(io: T, remote_addr: SocketAddr, config: &H2Config) -> TransportResult<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = format!("h2-server-{}", uuid::Uuid::new_v4());

        let mut h2_conn = config
            .server_builder()
            .handshake::<T, Bytes>(io)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

        let (accept_tx, accept_rx) = mpsc::channel(64);
        let closed = Arc::new(AtomicBool::new(false));

        // Connection driver
        let closed_clone = closed.clone();
        let conn_id = connection_id.clone();
        tokio::spawn(async move {
            loop {
                match h2_conn.accept().await {
                    Some(Ok((request, send_response))) => {
                        debug!("[{}] Accepted H2 stream {}", conn_id, request.uri().path());
                        if accept_tx.send((request, send_response)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        if !e.is_go_away() && !e.is_io() {
                            error!("[{}] H2 accept error: {}", conn_id, e);
                        }
                        break;
                    }
                    None => {
                        debug!("[{}] H2 connection closed", conn_id);
                        break;
                    }
                }
            }
            closed_clone.store(true, Ordering::SeqCst);
        });

        Ok(Self {
            connection_id,
            remote_addr,
            accept_rx: Mutex::new(accept_rx),
            closed,
        })
    }

    /// Next call opened by the agent, `None` once the connection is gone
    pub async fn accept_call(&self) -> Option<TunnelCall> {
        let mut accept_rx = self.accept_rx.lock().await;
        let (request, respond) = accept_rx.recv().await?;
        let (parts, recv) = request.into_parts();

        Some(TunnelCall {
            connection_id: self.connection_id.clone(),
            remote_addr: self.remote_addr,
            method: parts.method,
            path: parts.uri.path().to_string(),
            metadata: parts.headers,
            recv,
            respond,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A pending tunnel call: request headers are in, no response sent yet
pub struct TunnelCall {
    connection_id: String,
    remote_addr: SocketAddr,
    method: Method,
    path: String,
    metadata: HeaderMap,
    recv: RecvStream,
    respond: SendResponse<Bytes>,
}

impl std::fmt::Debug for TunnelCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelCall")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .field("method", &self.method)
            .field("path", &self.path)
            .finish()
    }
}

impl TunnelCall {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request headers; the agent sends `cluster-name` here
    pub fn metadata(&self) -> &HeaderMap {
        &self.metadata
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Answer with a non-success status and close the stream
    pub fn reject(mut self, status: StatusCode, message: &str) -> TransportResult<()> {
        let mut response = Response::new(());
        *response.status_mut() = status;
        if let Ok(value) = HeaderValue::from_str(message) {
            response.headers_mut().insert(ERROR_MESSAGE_HEADER, value);
        }

        let mut send = self.respond.send_response(response, false).map_err(|e| {
            TransportError::ConnectionError(format!("Failed to send response: {}", e))
        })?;
        send.send_data(Bytes::copy_from_slice(message.as_bytes()), true)
            .map_err(|e| TransportError::ConnectionError(format!("Failed to send body: {}", e)))
    }

    /// Answer 200 and hand back the packet streams for this call
    pub fn accept(mut self) -> TransportResult<(H2PacketSink, H2PacketSource)> {
        let response = Response::new(());

        let send = self.respond.send_response(response, false).map_err(|e| {
            TransportError::ConnectionError(format!("Failed to send response: {}", e))
        })?;

        let stream_id = send.stream_id().as_u32();
        debug!("[{}] Accepted tunnel call on stream {}", self.connection_id, stream_id);

        Ok((
            H2PacketSink::new(send, stream_id),
            H2PacketSource::new(self.recv, stream_id),
        ))
    }
}

/// Agent side of the hub connection
pub struct H2ClientConnection {
    connection_id: String,
    remote_addr: SocketAddr,
    send_request: SendRequest<Bytes>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for H2ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2ClientConnection")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl H2ClientConnection {
    pub async fn new<T>(io: T, remote_addr: SocketAddr, config: &H2Config) -> TransportResult<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = format!("h2-client-{}", uuid::Uuid::new_v4());

        let (send_request, h2_conn) = config
            .client_builder()
            .handshake::<T, Bytes>(io)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

        let closed = Arc::new(AtomicBool::new(false));

        // Connection driver
        let closed_clone = closed.clone();
        let conn_id = connection_id.clone();
        tokio::spawn(async move {
            if let Err(e) = h2_conn.await {
                if !e.is_go_away() && !e.is_io() {
                    error!("[{}] H2 connection error: {}", conn_id, e);
                }
            }
            debug!("[{}] H2 connection closed", conn_id);
            closed_clone.store(true, Ordering::SeqCst);
        });

        Ok(Self {
            connection_id,
            remote_addr,
            send_request,
            closed,
        })
    }

    /// Open the tunnel call announcing `cluster_name`
    pub async fn open_tunnel(
        &self,
        cluster_name: &str,
    ) -> TransportResult<(H2PacketSink, H2PacketSource)> {
        let mut metadata = HeaderMap::new();
        let value = HeaderValue::from_str(cluster_name).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid cluster name: {}", e))
        })?;
        metadata.insert(CLUSTER_NAME_METADATA, value);
        self.open_call(metadata).await
    }

    /// Open the tunnel call with arbitrary request metadata
    pub async fn open_call(
        &self,
        metadata: HeaderMap,
    ) -> TransportResult<(H2PacketSink, H2PacketSource)> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut ready_request = self.send_request.clone().ready().await.map_err(|e| {
            TransportError::ConnectionError(format!("H2 connection not ready: {}", e))
        })?;

        let mut request = Request::new(());
        *request.method_mut() = Method::POST;
        *request.uri_mut() = format!("https://clusterproxy{}", TUNNEL_RPC_PATH)
            .parse()
            .map_err(|e| TransportError::ProtocolError(format!("Invalid call URI: {}", e)))?;
        *request.headers_mut() = metadata;

        let (response, send) = ready_request.send_request(request, false).map_err(|e| {
            TransportError::ConnectionError(format!("Failed to open call: {}", e))
        })?;
        let stream_id = send.stream_id().as_u32();

        let response = response.await.map_err(|e| {
            TransportError::ConnectionError(format!("Failed to get response: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = read_rejection(response).await;
            return Err(TransportError::ProtocolError(format!(
                "Hub rejected tunnel call ({}): {}",
                status, message
            )));
        }

        debug!("[{}] Opened tunnel call on stream {}", self.connection_id, stream_id);

        Ok((
            H2PacketSink::new(send, stream_id),
            H2PacketSource::new(response.into_body(), stream_id),
        ))
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn read_rejection(response: Response<RecvStream>) -> String {
    if let Some(message) = response
        .headers()
        .get(ERROR_MESSAGE_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return message.to_string();
    }

    let mut body = response.into_body();
    let mut collected = BytesMut::new();
    while collected.len() < MAX_REJECTION_BODY {
        match body.data().await {
            Some(Ok(chunk)) => {
                let _ = body.flow_control().release_capacity(chunk.len());
                collected.extend_from_slice(&chunk);
            }
            _ => break,
        }
    }
    collected.truncate(MAX_REJECTION_BODY);
    String::from_utf8_lossy(&collected).into_owned()
}
