use clusterproxy_proto::{ConnectionId, Packet, EOF_MESSAGE};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Errors that can occur during TCP forwarding
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to remote address {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to remote address {0}")]
    ConnectTimeout(String),

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel stream closed")]
    Closed,
}

/// Dials targets and pumps one logical connection over TCP
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    connect_timeout: Duration,
    buffer_size: usize,
}

impl TcpForwarder {
    pub fn new(connect_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            connect_timeout,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Forward one logical connection to `address`.
    ///
    /// `inbound` carries payloads from the hub; it closing means the hub is
    /// done with the connection. Everything read from the target goes out
    /// on `outbound` as DATA packets. The hub always learns how the
    /// connection ended: `ERROR` with the dial or IO error text, or
    /// `ERROR "EOF"` when the target closed.
    pub async fn forward(
        &self,
        conn_id: ConnectionId,
        address: &str,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        outbound: &mpsc::Sender<Packet>,
    ) -> Result<(), ForwarderError> {
        tracing::debug!(conn_id, remote_address = %address, "Dialing target");

        let stream = match self.connect(address).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = outbound.send(Packet::error(conn_id, e.to_string())).await;
                return Err(e);
            }
        };
        let (mut target_read, mut target_write) = stream.into_split();

        let hub_to_target = async {
            let mut total_bytes = 0u64;
            while let Some(data) = inbound.recv().await {
                if let Err(e) = target_write.write_all(&data).await {
                    return Err(ForwarderError::Io(e));
                }
                total_bytes += data.len() as u64;
            }
            let _ = target_write.shutdown().await;
            Ok::<u64, ForwarderError>(total_bytes)
        };

        let target_to_hub = async {
            let mut total_bytes = 0u64;
            let mut buffer = vec![0u8; self.buffer_size];
            loop {
                let n = match target_read.read(&mut buffer).await {
                    Ok(0) => return Ok::<u64, ForwarderError>(total_bytes),
                    Ok(n) => n,
                    Err(e) => return Err(ForwarderError::Io(e)),
                };
                if outbound
                    .send(Packet::data(conn_id, &buffer[..n]))
                    .await
                    .is_err()
                {
                    return Err(ForwarderError::Closed);
                }
                total_bytes += n as u64;
                tracing::trace!(conn_id, bytes = n, "Forwarded data to hub");
            }
        };

        // Either side ending ends the connection
        let result = tokio::select! {
            result = hub_to_target => match result {
                Ok(bytes_to_target) => {
                    tracing::debug!(conn_id, bytes_to_target, "Hub closed connection");
                    return Ok(());
                }
                Err(e) => Err(e),
            },
            result = target_to_hub => match result {
                Ok(bytes_to_hub) => {
                    tracing::debug!(conn_id, bytes_to_hub, "Target closed connection");
                    let _ = outbound.send(Packet::error(conn_id, EOF_MESSAGE)).await;
                    return Ok(());
                }
                Err(e) => Err(e),
            },
        };

        if let Err(e) = &result {
            tracing::debug!(conn_id, "Forwarding failed: {}", e);
            let _ = outbound.send(Packet::error(conn_id, e.to_string())).await;
        }
        result
    }

    async fn connect(&self, address: &str) -> Result<TcpStream, ForwarderError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ForwarderError::ConnectionFailed {
                address: address.to_string(),
                source,
            }),
            Err(_) => Err(ForwarderError::ConnectTimeout(address.to_string())),
        }
    }
}
