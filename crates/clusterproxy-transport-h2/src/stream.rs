//! Packet streams carried on a single HTTP/2 request/response pair
//!
//! The request body flows agent -> hub, the response body hub -> agent.
//! Both directions carry `PacketCodec` frames; DATA frame boundaries do not
//! line up with packet boundaries, so the source reassembles.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use clusterproxy_proto::{Packet, PacketCodec};
use clusterproxy_transport::{PacketSink, PacketSource, TransportError, TransportResult};
use h2::{RecvStream, SendStream};
use std::future::poll_fn;
use tracing::trace;

/// Writing half of a tunnel call
pub struct H2PacketSink {
    send: SendStream<Bytes>,
    stream_id: u32,
    finished: bool,
}

impl std::fmt::Debug for H2PacketSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2PacketSink")
            .field("stream_id", &self.stream_id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl H2PacketSink {
    pub(crate) fn new(send: SendStream<Bytes>, stream_id: u32) -> Self {
        Self {
            send,
            stream_id,
            finished: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    async fn send_bytes(&mut self, mut frame: Bytes) -> TransportResult<()> {
        while !frame.is_empty() {
            self.send.reserve_capacity(frame.len());

            while self.send.capacity() == 0 {
                match poll_fn(|cx| self.send.poll_capacity(cx)).await {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(TransportError::ConnectionError(format!(
                            "H2 capacity error: {}",
                            e
                        )))
                    }
                    None => return Err(TransportError::Closed),
                }
            }

            let n = self.send.capacity().min(frame.len());
            let chunk = frame.split_to(n);
            self.send.send_data(chunk, false).map_err(|e| {
                TransportError::ConnectionError(format!("H2 send error: {}", e))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl PacketSink for H2PacketSink {
    async fn send_packet(&mut self, packet: Packet) -> TransportResult<()> {
        if self.finished {
            return Err(TransportError::Closed);
        }

        let frame = PacketCodec::encode_frame(&packet)?;
        trace!(
            stream_id = self.stream_id,
            conn_id = packet.conn_id,
            len = frame.len(),
            "Sending packet"
        );
        self.send_bytes(frame).await
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.send
            .send_data(Bytes::new(), true)
            .map_err(|e| TransportError::ConnectionError(format!("H2 finish error: {}", e)))
    }
}

/// Reading half of a tunnel call
pub struct H2PacketSource {
    recv: RecvStream,
    buffer: BytesMut,
    stream_id: u32,
}

impl std::fmt::Debug for H2PacketSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2PacketSource")
            .field("stream_id", &self.stream_id)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl H2PacketSource {
    pub(crate) fn new(recv: RecvStream, stream_id: u32) -> Self {
        Self {
            recv,
            buffer: BytesMut::with_capacity(8 * 1024),
            stream_id,
        }
    }
}

#[async_trait]
impl PacketSource for H2PacketSource {
    async fn recv_packet(&mut self) -> TransportResult<Option<Packet>> {
        loop {
            if let Some(packet) = PacketCodec::decode_frame(&mut self.buffer)? {
                return Ok(Some(packet));
            }

            match self.recv.data().await {
                Some(Ok(data)) => {
                    // Hand the window back right away; backpressure lives in
                    // the per-connection queues above this layer.
                    let _ = self.recv.flow_control().release_capacity(data.len());
                    self.buffer.extend_from_slice(&data);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ConnectionError(format!(
                        "H2 receive error on stream {}: {}",
                        self.stream_id, e
                    )))
                }
                None if self.buffer.is_empty() => return Ok(None),
                None => {
                    return Err(TransportError::ProtocolError(format!(
                        "Stream ended with {} bytes of a partial packet",
                        self.buffer.len()
                    )))
                }
            }
        }
    }
}
