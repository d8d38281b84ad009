//! Plain HTTP responses and raw ownership of the client socket

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::request::{read_request, InboundRequest, RequestError};

/// A client socket the bridge can take over
pub trait ClientIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ClientIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

#[derive(Debug, Error)]
pub enum HijackError {
    #[error("HTTP hijacking not supported")]
    Unsupported,

    #[error("Connection already hijacked")]
    AlreadyHijacked,
}

/// The raw client connection after a hijack
pub struct Hijacked {
    pub io: Box<dyn ClientIo>,
    /// Bytes the client sent that were read but not consumed by the request
    pub buffered: Bytes,
}

impl std::fmt::Debug for Hijacked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hijacked")
            .field("buffered", &self.buffered.len())
            .finish()
    }
}

/// Where the bridge writes its answer to one request
#[async_trait]
pub trait ResponseWriter: Send {
    /// Send a complete `text/plain` response
    async fn write_response(&mut self, status: StatusCode, body: &str) -> std::io::Result<()>;

    /// Take the client socket; no response can be written afterwards
    fn hijack(&mut self) -> Result<Hijacked, HijackError>;
}

/// A complete `text/plain` response that closes the connection
pub fn plain_response(status: StatusCode, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    )
    .into_bytes()
}

/// A client socket read by hand, one request per connection
pub struct RawConnection<IO> {
    io: Option<IO>,
    buffer: BytesMut,
}

impl<IO: ClientIo> RawConnection<IO> {
    pub fn new(io: IO) -> Self {
        Self {
            io: Some(io),
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    pub async fn read_request(&mut self) -> Result<Option<InboundRequest>, RequestError> {
        let io = self.io.as_mut().ok_or(RequestError::Incomplete)?;
        read_request(io, &mut self.buffer).await
    }
}

#[async_trait]
impl<IO: ClientIo> ResponseWriter for RawConnection<IO> {
    async fn write_response(&mut self, status: StatusCode, body: &str) -> std::io::Result<()> {
        let io = self.io.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "connection hijacked")
        })?;
        io.write_all(&plain_response(status, body)).await?;
        io.flush().await?;
        io.shutdown().await
    }

    fn hijack(&mut self) -> Result<Hijacked, HijackError> {
        let io = self.io.take().ok_or(HijackError::AlreadyHijacked)?;
        Ok(Hijacked {
            io: Box::new(io),
            buffered: self.buffer.split().freeze(),
        })
    }
}
