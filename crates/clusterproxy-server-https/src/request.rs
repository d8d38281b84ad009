//! Reading an HTTP/1.x request head off a raw client socket and writing it
//! back out for the agent.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 100;

/// Request line plus headers may not exceed this
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Bodies up to this size are read before the request is forwarded; larger
/// ones follow the head as raw bytes once forwarding starts.
pub const MAX_BUFFERED_BODY: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Connection closed before the request was complete")]
    Incomplete,

    #[error("Timed out after {0:?} waiting for the request head")]
    Timeout(std::time::Duration),
}

/// A parsed inbound request. Header names and values are kept as sent.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    /// Request target exactly as it appeared on the request line
    pub target: String,
    /// Minor version: `0` for HTTP/1.0, `1` for HTTP/1.1
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn uri(&self) -> Option<http::Uri> {
        self.target.parse().ok()
    }

    /// Path component of the target, without the query string
    pub fn path(&self) -> String {
        match self.uri() {
            Some(uri) => uri.path().to_string(),
            None => self
                .target
                .split('?')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn host(&self) -> Option<String> {
        self.header_str("host")
            .map(|h| h.trim().to_string())
            .or_else(|| self.uri()?.authority().map(|a| a.to_string()))
    }

    pub fn content_length(&self) -> Result<Option<usize>, RequestError> {
        match self.header_str("content-length") {
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| RequestError::Malformed(format!("invalid Content-Length {:?}", value))),
            None => Ok(None),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.header_str("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    fn expects_continue(&self) -> bool {
        self.header_str("expect")
            .map(|v| v.trim().eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
    }

    /// Serialize request line, headers and buffered body.
    ///
    /// The HTTP version is written back unchanged; upgrade handshakes
    /// (SPDY, websockets) break if it is normalized.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());

        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );

        if self.header("host").is_none() {
            if let Some(host) = self.host() {
                out.extend_from_slice(format!("Host: {}\r\n", host).as_bytes());
            }
        }

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(InboundRequest, usize)>, RequestError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let request = InboundRequest {
                method: req.method.unwrap_or_default().to_string(),
                target: req.path.unwrap_or_default().to_string(),
                version: req.version.unwrap_or(1),
                headers: req
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), h.value.to_vec()))
                    .collect(),
                body: Bytes::new(),
            };
            Ok(Some((request, head_len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(RequestError::Malformed(e.to_string())),
    }
}

/// Read one request from `io`.
///
/// Bytes read past the request stay in `buf`. Returns `Ok(None)` if the
/// client closed the connection without sending anything.
pub async fn read_request<R>(
    io: &mut R,
    buf: &mut BytesMut,
) -> Result<Option<InboundRequest>, RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut request = loop {
        if !buf.is_empty() {
            if let Some((request, head_len)) = parse_head(buf)? {
                buf.advance(head_len);
                break request;
            }
            if buf.len() >= MAX_HEAD_SIZE {
                return Err(RequestError::HeadTooLarge(MAX_HEAD_SIZE));
            }
        }

        if io.read_buf(buf).await? == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(RequestError::Incomplete)
            };
        }
    };

    trace!(method = %request.method, target = %request.target, "Parsed request head");

    // Chunked or 100-continue bodies, and large ones, are streamed raw
    if request.is_chunked() || request.expects_continue() {
        return Ok(Some(request));
    }
    match request.content_length()? {
        Some(len) if len > 0 && len <= MAX_BUFFERED_BODY => {
            while buf.len() < len {
                if io.read_buf(buf).await? == 0 {
                    return Err(RequestError::Incomplete);
                }
            }
            request.body = buf.split_to(len).freeze();
        }
        _ => {}
    }

    Ok(Some(request))
}
