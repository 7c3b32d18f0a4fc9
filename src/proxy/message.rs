use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio::io::AsyncRead;

/// A client request after parsing, as handed to a [`Transport`](super::transport::Transport).
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Path and query exactly as received; also the cache resource identifier.
    pub path: String,
    /// End-to-end headers to forward. Host and framing headers are set by the transport.
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

pub enum ResponseBody {
    Empty,
    Buffered(Bytes),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl ResponseBody {
    pub fn stream<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        ResponseBody::Stream(Box::new(reader))
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
    Bypass,
}

impl CacheLookup {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLookup::Hit => "hit",
            CacheLookup::Miss => "miss",
            CacheLookup::Bypass => "bypass",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamInfo {
    pub addr: SocketAddr,
    pub reused: bool,
}

#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    /// End-to-end response headers. `content-length` is kept when the
    /// upstream declared one; `transfer-encoding` never appears here.
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// Exact body length when known up front.
    pub body_len: Option<u64>,
    pub cache_lookup: CacheLookup,
    pub upstream: Option<UpstreamInfo>,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        let body_len = match &body {
            ResponseBody::Empty => Some(0),
            ResponseBody::Buffered(bytes) => Some(bytes.len() as u64),
            ResponseBody::Stream(_) => None,
        };
        Self {
            status,
            headers,
            body,
            body_len,
            cache_lookup: CacheLookup::Bypass,
            upstream: None,
        }
    }

    pub fn with_body_len(mut self, len: Option<u64>) -> Self {
        self.body_len = len;
        self
    }

    pub fn set_buffered_body(&mut self, body: Bytes) {
        self.body_len = Some(body.len() as u64);
        self.body = ResponseBody::Buffered(body);
    }
}
