use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, Uri};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::debug;

use crate::util::timeout_with_context;

use super::headers::RequestHeaders;
use super::line::{read_line_with_deadline, remaining_deadline};

pub(crate) struct Http1RequestHead {
    pub method: Method,
    /// Path and query of the request target, as sent by the client.
    pub path: String,
    pub headers: RequestHeaders,
    pub header_bytes: usize,
}

/// Reads a request head. Returns `Ok(None)` when the connection is idle past
/// `idle_timeout` or closes before a request line arrives. The whole head must
/// arrive within `header_timeout` once the first byte is seen.
pub(crate) async fn read_http1_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<Http1RequestHead>>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(idle_timeout, reader.fill_buf()).await {
        Err(_) => return Ok(None),
        Ok(Ok([])) => return Ok(None),
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("waiting for request data from {peer}"));
        }
    }

    let deadline = Instant::now() + header_timeout;
    let Some((line, line_bytes)) =
        read_request_line(reader, peer, deadline, max_header_bytes).await?
    else {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    };
    let (method, path) = parse_request_line(&line)?;

    let budget = max_header_bytes.saturating_sub(line_bytes);
    ensure!(budget > 0, "request headers exceed configured limit");
    let mut headers = RequestHeaders::new(budget)?;
    let mut buf = String::new();
    loop {
        let read = read_line_with_deadline(reader, &mut buf, deadline, peer, budget).await?;
        ensure!(read > 0, "connection from {peer} closed during request headers");
        let more = headers
            .push_line(&buf)
            .with_context(|| format!("invalid header from {peer}"))?;
        if !more {
            break;
        }
    }

    let header_bytes = line_bytes + headers.total_bytes();
    Ok(Some(Http1RequestHead {
        method,
        path,
        headers,
        header_bytes,
    }))
}

/// Splits `METHOD target HTTP/1.1` into the method and the target's path and query.
fn parse_request_line(line: &str) -> Result<(Method, String)> {
    ensure!(!line.is_empty(), "empty request line");
    let parts: Vec<&str> = line.split_whitespace().collect();
    let [method, target, version] = parts.as_slice() else {
        bail!("malformed request line '{line}'");
    };
    match *version {
        "HTTP/1.1" => {}
        "HTTP/1.0" => bail!("HTTP/1.0 requests are not supported"),
        other => bail!("invalid HTTP version '{other}'"),
    }
    let method = Method::from_bytes(method.as_bytes())
        .with_context(|| format!("invalid method '{method}'"))?;
    Ok((method, request_target_path(target)?))
}

/// Reduces an origin-form or absolute-form target to its path and query.
pub(crate) fn request_target_path(target: &str) -> Result<String> {
    if target.starts_with('/') {
        return Ok(target.to_string());
    }
    let uri: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;
    ensure!(
        uri.scheme().is_some() && uri.authority().is_some(),
        "unsupported request target '{target}'"
    );
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| pq.starts_with('/'))
        .unwrap_or("/");
    Ok(path.to_string())
}

/// Reads the request line without its terminator, returning it with the raw byte count.
async fn read_request_line<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    deadline: Instant,
    max_len: usize,
) -> Result<Option<(String, usize)>>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "request line limit must be greater than zero");
    let context = format!("reading request line from {peer}");
    let mut raw = Vec::new();
    loop {
        let wait = remaining_deadline(deadline, &context)?;
        let available = timeout_with_context(wait, reader.fill_buf(), context.as_str()).await?;
        if available.is_empty() {
            if raw.is_empty() {
                return Ok(None);
            }
            bail!("connection closed while reading request line from {peer}");
        }

        let (take, done) = match available.iter().position(|byte| *byte == b'\n') {
            Some(idx) => (idx + 1, true),
            None => (available.len(), false),
        };
        if raw.len() + take > max_len {
            bail!("request line exceeds configured limit of {max_len} bytes for {peer}");
        }
        raw.extend_from_slice(&available[..take]);
        reader.consume(take);
        if done {
            break;
        }
    }

    let total = raw.len();
    let line = String::from_utf8(raw)
        .map_err(|_| anyhow!("request line from {peer} is not valid UTF-8"))?;
    Ok(Some((line.trim_end_matches(['\r', '\n']).to_string(), total)))
}
