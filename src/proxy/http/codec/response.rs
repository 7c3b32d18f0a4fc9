use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version, header};
use tokio::io::{AsyncRead, BufReader};
use tracing::warn;

use crate::proxy::forward_limits::HeaderBudget;
use crate::proxy::headers::is_hop_by_hop;

use super::line::read_line_with_timeout;

/// How a response body is delimited on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseBodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionOverride {
    Close,
}

impl ConnectionOverride {
    pub fn as_str(&self) -> &str {
        match self {
            ConnectionOverride::Close => "close",
        }
    }
}

/// A parsed upstream response head. Framing headers stay in `headers`; their
/// meaning is also extracted into the typed fields.
pub(crate) struct Http1ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
}

/// Encodes a response head for the client. Framing headers are derived from
/// `body_plan`; any framing or hop-by-hop header in `headers` is dropped.
pub(crate) fn encode_http1_response_head(
    status: StatusCode,
    headers: &HeaderMap,
    body_plan: ResponseBodyPlan,
    override_connection: Option<ConnectionOverride>,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(b"HTTP/1.1 ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for (name, value) in headers.iter() {
        if name == header::CONTENT_LENGTH || is_hop_by_hop(name.as_str()) {
            continue;
        }
        push_header(&mut buffer, name.as_str(), value.as_bytes());
    }

    match body_plan {
        ResponseBodyPlan::Chunked => push_header(&mut buffer, "Transfer-Encoding", b"chunked"),
        ResponseBodyPlan::Fixed(length) => {
            push_header(&mut buffer, "Content-Length", length.to_string().as_bytes())
        }
        ResponseBodyPlan::Empty => {
            if let Some(value) = headers.get(header::CONTENT_LENGTH) {
                push_header(&mut buffer, "Content-Length", value.as_bytes());
            }
        }
        ResponseBodyPlan::UntilClose => {}
    }

    if let Some(connection) = override_connection {
        push_header(&mut buffer, "Connection", connection.as_str().as_bytes());
    }

    buffer.extend_from_slice(b"\r\n");
    buffer
}

fn push_header(buffer: &mut Vec<u8>, name: &str, value: &[u8]) {
    buffer.extend_from_slice(name.as_bytes());
    buffer.extend_from_slice(b": ");
    buffer.extend_from_slice(value);
    buffer.extend_from_slice(b"\r\n");
}

pub(crate) async fn read_http1_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Http1ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut budget = HeaderBudget::new(
        max_header_bytes,
        "upstream response headers exceed configured limit",
    )?;
    let mut line = String::new();

    let read =
        read_line_with_timeout(reader, &mut line, timeout_dur, peer, max_header_bytes).await?;
    ensure!(read > 0, "upstream closed connection before sending status line");
    budget.record(read)?;
    let (version, status) = parse_http1_status_line(line.trim_end_matches(['\r', '\n']))?;

    let mut head = Http1ResponseHead {
        status,
        headers: HeaderMap::new(),
        content_length: None,
        chunked: false,
        connection_close: version == Version::HTTP_10,
    };
    let mut transfer_coded = false;

    loop {
        let read =
            read_line_with_timeout(reader, &mut line, timeout_dur, peer, max_header_bytes).await?;
        ensure!(read > 0, "upstream closed connection during headers");
        budget.record(read)?;
        let text = line.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            break;
        }
        let (name, value) = text
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from upstream"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .with_context(|| format!("invalid upstream header name '{}'", name.trim()))?;
        let value = value.trim();

        if name == header::TRANSFER_ENCODING {
            transfer_coded = true;
        }
        apply_framing(&mut head, &name, value, version)?;
        let value = HeaderValue::from_bytes(value.as_bytes())
            .with_context(|| format!("invalid upstream header value for '{name}'"))?;
        head.headers.append(name, value);
    }

    if transfer_coded && head.content_length.is_some() {
        warn!(peer = %peer, "upstream sent both Transfer-Encoding and Content-Length");
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }
    if transfer_coded && !head.chunked {
        // Any other transfer coding is delimited by connection close.
        head.connection_close = true;
    }
    Ok(head)
}

/// Records what a framing or connection header means for body delimitation.
fn apply_framing(
    head: &mut Http1ResponseHead,
    name: &HeaderName,
    value: &str,
    version: Version,
) -> Result<()> {
    if *name == header::CONTENT_LENGTH {
        ensure!(
            head.content_length.is_none(),
            "multiple Content-Length headers from upstream are not supported"
        );
        let length = value
            .parse()
            .with_context(|| format!("invalid Content-Length value '{value}'"))?;
        head.content_length = Some(length);
    } else if *name == header::TRANSFER_ENCODING {
        // Chunked only counts as the final coding.
        head.chunked = value
            .rsplit(',')
            .next()
            .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
    } else if *name == header::CONNECTION {
        for token in value.split(',').map(str::trim) {
            if token.eq_ignore_ascii_case("close") {
                head.connection_close = true;
            } else if token.eq_ignore_ascii_case("keep-alive") && version == Version::HTTP_10 {
                head.connection_close = false;
            }
        }
    }
    Ok(())
}

pub(crate) fn parse_http1_status_line(value: &str) -> Result<(Version, StatusCode)> {
    let mut parts = value.splitn(3, ' ').filter(|part| !part.is_empty());
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        Some(other) => bail!("unsupported upstream HTTP version '{other}'"),
        None => bail!("upstream status line missing HTTP version"),
    };
    let code = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| anyhow!("invalid upstream status code '{code}'"))?;
    Ok((version, status))
}
