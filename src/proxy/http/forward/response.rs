use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, BufReader};
use tracing::{debug, trace};

use crate::proxy::http::body::{
    BodySink, ChannelBody, body_channel, decode_chunked_body, read_fixed_body, read_until_close,
};
use crate::proxy::http::codec::{Http1ResponseHead, ResponseBodyPlan, read_http1_response_head};
use crate::proxy::http::upstream::{UpstreamConnection, UpstreamPool};

const RELAY_CHANNEL_CAPACITY: usize = 16;

/// Reads response heads until a final (non-1xx) one arrives. Interim
/// responses are dropped because the request body was sent up front.
pub(super) async fn read_final_response_head<S>(
    upstream_reader: &mut BufReader<S>,
    header_timeout: Duration,
    upstream_peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Http1ResponseHead>
where
    S: AsyncRead + Unpin,
{
    loop {
        let head = read_http1_response_head(
            upstream_reader,
            header_timeout,
            upstream_peer,
            max_header_bytes,
        )
        .await?;

        if head.status == StatusCode::SWITCHING_PROTOCOLS {
            bail!("upstream attempted protocol upgrade (101 Switching Protocols)");
        }

        if head.status.is_informational() {
            if head.chunked || head.content_length.is_some_and(|length| length > 0) {
                bail!("informational response must not include a body");
            }
            trace!(status = head.status.as_u16(), "skipping interim upstream response");
            continue;
        }

        return Ok(head);
    }
}

pub(crate) fn determine_response_body_plan(
    method: &Method,
    head: &Http1ResponseHead,
) -> ResponseBodyPlan {
    if method == Method::HEAD
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::RESET_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return ResponseBodyPlan::Empty;
    }

    if head.chunked {
        return ResponseBodyPlan::Chunked;
    }

    match head.content_length {
        Some(0) => ResponseBodyPlan::Empty,
        Some(length) => ResponseBodyPlan::Fixed(length),
        None => ResponseBodyPlan::UntilClose,
    }
}

/// Decodes the body on a background task and returns the reading end.
/// The connection goes back to `pool` only after a complete, reusable body.
pub(super) fn spawn_body_relay(
    mut connection: UpstreamConnection,
    plan: ResponseBodyPlan,
    read_timeout: Duration,
    reusable: bool,
    pool: Arc<UpstreamPool>,
) -> ChannelBody {
    let (mut sink, body) = body_channel(RELAY_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let peer = connection.peer;
        let result = relay(&mut connection.reader, &mut sink, plan, read_timeout, peer).await;
        match result {
            Ok(bytes) => {
                trace!(peer = %peer, bytes, "upstream body complete");
                if reusable {
                    pool.put(connection);
                }
            }
            Err(err) => {
                debug!(peer = %peer, error = %format!("{err:#}"), "upstream body relay failed");
                crate::metrics::record_upstream_error("body");
                sink.fail(&err).await;
            }
        }
    });
    body
}

async fn relay<S, K>(
    reader: &mut BufReader<S>,
    sink: &mut K,
    plan: ResponseBodyPlan,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin + Send,
    K: BodySink + ?Sized,
{
    match plan {
        ResponseBodyPlan::Empty => Ok(0),
        ResponseBodyPlan::Fixed(length) => {
            read_fixed_body(reader, sink, length, read_timeout, peer).await
        }
        ResponseBodyPlan::Chunked => {
            decode_chunked_body(reader, sink, read_timeout, peer, None).await
        }
        ResponseBodyPlan::UntilClose => read_until_close(reader, sink, read_timeout, peer).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;
    use tokio::io::{AsyncWriteExt, duplex};

    fn head_with_status(status: StatusCode) -> Http1ResponseHead {
        Http1ResponseHead {
            status,
            headers: HeaderMap::new(),
            content_length: None,
            chunked: false,
            connection_close: false,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[test]
    fn body_plan_respects_status_and_method() {
        let mut head = head_with_status(StatusCode::OK);
        head.content_length = Some(10);
        assert_eq!(
            determine_response_body_plan(&Method::HEAD, &head),
            ResponseBodyPlan::Empty
        );
        assert_eq!(
            determine_response_body_plan(&Method::GET, &head),
            ResponseBodyPlan::Fixed(10)
        );

        let head = head_with_status(StatusCode::NOT_MODIFIED);
        assert_eq!(
            determine_response_body_plan(&Method::GET, &head),
            ResponseBodyPlan::Empty
        );

        let head = head_with_status(StatusCode::OK);
        assert_eq!(
            determine_response_body_plan(&Method::GET, &head),
            ResponseBodyPlan::UntilClose
        );

        let mut head = head_with_status(StatusCode::OK);
        head.chunked = true;
        assert_eq!(
            determine_response_body_plan(&Method::GET, &head),
            ResponseBodyPlan::Chunked
        );
    }

    #[tokio::test]
    async fn final_head_skips_interim_responses() -> anyhow::Result<()> {
        let (upstream_stream, mut upstream_writer) = duplex(256);
        upstream_writer
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 103 Early Hints\r\nLink: </a.css>\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await?;
        drop(upstream_writer);

        let mut reader = BufReader::new(upstream_stream);
        let head =
            read_final_response_head(&mut reader, Duration::from_secs(1), peer(), 256).await?;
        assert_eq!(head.status, StatusCode::OK);
        assert!(head.headers.get("link").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn final_head_rejects_switching_protocols() -> anyhow::Result<()> {
        let (mut upstream_writer, upstream_stream) = duplex(256);
        upstream_writer
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
            )
            .await?;
        drop(upstream_writer);

        let mut reader = BufReader::new(upstream_stream);
        let err = read_final_response_head(&mut reader, Duration::from_secs(1), peer(), 256)
            .await
            .err()
            .expect("switching protocols must be rejected");
        assert!(err.to_string().contains("Switching Protocols"));
        Ok(())
    }

    #[tokio::test]
    async fn final_head_rejects_informational_with_body() -> anyhow::Result<()> {
        let (mut upstream_writer, upstream_stream) = duplex(256);
        upstream_writer
            .write_all(b"HTTP/1.1 100 Continue\r\nContent-Length: 5\r\n\r\n")
            .await?;
        drop(upstream_writer);

        let mut reader = BufReader::new(upstream_stream);
        let err = read_final_response_head(&mut reader, Duration::from_secs(1), peer(), 256)
            .await
            .err()
            .expect("interim response with a body must be rejected");
        assert!(
            err.to_string()
                .contains("informational response must not include a body")
        );
        Ok(())
    }
}
