use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, warn};

use crate::io_util::write_all_with_timeout;
use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;
use crate::proxy::forward_error::{classify_forward_error, log_forward_error};
use crate::proxy::message::ProxyRequest;

use super::body::{BodyPlan, read_request_body};
use super::codec::Http1RequestHead;
use super::respond::{
    client_body_plan, respond_with_access_log, shutdown_stream, write_proxy_response,
};

pub(super) enum ClientDisposition {
    Continue,
    Close,
}

fn request_body_plan(head: &Http1RequestHead) -> BodyPlan {
    if head.headers.is_chunked() {
        return BodyPlan::Chunked;
    }
    match head.headers.content_length() {
        None | Some(0) => BodyPlan::Empty,
        Some(length) => BodyPlan::Fixed(length),
    }
}

/// Runs one request through the transport and response hook and answers the client.
pub(super) async fn handle_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    head: Http1RequestHead,
    start: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_timeout = app.settings.client_timeout();
    let max_body = app.settings.max_request_body_size;
    let mut bytes_in = head.header_bytes as u64;
    let log = AccessLogBuilder::new(peer)
        .method(head.method.as_str())
        .host(head.headers.host().unwrap_or(""))
        .path(head.path.clone());

    let expect_continue = match head.headers.expect_continue() {
        Ok(value) => value,
        Err(err) => {
            warn!(peer = %peer, error = %err, "unsupported Expect header");
            respond_with_access_log(
                reader.get_mut(),
                StatusCode::EXPECTATION_FAILED,
                b"expectation failed\r\n",
                client_timeout,
                bytes_in,
                start.elapsed(),
                log.error_reason("expectation_failed"),
            )
            .await?;
            return Ok(ClientDisposition::Close);
        }
    };

    let body_plan = request_body_plan(&head);
    if let BodyPlan::Fixed(length) = body_plan
        && length > max_body
    {
        warn!(peer = %peer, length, max = max_body, "request body exceeds limit");
        respond_with_access_log(
            reader.get_mut(),
            StatusCode::PAYLOAD_TOO_LARGE,
            b"request body exceeds configured limit\r\n",
            client_timeout,
            bytes_in,
            start.elapsed(),
            log.error_reason("body_too_large"),
        )
        .await?;
        return Ok(ClientDisposition::Close);
    }

    if expect_continue && body_plan != BodyPlan::Empty {
        write_all_with_timeout(
            reader.get_mut(),
            b"HTTP/1.1 100 Continue\r\n\r\n",
            client_timeout,
            "writing 100 Continue",
        )
        .await?;
    }

    let mut request = ProxyRequest::new(head.method.clone(), head.path.clone());
    request.headers = head.headers.forward_header_map();
    request.body = match read_request_body(reader, body_plan, client_timeout, peer, max_body).await
    {
        Ok(body) => body,
        Err(err) => {
            let kind = classify_forward_error(&err);
            log_forward_error(&kind, peer, &request.path, &err);
            respond_with_access_log(
                reader.get_mut(),
                kind.status(),
                format!("{}\r\n", kind.reason()).as_bytes(),
                client_timeout,
                bytes_in,
                start.elapsed(),
                log.error_reason(kind.reason())
                    .error_detail(format!("{err:#}")),
            )
            .await?;
            return Ok(ClientDisposition::Close);
        }
    };
    bytes_in += request.body.len() as u64;

    let outcome = match app.transport.round_trip(&request).await {
        Ok(mut response) => match app.modifier.modify_response(&request, &mut response).await {
            Ok(stored) => Ok((response, stored)),
            Err(err) => Err((err, Some(response.cache_lookup))),
        },
        Err(err) => Err((err, None)),
    };

    let (response, stored) = match outcome {
        Ok(pair) => pair,
        Err((err, cache_lookup)) => {
            let kind = classify_forward_error(&err);
            log_forward_error(&kind, peer, &request.path, &err);
            let mut log = log
                .error_reason(kind.reason())
                .error_detail(format!("{err:#}"));
            if let Some(lookup) = cache_lookup {
                log = log.cache_lookup(lookup.as_str()).cache_store("failed");
            }
            respond_with_access_log(
                reader.get_mut(),
                kind.status(),
                format!("{}\r\n", kind.reason()).as_bytes(),
                client_timeout,
                bytes_in,
                start.elapsed(),
                log,
            )
            .await?;
            return Ok(ClientDisposition::Close);
        }
    };

    let close = head.headers.wants_connection_close();
    let status = response.status;
    let mut log = log
        .status(status)
        .cache_lookup(response.cache_lookup.as_str())
        .cache_store(stored.as_str());
    if let Some(upstream) = response.upstream {
        log = log.upstream(upstream.addr, upstream.reused);
    }
    let plan = client_body_plan(&request.method, &response);
    let written =
        write_proxy_response(reader.get_mut(), response, plan, close, client_timeout).await;

    match written {
        Ok(bytes_out) => {
            log.bytes(bytes_in, bytes_out).elapsed(start.elapsed()).log();
            if close {
                shutdown_stream(reader.get_mut(), client_timeout).await?;
                return Ok(ClientDisposition::Close);
            }
            Ok(ClientDisposition::Continue)
        }
        Err(err) => {
            // Head already sent; closing is the only remaining signal.
            debug!(peer = %peer, error = %format!("{err:#}"), "response aborted mid-body");
            log.bytes(bytes_in, 0)
                .elapsed(start.elapsed())
                .error_reason("response_aborted")
                .error_detail(format!("{err:#}"))
                .log();
            Ok(ClientDisposition::Close)
        }
    }
}
