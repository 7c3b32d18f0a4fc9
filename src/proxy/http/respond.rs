use std::time::Duration;

use anyhow::{Result, bail};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::io_util::write_all_with_timeout;
use crate::logging::AccessLogBuilder;
use crate::proxy::message::{ProxyResponse, ResponseBody};
use crate::util::timeout_with_context;

use super::codec::{ConnectionOverride, ResponseBodyPlan, encode_http1_response_head};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Writes a short plain-text error response, closes the stream and logs it.
#[allow(clippy::too_many_arguments)]
pub async fn respond_with_access_log<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
    bytes_in: u64,
    elapsed: Duration,
    log_builder: AccessLogBuilder,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes_out = send_response(stream, status, body, timeout_dur).await?;
    shutdown_stream(stream, timeout_dur).await?;
    log_builder
        .status(status)
        .bytes(bytes_in, bytes_out as u64)
        .elapsed(elapsed)
        .log();
    Ok(())
}

pub async fn send_response<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown"),
        body.len()
    );
    write_all_with_timeout(
        stream,
        header.as_bytes(),
        timeout_dur,
        "writing response header",
    )
    .await?;
    let mut written = header.len();
    if !body.is_empty() {
        write_all_with_timeout(stream, body, timeout_dur, "writing response body").await?;
        written += body.len();
    }
    Ok(written)
}

pub async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    timeout_with_context(
        timeout_dur,
        stream.shutdown(),
        "shutting down client stream",
    )
    .await
}

/// Client framing: no body where HTTP forbids one, `Content-Length` when the
/// length is known, chunked otherwise.
pub(crate) fn client_body_plan(method: &Method, response: &ProxyResponse) -> ResponseBodyPlan {
    let status = response.status;
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return ResponseBodyPlan::Empty;
    }
    match response.body_len {
        Some(length) => ResponseBodyPlan::Fixed(length),
        None => ResponseBodyPlan::Chunked,
    }
}

/// Writes `response` to the client and returns the number of bytes sent.
pub(crate) async fn write_proxy_response<S>(
    stream: &mut S,
    response: ProxyResponse,
    plan: ResponseBodyPlan,
    close: bool,
    timeout_dur: Duration,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
    let head = encode_http1_response_head(
        response.status,
        &response.headers,
        plan,
        close.then_some(ConnectionOverride::Close),
    );
    write_all_with_timeout(stream, &head, timeout_dur, "writing response head").await?;
    let body_bytes = match (plan, response.body) {
        (ResponseBodyPlan::Empty, _) | (_, ResponseBody::Empty) => 0,
        (ResponseBodyPlan::Chunked, ResponseBody::Buffered(bytes)) => {
            write_chunked(stream, &mut &bytes[..], timeout_dur).await?
        }
        (ResponseBodyPlan::Chunked, ResponseBody::Stream(mut reader)) => {
            write_chunked(stream, &mut reader, timeout_dur).await?
        }
        (_, ResponseBody::Buffered(bytes)) => {
            write_all_with_timeout(stream, &bytes, timeout_dur, "writing response body").await?;
            bytes.len() as u64
        }
        (_, ResponseBody::Stream(mut reader)) => {
            let copied = copy_body(stream, &mut reader, timeout_dur).await?;
            if let ResponseBodyPlan::Fixed(expected) = plan
                && copied != expected
            {
                bail!("response body ended after {copied} of {expected} bytes");
            }
            copied
        }
    };
    timeout_with_context(timeout_dur, stream.flush(), "flushing client stream").await?;
    Ok(head.len() as u64 + body_bytes)
}

async fn copy_body<S, R>(stream: &mut S, reader: &mut R, timeout_dur: Duration) -> Result<u64>
where
    S: AsyncWrite + Unpin,
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read =
            timeout_with_context(timeout_dur, reader.read(&mut buf), "reading response body")
                .await?;
        if read == 0 {
            return Ok(total);
        }
        write_all_with_timeout(stream, &buf[..read], timeout_dur, "writing response body").await?;
        total += read as u64;
    }
}

async fn write_chunked<S, R>(stream: &mut S, reader: &mut R, timeout_dur: Duration) -> Result<u64>
where
    S: AsyncWrite + Unpin,
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let read =
            timeout_with_context(timeout_dur, reader.read(&mut buf), "reading response body")
                .await?;
        if read == 0 {
            break;
        }
        let size_line = format!("{read:X}\r\n");
        write_all_with_timeout(stream, size_line.as_bytes(), timeout_dur, "writing chunk size")
            .await?;
        write_all_with_timeout(stream, &buf[..read], timeout_dur, "writing chunk data").await?;
        write_all_with_timeout(stream, b"\r\n", timeout_dur, "writing chunk terminator").await?;
        written += (size_line.len() + read + 2) as u64;
    }
    write_all_with_timeout(stream, b"0\r\n\r\n", timeout_dur, "writing last chunk").await?;
    Ok(written + 5)
}
