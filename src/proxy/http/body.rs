use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tokio::sync::mpsc;

use crate::{
    proxy::{forward_limits::BodySizeTracker, http::codec::read_line_with_timeout},
    util::timeout_with_context,
};

const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
#[error("request body exceeds configured limit")]
pub struct BodyTooLarge {
    pub bytes_read: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(usize),
    Chunked,
}

/// Destination for decoded body bytes.
#[async_trait]
pub(crate) trait BodySink: Send {
    async fn push(&mut self, chunk: &[u8]) -> Result<()>;
}

#[async_trait]
impl BodySink for Vec<u8> {
    async fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

/// Sends decoded chunks to a [`ChannelBody`].
pub(crate) struct ChannelSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl ChannelSink {
    pub(crate) async fn fail(&self, err: &anyhow::Error) {
        let _ = self
            .tx
            .send(Err(io::Error::other(format!("{err:#}"))))
            .await;
    }
}

#[async_trait]
impl BodySink for ChannelSink {
    async fn push(&mut self, chunk: &[u8]) -> Result<()> {
        if self
            .tx
            .send(Ok(Bytes::copy_from_slice(chunk)))
            .await
            .is_err()
        {
            bail!("response body receiver dropped");
        }
        Ok(())
    }
}

/// Reader side of a body relayed by a background task. A relay failure
/// surfaces as a read error instead of a short body.
pub struct ChannelBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

pub(crate) fn body_channel(capacity: usize) -> (ChannelSink, ChannelBody) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ChannelSink { tx },
        ChannelBody {
            rx,
            current: Bytes::new(),
        },
    )
}

impl AsyncRead for ChannelBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.current.is_empty() {
                let take = self.current.len().min(buf.remaining());
                let chunk = self.current.split_to(take);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.current = chunk,
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Reads a client request body into memory, enforcing `max_body_size`.
pub async fn read_request_body<S>(
    reader: &mut BufReader<S>,
    plan: BodyPlan,
    client_timeout: Duration,
    peer: SocketAddr,
    max_body_size: usize,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin + Send,
{
    let mut body = Vec::new();
    match plan {
        BodyPlan::Empty => {}
        BodyPlan::Fixed(length) => {
            let mut tracker = BodySizeTracker::new(max_body_size);
            tracker.record(length)?;
            read_fixed_body(reader, &mut body, length as u64, client_timeout, peer).await?;
        }
        BodyPlan::Chunked => {
            let mut tracker = BodySizeTracker::new(max_body_size);
            decode_chunked_body(reader, &mut body, client_timeout, peer, Some(&mut tracker))
                .await?;
        }
    }
    Ok(Bytes::from(body))
}

pub(crate) async fn read_fixed_body<S, K>(
    reader: &mut BufReader<S>,
    sink: &mut K,
    mut remaining: u64,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin + Send,
    K: BodySink + ?Sized,
{
    let mut transferred = 0u64;
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let read = timeout_with_context(
            read_timeout,
            reader.read(&mut buffer[..to_read]),
            format!("reading body from {peer}"),
        )
        .await?;
        if read == 0 {
            bail!("connection from {peer} closed before the body was complete");
        }
        remaining -= read as u64;
        sink.push(&buffer[..read]).await?;
        transferred = transferred.saturating_add(read as u64);
    }
    Ok(transferred)
}

/// Decodes a chunked body, passing only payload bytes to `sink`. Trailers are discarded.
pub(crate) async fn decode_chunked_body<S, K>(
    reader: &mut BufReader<S>,
    sink: &mut K,
    read_timeout: Duration,
    peer: SocketAddr,
    mut limit: Option<&mut BodySizeTracker>,
) -> Result<u64>
where
    S: AsyncRead + Unpin + Send,
    K: BodySink + ?Sized,
{
    let mut payload_bytes = 0u64;
    let mut line = String::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        line.clear();
        let size_bytes =
            read_line_with_timeout(reader, &mut line, read_timeout, peer, MAX_CHUNK_LINE_LENGTH)
                .await?;
        if size_bytes == 0 {
            bail!("unexpected EOF while reading chunk size from {peer}");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed)
            .trim();
        let chunk_size = usize::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;

        if let Some(limit_tracker) = limit.as_deref_mut() {
            limit_tracker.record(chunk_size)?;
        }

        if chunk_size == 0 {
            loop {
                line.clear();
                let trailer_bytes = read_line_with_timeout(
                    reader,
                    &mut line,
                    read_timeout,
                    peer,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if trailer_bytes == 0 {
                    bail!("unexpected EOF while reading chunk trailer from {peer}");
                }
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            break;
        }

        let mut remaining = chunk_size;
        while remaining > 0 {
            let to_read = remaining.min(buffer.len());
            let read = timeout_with_context(
                read_timeout,
                reader.read(&mut buffer[..to_read]),
                format!("reading chunk data from {peer}"),
            )
            .await?;
            if read == 0 {
                bail!("unexpected EOF while reading chunk data from {peer}");
            }
            remaining -= read;
            sink.push(&buffer[..read]).await?;
            payload_bytes = payload_bytes.saturating_add(read as u64);
        }

        let mut crlf = [0u8; 2];
        timeout_with_context(
            read_timeout,
            reader.read_exact(&mut crlf),
            format!("reading chunk terminator from {peer}"),
        )
        .await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator when reading from {peer}");
        }
    }

    Ok(payload_bytes)
}

pub(crate) async fn read_until_close<S, K>(
    reader: &mut BufReader<S>,
    sink: &mut K,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin + Send,
    K: BodySink + ?Sized,
{
    let mut total = 0u64;
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        let read = timeout_with_context(
            read_timeout,
            reader.read(&mut buffer),
            format!("reading body from {peer}"),
        )
        .await?;
        if read == 0 {
            break;
        }
        sink.push(&buffer[..read]).await?;
        total = total.saturating_add(read as u64);
    }
    Ok(total)
}
