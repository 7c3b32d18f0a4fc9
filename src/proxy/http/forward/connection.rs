use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::io_util::write_all_with_timeout;
use crate::proxy::http::codec::Http1ResponseHead;
use crate::proxy::http::upstream::UpstreamConnection;
use crate::util::{TimedOut, timeout_with_context};

use super::response::read_final_response_head;

/// A pooled connection failed before the upstream sent a single response byte.
#[derive(Debug, Error)]
#[error("pooled upstream connection to {peer} was closed: {detail}")]
pub(crate) struct StaleConnection {
    pub peer: std::net::SocketAddr,
    pub detail: String,
}

/// Sends one request on `connection` and reads the final response head.
pub(super) async fn exchange(
    connection: &mut UpstreamConnection,
    request_bytes: &[u8],
    io_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Http1ResponseHead> {
    let peer = connection.peer;
    if let Err(err) = send_request(connection, request_bytes, io_timeout).await {
        if connection.reused && !crate::util::is_timeout(&err) {
            return Err(StaleConnection {
                peer,
                detail: format!("{err:#}"),
            }
            .into());
        }
        return Err(err);
    }

    // Wait for the first byte separately so a silently closed pooled
    // connection can be told apart from a broken response.
    match tokio::time::timeout(header_timeout, connection.reader.fill_buf()).await {
        Ok(Ok(available)) if available.is_empty() && connection.reused => {
            return Err(StaleConnection {
                peer,
                detail: "closed before response".to_string(),
            }
            .into());
        }
        Ok(Err(err)) if connection.reused => {
            return Err(StaleConnection {
                peer,
                detail: err.to_string(),
            }
            .into());
        }
        Ok(_) => {}
        Err(_) => return Err(TimedOut::new(format!("waiting for response from {peer}")).into()),
    }

    read_final_response_head(&mut connection.reader, header_timeout, peer, max_header_bytes).await
}

async fn send_request(
    connection: &mut UpstreamConnection,
    request_bytes: &[u8],
    io_timeout: Duration,
) -> Result<()> {
    let stream = connection.reader.get_mut();
    write_all_with_timeout(stream, request_bytes, io_timeout, "sending request to upstream").await?;
    timeout_with_context(io_timeout, stream.flush(), "flushing upstream stream").await
}
