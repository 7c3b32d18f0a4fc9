use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, warn};

use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;

use super::codec::read_http1_request_head;
use super::dispatch::{ClientDisposition, handle_request};
use super::respond::respond_with_access_log;

/// Serves requests on one client connection until it closes or a request
/// asks for `Connection: close`.
pub async fn handle_http<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let client_timeout = app.settings.client_timeout();
    let max_header_size = app.settings.max_request_header_size;
    let mut reader = BufReader::new(stream);

    loop {
        let start = Instant::now();
        let head = match read_http1_request_head(
            &mut reader,
            peer,
            client_timeout,
            client_timeout,
            max_header_size,
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                warn!(peer = %peer, error = %format!("{err:#}"), "rejecting malformed request");
                respond_with_access_log(
                    reader.get_mut(),
                    StatusCode::BAD_REQUEST,
                    b"bad request\r\n",
                    client_timeout,
                    0,
                    start.elapsed(),
                    AccessLogBuilder::new(peer)
                        .error_reason("bad_request")
                        .error_detail(format!("{err:#}")),
                )
                .await?;
                break;
            }
        };

        crate::metrics::inc_inflight();
        let disposition = handle_request(&mut reader, peer, &app, head, start).await;
        crate::metrics::dec_inflight();

        match disposition? {
            ClientDisposition::Continue => continue,
            ClientDisposition::Close => break,
        }
    }

    debug!(peer = %peer, "client connection finished");
    Ok(())
}
