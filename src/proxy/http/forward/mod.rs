mod connection;
mod request;
mod response;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::Method;
use rustls::ClientConfig;
use tracing::debug;

use crate::proxy::headers::strip_response_hop_headers;
use crate::proxy::message::{ProxyRequest, ProxyResponse, ResponseBody, UpstreamInfo};
use crate::proxy::transport::Transport;
use crate::settings::{Settings, UpstreamTarget};
use crate::util::is_timeout;

use super::codec::{Http1ResponseHead, ResponseBodyPlan};
use super::upstream::{UpstreamConnection, UpstreamPool};

use connection::StaleConnection;
use response::determine_response_body_plan;

#[derive(Debug, Clone, Copy)]
pub struct ForwardTimeouts {
    pub connect: Duration,
    pub request_io: Duration,
    pub response_header: Duration,
    pub response_io: Duration,
}

impl ForwardTimeouts {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            connect: settings.upstream_connect_timeout(),
            request_io: settings.upstream_timeout(),
            response_header: settings.upstream_timeout(),
            response_io: settings.upstream_timeout(),
        }
    }
}

/// Plain HTTP/1.1 transport to the single upstream, with an idle connection pool.
pub struct HttpTransport {
    target: Arc<UpstreamTarget>,
    tls: Option<Arc<ClientConfig>>,
    pool: Arc<UpstreamPool>,
    timeouts: ForwardTimeouts,
    max_response_header_bytes: usize,
}

impl HttpTransport {
    pub fn new(
        target: Arc<UpstreamTarget>,
        tls: Option<Arc<ClientConfig>>,
        settings: &Settings,
    ) -> Self {
        Self {
            target,
            tls,
            pool: Arc::new(UpstreamPool::new(
                settings.upstream_max_idle,
                settings.upstream_idle_timeout(),
            )),
            timeouts: ForwardTimeouts::from_settings(settings),
            max_response_header_bytes: settings.max_response_header_size,
        }
    }

    async fn connect(&self) -> Result<UpstreamConnection> {
        UpstreamConnection::connect(&self.target, self.tls.as_ref(), self.timeouts.connect)
            .await
            .with_context(|| format!("connecting to upstream {}", self.target.authority))
    }

    async fn exchange(
        &self,
        connection: &mut UpstreamConnection,
        request_bytes: &[u8],
    ) -> Result<Http1ResponseHead> {
        connection::exchange(
            connection,
            request_bytes,
            self.timeouts.request_io,
            self.timeouts.response_header,
            self.max_response_header_bytes,
        )
        .await
    }

    async fn checkout(&self) -> Result<UpstreamConnection> {
        match self.pool.take() {
            Some(connection) => Ok(connection),
            None => self.connect().await,
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}

fn record_connect_error(err: &anyhow::Error) {
    let kind = if is_timeout(err) { "connect_timeout" } else { "connect" };
    crate::metrics::record_upstream_error(kind);
}

fn record_exchange_error(err: &anyhow::Error) {
    let kind = if is_timeout(err) { "timeout" } else { "response" };
    crate::metrics::record_upstream_error(kind);
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
        let request_bytes = request::build_upstream_request(request, &self.target.authority);

        let mut connection = self.checkout().await.inspect_err(record_connect_error)?;

        let head = match self.exchange(&mut connection, &request_bytes).await {
            Ok(head) => head,
            Err(err)
                if err.downcast_ref::<StaleConnection>().is_some()
                    && is_idempotent(&request.method) =>
            {
                debug!(error = %err, "retrying request on a fresh upstream connection");
                connection = self.connect().await.inspect_err(record_connect_error)?;
                self.exchange(&mut connection, &request_bytes)
                    .await
                    .inspect_err(record_exchange_error)?
            }
            Err(err) => {
                record_exchange_error(&err);
                return Err(err);
            }
        };

        let plan = determine_response_body_plan(&request.method, &head);
        let reusable = !head.connection_close && plan != ResponseBodyPlan::UntilClose;
        let upstream = UpstreamInfo {
            addr: connection.peer,
            reused: connection.reused,
        };

        let mut headers = head.headers;
        strip_response_hop_headers(&mut headers);

        let (body, body_len) = match plan {
            ResponseBodyPlan::Empty => {
                if reusable {
                    self.pool.put(connection);
                }
                (ResponseBody::Empty, Some(0))
            }
            ResponseBodyPlan::Fixed(length) => (
                ResponseBody::stream(response::spawn_body_relay(
                    connection,
                    plan,
                    self.timeouts.response_io,
                    reusable,
                    self.pool.clone(),
                )),
                Some(length),
            ),
            ResponseBodyPlan::Chunked | ResponseBodyPlan::UntilClose => (
                ResponseBody::stream(response::spawn_body_relay(
                    connection,
                    plan,
                    self.timeouts.response_io,
                    reusable,
                    self.pool.clone(),
                )),
                None,
            ),
        };

        debug!(
            status = head.status.as_u16(),
            upstream = %upstream.addr,
            reused = upstream.reused,
            ?plan,
            "upstream responded"
        );

        let mut response = ProxyResponse::new(head.status, headers, body).with_body_len(body_len);
        response.upstream = Some(upstream);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::http::upstream::UpstreamIo;
    use tokio::io::BufReader;
    use tokio::net::{TcpListener, TcpStream};

    fn upstream_error_count(kind: &str) -> u64 {
        let text = String::from_utf8(crate::metrics::gather()).unwrap();
        let prefix = format!("upstream_errors_total{{kind=\"{kind}\"}} ");
        text.lines()
            .find_map(|line| line.strip_prefix(prefix.as_str()))
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    fn transport_to(target: UpstreamTarget) -> HttpTransport {
        let io = Duration::from_secs(1);
        HttpTransport {
            target: Arc::new(target),
            tls: None,
            pool: Arc::new(UpstreamPool::new(4, Duration::from_secs(30))),
            timeouts: ForwardTimeouts {
                connect: io,
                request_io: io,
                response_header: io,
                response_io: io,
            },
            max_response_header_bytes: 4096,
        }
    }

    #[tokio::test]
    async fn failed_reconnect_after_stale_connection_is_counted() -> Result<()> {
        // Nothing listens on the target once this listener is gone.
        let gone = TcpListener::bind("127.0.0.1:0").await?;
        let gone_addr = gone.local_addr()?;
        drop(gone);
        let transport = transport_to(UpstreamTarget::parse(&format!("http://{gone_addr}/"))?);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let client = TcpStream::connect(addr).await?;
        let (server, _) = listener.accept().await?;
        drop(server);
        transport.pool.put(UpstreamConnection {
            reader: BufReader::new(UpstreamIo::Plain(client)),
            peer: addr,
            reused: false,
        });

        let before = upstream_error_count("connect");
        let err = transport
            .round_trip(&ProxyRequest::new(Method::GET, "/"))
            .await
            .err()
            .expect("reconnect to a closed port must fail");
        assert!(err.downcast_ref::<StaleConnection>().is_none(), "{err:#}");
        assert!(upstream_error_count("connect") > before);
        Ok(())
    }
}
