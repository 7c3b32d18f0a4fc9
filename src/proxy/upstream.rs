use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, ensure};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::util::{TimedOut, timeout_with_context};

/// Resolves the upstream host. Literal IPs skip the resolver.
pub async fn resolve_upstream(
    host: &str,
    port: u16,
    resolve_timeout: Duration,
) -> Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let addrs: Vec<SocketAddr> = timeout_with_context(
        resolve_timeout,
        tokio::net::lookup_host((host, port)),
        format!("resolving upstream {host}:{port}"),
    )
    .await?
    .collect();
    ensure!(!addrs.is_empty(), "upstream {host}:{port} resolved to no addresses");
    Ok(addrs)
}

/// Tries each address in order and returns the first stream that connects.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on upstream stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to upstream");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err =
                    Some(anyhow::Error::new(err).context(format!("failed to connect to {addr}")));
            }
            Err(_) => {
                last_err = Some(TimedOut::new(format!("connecting to {addr}")).into());
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses provided for upstream connect")))
}
