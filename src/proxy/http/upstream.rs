use std::collections::VecDeque;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use parking_lot::Mutex;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::proxy::upstream::{connect_to_addrs, resolve_upstream};
use crate::settings::{Scheme, UpstreamTarget};
use crate::util::timeout_with_context;

pub(crate) enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

pub(crate) struct UpstreamConnection {
    pub(crate) reader: BufReader<UpstreamIo>,
    pub(crate) peer: SocketAddr,
    /// True when this connection came out of the idle pool.
    pub(crate) reused: bool,
}

impl UpstreamConnection {
    pub(crate) async fn connect(
        target: &UpstreamTarget,
        tls: Option<&Arc<ClientConfig>>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let addresses = resolve_upstream(&target.host, target.port, connect_timeout).await?;
        let (tcp, peer) = connect_to_addrs(&addresses, connect_timeout).await?;
        let stream = match target.scheme {
            Scheme::Http => UpstreamIo::Plain(tcp),
            Scheme::Https => {
                let config = tls.ok_or_else(|| anyhow!("https upstream requires a TLS client"))?;
                let server_name = ServerName::try_from(target.host.clone())
                    .map_err(|_| anyhow!("invalid upstream host for TLS '{}'", target.host))?;
                let connector = TlsConnector::from(config.clone());
                let tls_stream = timeout_with_context(
                    connect_timeout,
                    connector.connect(server_name, tcp),
                    format!("establishing TLS with upstream {}", target.authority),
                )
                .await?;
                UpstreamIo::Tls(Box::new(tls_stream))
            }
        };
        Ok(Self {
            reader: BufReader::new(stream),
            peer,
            reused: false,
        })
    }
}

struct IdleConnection {
    connection: UpstreamConnection,
    idle_since: Instant,
}

/// Idle keep-alive connections to the single upstream, most recently used first.
pub(crate) struct UpstreamPool {
    idle: Mutex<VecDeque<IdleConnection>>,
    max_idle: usize,
    idle_timeout: Duration,
}

impl UpstreamPool {
    pub(crate) fn new(max_idle: usize, idle_timeout: Duration) -> Self {
        crate::metrics::set_pool_idle(0);
        Self {
            idle: Mutex::new(VecDeque::with_capacity(max_idle.min(1024))),
            max_idle,
            idle_timeout,
        }
    }

    /// Pops the freshest idle connection, dropping any that sat idle too long.
    pub(crate) fn take(&self) -> Option<UpstreamConnection> {
        let mut idle = self.idle.lock();
        let now = Instant::now();
        let mut found = None;
        while let Some(entry) = idle.pop_front() {
            if now.duration_since(entry.idle_since) < self.idle_timeout {
                found = Some(entry.connection);
                break;
            }
            debug!(peer = %entry.connection.peer, "dropping expired idle upstream connection");
        }
        crate::metrics::set_pool_idle(idle.len());
        found.map(|mut connection| {
            connection.reused = true;
            crate::metrics::record_pool_reuse();
            connection
        })
    }

    pub(crate) fn put(&self, connection: UpstreamConnection) {
        if self.max_idle == 0 {
            return;
        }
        // Bytes already buffered mean the framing is off; never reuse such a connection.
        if !connection.reader.buffer().is_empty() {
            debug!(peer = %connection.peer, "not pooling upstream connection with unread bytes");
            return;
        }
        let mut idle = self.idle.lock();
        idle.push_front(IdleConnection {
            connection,
            idle_since: Instant::now(),
        });
        idle.truncate(self.max_idle);
        crate::metrics::set_pool_idle(idle.len());
    }

    pub(crate) fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}
