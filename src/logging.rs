use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

/// Target used for the per-request access line; filter it with
/// `RUST_LOG=access_log=off` to silence request logging.
pub const ACCESS_LOG_TARGET: &str = "access_log";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .try_init(),
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .compact()
            .try_init(),
    };
    installed.map_err(|err| anyhow!(err))
}

/// Accumulates the facts about one client exchange and emits them as a single
/// `access_log` event. Also feeds the request metrics.
#[derive(Debug, Clone)]
pub struct AccessLogBuilder {
    peer: SocketAddr,
    method: String,
    host: String,
    path: String,
    status: Option<StatusCode>,
    cache_lookup: Option<String>,
    cache_store: Option<String>,
    bytes_in: u64,
    bytes_out: u64,
    elapsed: Duration,
    upstream: Option<(SocketAddr, bool)>,
    error_reason: Option<String>,
    error_detail: Option<String>,
}

impl AccessLogBuilder {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            method: String::new(),
            host: String::new(),
            path: String::new(),
            status: None,
            cache_lookup: None,
            cache_store: None,
            bytes_in: 0,
            bytes_out: 0,
            elapsed: Duration::ZERO,
            upstream: None,
            error_reason: None,
            error_detail: None,
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn cache_lookup(mut self, value: impl Into<String>) -> Self {
        self.cache_lookup = Some(value.into());
        self
    }

    pub fn cache_store(mut self, value: impl Into<String>) -> Self {
        self.cache_store = Some(value.into());
        self
    }

    pub fn bytes(mut self, bytes_in: u64, bytes_out: u64) -> Self {
        self.bytes_in = bytes_in;
        self.bytes_out = bytes_out;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn upstream(mut self, addr: SocketAddr, reused: bool) -> Self {
        self.upstream = Some((addr, reused));
        self
    }

    pub fn error_reason(mut self, reason: impl Into<String>) -> Self {
        self.error_reason = Some(reason.into());
        self
    }

    pub fn error_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    pub fn log(self) {
        let status = self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let lookup = self.cache_lookup.as_deref().unwrap_or("none");
        let upstream_addr = self.upstream.map(|(addr, _)| addr.to_string());

        tracing::info!(
            target: ACCESS_LOG_TARGET,
            ts = %timestamp(OffsetDateTime::now_utc()),
            client = %self.peer,
            method = %self.method,
            host = %self.host,
            path = %self.path,
            status = status.as_u16(),
            cache_lookup = lookup,
            cache_store = self.cache_store.as_deref(),
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            elapsed_ms = self.elapsed.as_millis() as u64,
            upstream_addr = upstream_addr.as_deref(),
            upstream_reused = self.upstream.map(|(_, reused)| reused),
            error_reason = self.error_reason.as_deref(),
            error_detail = self.error_detail.as_deref(),
        );

        crate::metrics::record_request(&self.method, status, lookup, self.elapsed);
    }
}

fn timestamp(now: OffsetDateTime) -> String {
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}
