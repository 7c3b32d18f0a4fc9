use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
};
use tracing::{debug, info};

use crate::proxy::http::codec::read_http1_request_head;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<C>(collector: C) -> C
where
    C: Collector + Clone + 'static,
{
    REGISTRY
        .register(Box::new(collector.clone()))
        .expect("metric names are unique");
    collector
}

fn counter_vec(name: &str, help: &str, label: &str) -> IntCounterVec {
    register(IntCounterVec::new(Opts::new(name, help), &[label]).expect("valid counter vec"))
}

fn counter(name: &str, help: &str) -> IntCounter {
    register(IntCounter::new(name, help).expect("valid counter"))
}

fn gauge(name: &str, help: &str) -> IntGauge {
    register(IntGauge::new(name, help).expect("valid gauge"))
}

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("requests_status_total", "Requests by status class", "status_class")
});

static REQUEST_METHOD_TOTAL: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("requests_method_total", "Requests by method", "method"));

static REQUEST_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("request_duration_seconds", "Request latency by cache lookup")
        .buckets(latency_buckets());
    register(HistogramVec::new(opts, &["cache"]).expect("valid histogram vec"))
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("cache_lookup_total", "Cache lookups by result", "result"));

static CACHE_STORE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec("cache_store_total", "Cache store decisions by result", "result")
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| counter("cache_store_errors_total", "Cache store write failures"));

static INFLIGHT_REQUESTS: Lazy<IntGauge> =
    Lazy::new(|| gauge("inflight_requests", "Requests currently being served"));

static UPSTREAM_POOL_IDLE: Lazy<IntGauge> =
    Lazy::new(|| gauge("upstream_pool_idle", "Idle upstream connections"));

static UPSTREAM_POOL_REUSE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    counter(
        "upstream_pool_reuse_total",
        "Requests sent on a pooled upstream connection",
    )
});

static UPSTREAM_ERRORS_TOTAL: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("upstream_errors_total", "Upstream errors by kind", "kind"));

fn latency_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ]
}

const METRICS_MAX_REQUEST_BYTES: usize = 8192;
const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);
const METRICS_PATH: &str = "/metrics";

fn status_class(status: StatusCode) -> &'static str {
    if status.is_informational() {
        "1xx"
    } else if status.is_success() {
        "2xx"
    } else if status.is_redirection() {
        "3xx"
    } else if status.is_client_error() {
        "4xx"
    } else if status.is_server_error() {
        "5xx"
    } else {
        "other"
    }
}

pub fn inc_inflight() {
    INFLIGHT_REQUESTS.inc();
}

pub fn dec_inflight() {
    INFLIGHT_REQUESTS.dec();
}

pub fn record_request(method: &str, status: StatusCode, cache_lookup: &str, elapsed: Duration) {
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class(status)])
        .inc();
    REQUEST_METHOD_TOTAL.with_label_values(&[method]).inc();
    REQUEST_LATENCY_SECONDS
        .with_label_values(&[cache_lookup])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store(result: &str) {
    CACHE_STORE_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn set_pool_idle(size: usize) {
    UPSTREAM_POOL_IDLE.set(size as i64);
}

pub fn record_pool_reuse() {
    UPSTREAM_POOL_REUSE_TOTAL.inc();
}

pub fn record_upstream_error(kind: &str) {
    UPSTREAM_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

/// Renders every registered metric in the Prometheus text format.
pub fn gather() -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        debug!(error = %err, "failed to encode metrics");
    }
    buffer
}

/// Serves the registry in text format at `GET /metrics`.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics endpoint listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_stream_with_limits(
                stream,
                peer,
                METRICS_READ_TIMEOUT,
                METRICS_MAX_REQUEST_BYTES,
            )
            .await
            {
                debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream_with_limits<S>(
    stream: S,
    peer: SocketAddr,
    read_timeout: Duration,
    max_bytes: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let Some(head) =
        read_http1_request_head(&mut reader, peer, read_timeout, read_timeout, max_bytes).await?
    else {
        return Ok(());
    };

    let response = if head.method == http::Method::GET && head.path == METRICS_PATH {
        build_response(200, TextEncoder::new().format_type(), gather())
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    reader.get_mut().write_all(&response).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}
