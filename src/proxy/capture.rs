use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::LOCATION;
use http::{HeaderValue, Method, StatusCode};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::io_util::TeeReader;
use crate::proxy::cache::{CacheStore, StoreError, derive_key};
use crate::proxy::message::{ProxyRequest, ProxyResponse, ResponseBody};
use crate::proxy::transport::{CACHE_MARKER_HEADER, CACHE_MARKER_HIT};
use crate::settings::UpstreamTarget;

/// Outcome of the store step for one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStoreResult {
    Stored,
    /// Cacheable by status but refused (too large, key too long).
    Skipped,
    /// Not a candidate at all.
    Bypassed,
}

impl CacheStoreResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStoreResult::Stored => "stored",
            CacheStoreResult::Skipped => "skipped",
            CacheStoreResult::Bypassed => "bypassed",
        }
    }
}

/// Hook run on every response before the client sees it. An error aborts
/// the exchange.
#[async_trait]
pub trait ResponseModifier: Send + Sync {
    async fn modify_response(
        &self,
        request: &ProxyRequest,
        response: &mut ProxyResponse,
    ) -> Result<CacheStoreResult>;
}

/// Rewrites redirects and persists cacheable bodies.
pub struct ResponseCapture {
    store: Arc<dyn CacheStore>,
    upstream: Arc<UpstreamTarget>,
    max_entry_size: Option<u64>,
}

impl ResponseCapture {
    pub fn new(
        store: Arc<dyn CacheStore>,
        upstream: Arc<UpstreamTarget>,
        max_entry_size: Option<u64>,
    ) -> Self {
        Self {
            store,
            upstream,
            max_entry_size,
        }
    }

    fn rewrite_location_header(&self, response: &mut ProxyResponse) {
        let Some(value) = response.headers.get(LOCATION) else {
            return;
        };
        let Ok(original) = value.to_str() else {
            debug!("leaving non-text location header untouched");
            return;
        };
        let rewritten = rewrite_location(original, &self.upstream);
        if rewritten == original {
            return;
        }
        match HeaderValue::from_str(&rewritten) {
            Ok(value) => {
                debug!(from = original, to = %rewritten, "rewrote location header");
                response.headers.insert(LOCATION, value);
            }
            Err(err) => debug!(error = %err, "rewritten location is not a valid header value"),
        }
    }

    async fn store(
        &self,
        request: &ProxyRequest,
        response: &mut ProxyResponse,
    ) -> Result<CacheStoreResult> {
        if let (Some(max), Some(len)) = (self.max_entry_size, response.body_len)
            && len > max
        {
            debug!(path = %request.path, len, max, "response exceeds cache entry limit");
            return Ok(CacheStoreResult::Skipped);
        }

        let key = derive_key(&request.path);
        let body = std::mem::replace(&mut response.body, ResponseBody::Empty);
        let (result, captured) = match body {
            ResponseBody::Empty => {
                let mut empty: &[u8] = &[];
                let result = self.store.put(&key, &mut empty, &response.headers).await;
                (result, Bytes::new())
            }
            ResponseBody::Buffered(bytes) => {
                let mut reader: &[u8] = &bytes;
                let result = self.store.put(&key, &mut reader, &response.headers).await;
                (result, bytes)
            }
            ResponseBody::Stream(reader) => {
                let mut tee = TeeReader::new(reader);
                let result = self.store.put(&key, &mut tee, &response.headers).await;
                // An uncacheable response may leave the body unread.
                // The client still needs all of it.
                let result = match result {
                    Ok(()) => drain(&mut tee).await,
                    Err(err) if err.is_uncacheable() => drain(&mut tee).await.and(Err(err)),
                    Err(err) => Err(err),
                };
                (result, Bytes::from(tee.into_copy()))
            }
        };

        match result {
            Ok(()) => {
                debug!(
                    path = %request.path,
                    key = %key.as_str(),
                    bytes = captured.len(),
                    "stored response"
                );
                response.set_buffered_body(captured);
                crate::metrics::record_cache_store(CacheStoreResult::Stored.as_str());
                Ok(CacheStoreResult::Stored)
            }
            Err(err) if err.is_uncacheable() => {
                warn!(path = %request.path, error = %err, "response not cacheable");
                response.set_buffered_body(captured);
                crate::metrics::record_cache_store(CacheStoreResult::Skipped.as_str());
                Ok(CacheStoreResult::Skipped)
            }
            Err(err) => {
                crate::metrics::record_cache_store_error();
                Err(err).with_context(|| format!("storing response for {}", request.path))
            }
        }
    }
}

/// Reads whatever `put` left unread so the buffered copy is complete.
async fn drain<R>(tee: &mut TeeReader<R>) -> Result<(), StoreError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut sink = Vec::new();
    tee.read_to_end(&mut sink)
        .await
        .map(|_| ())
        .map_err(|err| StoreError::io("reading response body", err))
}

/// Only plain `GET` 200s that did not come from the cache are stored.
fn is_cacheable(request: &ProxyRequest, response: &ProxyResponse) -> bool {
    request.method == Method::GET
        && response.status == StatusCode::OK
        && response
            .headers
            .get(CACHE_MARKER_HEADER)
            .is_none_or(|value| value != CACHE_MARKER_HIT)
}

#[async_trait]
impl ResponseModifier for ResponseCapture {
    async fn modify_response(
        &self,
        request: &ProxyRequest,
        response: &mut ProxyResponse,
    ) -> Result<CacheStoreResult> {
        self.rewrite_location_header(response);
        if !is_cacheable(request, response) {
            return Ok(CacheStoreResult::Bypassed);
        }
        self.store(request, response).await
    }
}

/// Strips the upstream base URL and authority so redirects stay on the proxy.
pub fn rewrite_location(value: &str, upstream: &UpstreamTarget) -> String {
    let mut rewritten = value.replace(&upstream.base, "");
    for scheme in ["http", "https"] {
        rewritten = rewritten.replace(&format!("{scheme}://{}", upstream.authority), "");
    }
    rewritten = rewritten.replace(&upstream.authority, "");
    if rewritten.is_empty() {
        return "/".to_string();
    }
    rewritten
}
