use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use http::{HeaderValue, Method, StatusCode};
use tracing::debug;

use crate::proxy::cache::{CacheStore, StoreError, derive_key};
use crate::proxy::message::{CacheLookup, ProxyRequest, ProxyResponse, ResponseBody};

/// Response header that marks a response synthesized from the cache.
pub const CACHE_MARKER_HEADER: &str = "x-cache";
pub const CACHE_MARKER_HIT: &str = "HIT";

/// Performs one request and returns the response or an error.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: &ProxyRequest) -> Result<ProxyResponse>;
}

/// Serves `GET`/`HEAD` from the store when an entry exists and otherwise
/// delegates to `inner` unchanged.
pub struct CachedTransport {
    store: Arc<dyn CacheStore>,
    inner: Arc<dyn Transport>,
}

impl CachedTransport {
    pub fn new(store: Arc<dyn CacheStore>, inner: Arc<dyn Transport>) -> Self {
        Self { store, inner }
    }

    async fn lookup(&self, request: &ProxyRequest) -> Option<ProxyResponse> {
        let key = derive_key(&request.path);
        match self.store.get(&key).await {
            Ok(entry) => {
                let mut headers = entry.headers;
                headers.insert(CACHE_MARKER_HEADER, HeaderValue::from_static(CACHE_MARKER_HIT));
                let mut response = ProxyResponse::new(
                    StatusCode::OK,
                    headers,
                    ResponseBody::Stream(entry.body),
                )
                .with_body_len(Some(entry.body_len));
                response.cache_lookup = CacheLookup::Hit;
                Some(response)
            }
            Err(StoreError::NotFound) => None,
            Err(err) => {
                debug!(
                    path = %request.path,
                    key = %key.as_str(),
                    error = %err,
                    "cache lookup failed; treating as miss"
                );
                None
            }
        }
    }
}

fn is_lookup_method(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

#[async_trait]
impl Transport for CachedTransport {
    async fn round_trip(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
        if !is_lookup_method(&request.method) {
            crate::metrics::record_cache_lookup(CacheLookup::Bypass.as_str());
            return self.inner.round_trip(request).await;
        }

        if let Some(response) = self.lookup(request).await {
            crate::metrics::record_cache_lookup(CacheLookup::Hit.as_str());
            return Ok(response);
        }

        crate::metrics::record_cache_lookup(CacheLookup::Miss.as_str());
        let mut response = self.inner.round_trip(request).await?;
        response.cache_lookup = CacheLookup::Miss;
        Ok(response)
    }
}
