use std::io;

use async_trait::async_trait;
use http::HeaderMap;
use thiserror::Error;
use tokio::io::AsyncRead;

use super::{CacheKey, CachedEntry};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no cache entry for key")]
    NotFound,
    #[error("cache key of {len} bytes exceeds the store limit of {max} bytes")]
    KeyTooLong { len: usize, max: usize },
    #[error("cache entry headers are unreadable: {0}")]
    CorruptHeaders(String),
    #[error("response headers cannot be stored: {0}")]
    UnstorableHeaders(String),
    #[error("cache io failed while {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    /// Errors that mean "this response cannot be cached" rather than "storage is broken".
    pub fn is_uncacheable(&self) -> bool {
        matches!(
            self,
            StoreError::KeyTooLong { .. } | StoreError::UnstorableHeaders(_)
        )
    }
}

/// Durable key to (body, header subset) storage.
///
/// `put` overwrites any previous entry for the key and consumes `content`
/// fully before returning. `get` returns whatever the last successful `put`
/// stored. `flush` of an absent key succeeds.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn put(
        &self,
        key: &CacheKey,
        content: &mut (dyn AsyncRead + Send + Unpin),
        headers: &HeaderMap,
    ) -> Result<(), StoreError>;

    async fn get(&self, key: &CacheKey) -> Result<CachedEntry, StoreError>;

    async fn flush(&self, key: &CacheKey) -> Result<(), StoreError>;
}
