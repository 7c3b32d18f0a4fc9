use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{CacheKey, CacheStore, CachedEntry, HeaderSubset, StoreError};

/// In-process store with the same contract as the filesystem store.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<CacheKey, (HeaderSubset, Bytes)>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn put(
        &self,
        key: &CacheKey,
        content: &mut (dyn AsyncRead + Send + Unpin),
        headers: &HeaderMap,
    ) -> Result<(), StoreError> {
        let mut body = Vec::new();
        content
            .read_to_end(&mut body)
            .await
            .map_err(|err| StoreError::io("reading cache body", err))?;
        let subset = HeaderSubset::from_headers(headers);
        self.entries
            .lock()
            .insert(key.clone(), (subset, Bytes::from(body)));
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<CachedEntry, StoreError> {
        let (subset, body) = self
            .entries
            .lock()
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        let len = body.len() as u64;
        Ok(CachedEntry::new(&subset, Box::new(Cursor::new(body)), len))
    }

    async fn flush(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
