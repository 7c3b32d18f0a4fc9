mod entry;
mod fs;
mod key;
mod locks;
mod memory;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::settings::{CacheBackend, Settings};

pub use entry::{CachedEntry, HeaderSubset};
pub use fs::FsCacheStore;
pub use key::{CacheKey, derive_key};
pub use memory::MemoryCacheStore;
pub use store::{CacheStore, StoreError};

/// Builds the store selected by `cache_backend`.
pub async fn open_store(settings: &Settings) -> Result<Arc<dyn CacheStore>> {
    match settings.cache_backend {
        CacheBackend::Fs => {
            let store = FsCacheStore::open(settings.cache_dir.clone())
                .await
                .with_context(|| {
                    format!(
                        "failed to open cache directory {}",
                        settings.cache_dir.display()
                    )
                })?;
            info!(dir = %store.dir().display(), "filesystem cache ready");
            Ok(Arc::new(store))
        }
        CacheBackend::Memory => {
            info!("in-memory cache ready");
            Ok(Arc::new(MemoryCacheStore::new()))
        }
    }
}
