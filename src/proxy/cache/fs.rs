use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use http::HeaderMap;
use tokio::fs as async_fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::locks::KeyLocks;
use super::{CacheKey, CacheStore, CachedEntry, HeaderSubset, StoreError};

const HEADERS_SUFFIX: &str = ".headers";
const TEMP_PREFIX: &str = ".tmp-";
const MAX_FILE_NAME: usize = 255;

/// Filesystem store: `<dir>/<key>` holds the body and `<dir>/<key>.headers`
/// holds the header subset as JSON.
pub struct FsCacheStore {
    dir: PathBuf,
    locks: KeyLocks,
}

impl FsCacheStore {
    /// Creates the directory if needed and removes temporary files left by
    /// an earlier process.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        async_fs::create_dir_all(&dir).await.map_err(|err| {
            StoreError::io(format!("creating cache directory {}", dir.display()), err)
        })?;
        let store = Self {
            dir,
            locks: KeyLocks::new(),
        };
        store.remove_temp_files().await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_key_len() -> usize {
        MAX_FILE_NAME - HEADERS_SUFFIX.len()
    }

    pub fn body_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    pub fn headers_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}{HEADERS_SUFFIX}", key.as_str()))
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()))
    }

    fn check_key(key: &CacheKey) -> Result<(), StoreError> {
        let max = Self::max_key_len();
        if key.len() > max {
            return Err(StoreError::KeyTooLong {
                len: key.len(),
                max,
            });
        }
        Ok(())
    }

    async fn remove_temp_files(&self) -> Result<(), StoreError> {
        let mut entries = async_fs::read_dir(&self.dir).await.map_err(|err| {
            StoreError::io(format!("listing cache directory {}", self.dir.display()), err)
        })?;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    return Err(StoreError::io("listing cache directory", err));
                }
            };
            let is_temp = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(TEMP_PREFIX))
                .unwrap_or(false);
            if is_temp {
                let path = entry.path();
                if let Err(err) = async_fs::remove_file(&path).await {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to remove stale cache temp file"
                    );
                } else {
                    debug!(path = %path.display(), "removed stale cache temp file");
                }
            }
        }
        Ok(())
    }

    async fn create_temp_file(&self) -> Result<(PathBuf, async_fs::File), StoreError> {
        let path = self.temp_path();
        let mut options = async_fs::OpenOptions::new();
        options.create_new(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let file = options.open(&path).await.map_err(|err| {
            StoreError::io(format!("creating cache temp file {}", path.display()), err)
        })?;
        Ok((path, file))
    }

    async fn write_body_temp(
        &self,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<PathBuf, StoreError> {
        let (path, mut file) = self.create_temp_file().await?;
        let result = async {
            tokio::io::copy(content, &mut file)
                .await
                .map_err(|err| StoreError::io("writing cache body", err))?;
            file.flush()
                .await
                .map_err(|err| StoreError::io("flushing cache body", err))?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            discard(&path).await;
            return Err(err);
        }
        Ok(path)
    }

    async fn write_headers_temp(&self, data: &[u8]) -> Result<PathBuf, StoreError> {
        let (path, mut file) = self.create_temp_file().await?;
        let result = async {
            file.write_all(data)
                .await
                .map_err(|err| StoreError::io("writing cache headers", err))?;
            file.flush()
                .await
                .map_err(|err| StoreError::io("flushing cache headers", err))?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            discard(&path).await;
            return Err(err);
        }
        Ok(path)
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn put(
        &self,
        key: &CacheKey,
        content: &mut (dyn AsyncRead + Send + Unpin),
        headers: &HeaderMap,
    ) -> Result<(), StoreError> {
        Self::check_key(key)?;
        let sidecar = HeaderSubset::from_headers(headers).to_json()?;

        // Only the renames run under the stripe lock.
        let body_temp = self.write_body_temp(content).await?;
        let headers_temp = match self.write_headers_temp(&sidecar).await {
            Ok(path) => path,
            Err(err) => {
                discard(&body_temp).await;
                return Err(err);
            }
        };

        let _guard = self.locks.stripe(key).write().await;
        let body_path = self.body_path(key);
        if let Err(err) = async_fs::rename(&body_temp, &body_path).await {
            discard(&body_temp).await;
            discard(&headers_temp).await;
            return Err(StoreError::io(
                format!("publishing cache body {}", body_path.display()),
                err,
            ));
        }
        let headers_path = self.headers_path(key);
        if let Err(err) = async_fs::rename(&headers_temp, &headers_path).await {
            discard(&headers_temp).await;
            // The new body must not pair with the previous sidecar.
            discard(&body_path).await;
            discard(&headers_path).await;
            return Err(StoreError::io(
                format!("publishing cache headers {}", headers_path.display()),
                err,
            ));
        }
        debug!(key = %key, "cache entry stored");
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<CachedEntry, StoreError> {
        Self::check_key(key)?;
        let _guard = self.locks.stripe(key).read().await;

        let headers_path = self.headers_path(key);
        let data = async_fs::read(&headers_path)
            .await
            .map_err(|err| not_found_or_io(err, "reading cache headers"))?;
        let subset = HeaderSubset::from_json(&data)?;

        let body_path = self.body_path(key);
        let file = async_fs::File::open(&body_path)
            .await
            .map_err(|err| not_found_or_io(err, "opening cache body"))?;
        let body_len = file
            .metadata()
            .await
            .map_err(|err| StoreError::io("reading cache body metadata", err))?
            .len();

        Ok(CachedEntry::new(&subset, Box::new(file), body_len))
    }

    async fn flush(&self, key: &CacheKey) -> Result<(), StoreError> {
        Self::check_key(key)?;
        let _guard = self.locks.stripe(key).write().await;
        for path in [self.body_path(key), self.headers_path(key)] {
            match async_fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StoreError::io(
                        format!("removing cache file {}", path.display()),
                        err,
                    ));
                }
            }
        }
        Ok(())
    }
}

fn not_found_or_io(err: std::io::Error, context: &str) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound
    } else {
        StoreError::io(context, err)
    }
}

async fn discard(path: &Path) {
    if let Err(err) = async_fs::remove_file(path).await
        && err.kind() != ErrorKind::NotFound
    {
        debug!(path = %path.display(), error = %err, "failed to remove cache file");
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use http::HeaderValue;
    use http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, ReadBuf};

    use super::*;
    use crate::proxy::cache::derive_key;

    fn text_headers(len: Option<u64>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        if let Some(len) = len {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
        headers
    }

    async fn read_body(entry: CachedEntry) -> Vec<u8> {
        let mut body = Vec::new();
        let mut reader = entry.body;
        reader.read_to_end(&mut body).await.unwrap();
        body
    }

    async fn open_store() -> (TempDir, FsCacheStore) {
        let dir = TempDir::new().unwrap();
        let store = FsCacheStore::open(dir.path().join("cache")).await.unwrap();
        (dir, store)
    }

    struct FailingReader {
        sent: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.sent {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "upstream reset",
                )));
            }
            self.sent = true;
            buf.put_slice(b"partial");
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trip() {
        let (_dir, store) = open_store().await;
        let key = derive_key("/widgets/1?x=1");
        let mut headers = text_headers(Some(5));
        headers.insert(ETAG, HeaderValue::from_static("\"v1\""));

        store.put(&key, &mut &b"hello"[..], &headers).await.unwrap();

        let entry = store.get(&key).await.unwrap();
        assert_eq!(entry.headers.len(), 2);
        assert_eq!(entry.headers.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(entry.headers.get(CONTENT_LENGTH).unwrap(), "5");
        assert_eq!(entry.body_len, 5);
        assert_eq!(read_body(entry).await, b"hello");
    }

    #[tokio::test]
    async fn on_disk_layout_is_body_and_sidecar() {
        let (_dir, store) = open_store().await;
        let key = derive_key("/a");
        store
            .put(&key, &mut &b"hello"[..], &text_headers(Some(5)))
            .await
            .unwrap();

        let mut names = Vec::new();
        let mut entries = async_fs::read_dir(store.dir()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        assert_eq!(names, vec!["L2E=".to_string(), "L2E=.headers".to_string()]);

        let sidecar = async_fs::read_to_string(store.headers_path(&key))
            .await
            .unwrap();
        assert_eq!(
            sidecar,
            r#"{"Content-Length":["5"],"Content-Type":["text/plain"]}"#
        );
    }

    #[tokio::test]
    async fn put_is_idempotent_and_overwrites() {
        let (_dir, store) = open_store().await;
        let key = derive_key("/a");
        for _ in 0..2 {
            store
                .put(&key, &mut &b"first"[..], &text_headers(Some(5)))
                .await
                .unwrap();
        }
        assert_eq!(read_body(store.get(&key).await.unwrap()).await, b"first");

        store
            .put(&key, &mut &b"second!"[..], &text_headers(Some(7)))
            .await
            .unwrap();
        let entry = store.get(&key).await.unwrap();
        assert_eq!(entry.headers.get(CONTENT_LENGTH).unwrap(), "7");
        assert_eq!(read_body(entry).await, b"second!");
    }

    #[tokio::test]
    async fn missing_length_is_reconstructed_from_body() {
        let (_dir, store) = open_store().await;
        let key = derive_key("/chunked");
        store
            .put(&key, &mut &b"0123456789"[..], &text_headers(None))
            .await
            .unwrap();
        let entry = store.get(&key).await.unwrap();
        assert_eq!(entry.headers.get(CONTENT_LENGTH).unwrap(), "10");
    }

    #[tokio::test]
    async fn flush_then_get_is_miss() {
        let (_dir, store) = open_store().await;
        let key = derive_key("/a");
        store
            .put(&key, &mut &b"hello"[..], &text_headers(Some(5)))
            .await
            .unwrap();
        store.flush(&key).await.unwrap();
        assert!(matches!(store.get(&key).await, Err(StoreError::NotFound)));
        assert!(!store.body_path(&key).exists());
        assert!(!store.headers_path(&key).exists());
    }

    #[tokio::test]
    async fn flush_of_missing_key_succeeds() {
        let (_dir, store) = open_store().await;
        store.flush(&derive_key("/never")).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_sidecar_is_miss() {
        let (_dir, store) = open_store().await;
        let key = derive_key("/a");
        store
            .put(&key, &mut &b"hello"[..], &text_headers(Some(5)))
            .await
            .unwrap();
        async_fs::write(store.headers_path(&key), b"{not json")
            .await
            .unwrap();
        assert!(matches!(
            store.get(&key).await,
            Err(StoreError::CorruptHeaders(_))
        ));
    }

    #[tokio::test]
    async fn body_without_sidecar_is_miss() {
        let (_dir, store) = open_store().await;
        let key = derive_key("/a");
        async_fs::write(store.body_path(&key), b"orphan").await.unwrap();
        assert!(matches!(store.get(&key).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn sidecar_without_body_is_miss() {
        let (_dir, store) = open_store().await;
        let key = derive_key("/a");
        async_fs::write(store.headers_path(&key), br#"{"Content-Type":["text/plain"]}"#)
            .await
            .unwrap();
        assert!(matches!(store.get(&key).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn failed_body_stream_leaves_no_entry() {
        let (_dir, store) = open_store().await;
        let key = derive_key("/a");
        let mut reader = FailingReader { sent: false };
        let err = store
            .put(&key, &mut reader, &text_headers(None))
            .await
            .expect_err("read failure must fail the put");
        assert!(matches!(err, StoreError::Io { .. }), "{err:?}");
        assert!(matches!(store.get(&key).await, Err(StoreError::NotFound)));

        let mut entries = async_fs::read_dir(store.dir()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overlong_key_is_rejected() {
        let (_dir, store) = open_store().await;
        let key = derive_key(&format!("/{}", "a".repeat(300)));
        let err = store
            .put(&key, &mut &b"x"[..], &text_headers(Some(1)))
            .await
            .expect_err("key too long");
        assert!(err.is_uncacheable());
        assert!(matches!(
            store.get(&key).await,
            Err(StoreError::KeyTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn open_removes_stale_temp_files() {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("cache");
        std::fs::create_dir_all(&cache_dir).unwrap();
        std::fs::write(cache_dir.join(".tmp-leftover"), b"junk").unwrap();
        std::fs::write(cache_dir.join("L2E="), b"kept").unwrap();

        FsCacheStore::open(&cache_dir).await.unwrap();

        assert!(!cache_dir.join(".tmp-leftover").exists());
        assert!(cache_dir.join("L2E=").exists());
    }

    #[tokio::test]
    async fn open_fails_when_directory_cannot_be_created() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();
        let err = FsCacheStore::open(file.join("cache"))
            .await
            .err()
            .expect("cache dir under a file");
        assert!(err.to_string().contains("creating cache directory"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = open_store().await;
        let key = derive_key("/a");
        store
            .put(&key, &mut &b"hello"[..], &text_headers(Some(5)))
            .await
            .unwrap();
        for path in [store.body_path(&key), store.headers_path(&key)] {
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", path.display());
        }
    }

    #[tokio::test]
    async fn concurrent_puts_never_tear_entries() {
        let (_dir, store) = open_store().await;
        let store = Arc::new(store);
        let key = derive_key("/contended");

        let mut tasks = Vec::new();
        for i in 0..16u64 {
            let writer_store = store.clone();
            let writer_key = key.clone();
            tasks.push(tokio::spawn(async move {
                let body = vec![b'a' + (i % 26) as u8; (i as usize + 1) * 64];
                let headers = text_headers(Some(body.len() as u64));
                writer_store
                    .put(&writer_key, &mut &body[..], &headers)
                    .await
                    .unwrap();
            }));
            let reader_store = store.clone();
            let reader_key = key.clone();
            tasks.push(tokio::spawn(async move {
                if let Ok(entry) = reader_store.get(&reader_key).await {
                    let declared: u64 = entry.content_length().unwrap();
                    let body = read_body(entry).await;
                    assert_eq!(declared, body.len() as u64);
                    assert!(body.iter().all(|b| *b == body[0]));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let entry = store.get(&key).await.unwrap();
        let declared = entry.content_length().unwrap();
        assert_eq!(declared, read_body(entry).await.len() as u64);
    }
}
