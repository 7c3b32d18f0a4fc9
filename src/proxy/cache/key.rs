use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;

/// Storage key for one resource identifier (path plus query).
///
/// Keys are the padded URL-safe base64 encoding of the identifier bytes, so
/// they are injective and usable as a single path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the identifier this key was derived from, if the key is well formed.
    pub fn decode(&self) -> Option<String> {
        let bytes = URL_SAFE.decode(self.0.as_bytes()).ok()?;
        String::from_utf8(bytes).ok()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps a request's path and query to its cache key. No normalization is applied.
pub fn derive_key(resource: &str) -> CacheKey {
    CacheKey(URL_SAFE.encode(resource.as_bytes()))
}
