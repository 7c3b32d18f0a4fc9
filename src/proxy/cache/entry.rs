use std::collections::BTreeMap;

use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};
use tokio::io::AsyncRead;

use super::StoreError;

const CONTENT_TYPE_FIELD: &str = "Content-Type";
const CONTENT_LENGTH_FIELD: &str = "Content-Length";

/// The only response headers a cache entry retains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSubset {
    pub content_type: Option<HeaderValue>,
    pub content_length: Option<u64>,
}

/// Sidecar document shape: canonical header name to list of values.
type PersistedHeaders = BTreeMap<String, Vec<String>>;

impl HeaderSubset {
    /// Keeps `content-type` and `content-length` and drops everything else.
    /// A `content-length` that is not a plain integer is dropped as well.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let content_type = headers.get(CONTENT_TYPE).cloned();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        Self {
            content_type,
            content_length,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        let mut doc = PersistedHeaders::new();
        if let Some(value) = &self.content_type {
            // Non-ASCII is kept as long as it is UTF-8.
            let value = std::str::from_utf8(value.as_bytes()).map_err(|_| {
                StoreError::UnstorableHeaders("content-type is not valid UTF-8".into())
            })?;
            doc.insert(CONTENT_TYPE_FIELD.to_string(), vec![value.to_string()]);
        }
        if let Some(length) = self.content_length {
            doc.insert(CONTENT_LENGTH_FIELD.to_string(), vec![length.to_string()]);
        }
        serde_json::to_vec(&doc).map_err(|err| StoreError::CorruptHeaders(err.to_string()))
    }

    /// Parses a sidecar document. Field names match case-insensitively and
    /// unknown fields are ignored.
    pub fn from_json(data: &[u8]) -> Result<Self, StoreError> {
        let doc: PersistedHeaders = serde_json::from_slice(data)
            .map_err(|err| StoreError::CorruptHeaders(err.to_string()))?;
        let mut subset = HeaderSubset::default();
        for (name, values) in doc {
            let Some(first) = values.into_iter().next() else {
                continue;
            };
            if name.eq_ignore_ascii_case(CONTENT_TYPE_FIELD) {
                let value = HeaderValue::from_str(&first).map_err(|_| {
                    StoreError::CorruptHeaders(format!("invalid content-type '{first}'"))
                })?;
                subset.content_type = Some(value);
            } else if name.eq_ignore_ascii_case(CONTENT_LENGTH_FIELD) {
                let length = first.trim().parse::<u64>().map_err(|_| {
                    StoreError::CorruptHeaders(format!("invalid content-length '{first}'"))
                })?;
                subset.content_length = Some(length);
            }
        }
        Ok(subset)
    }

    /// Builds the response headers for a hit, filling in `content-length`
    /// from the stored body when the entry was written without one.
    pub fn to_header_map(&self, body_len: u64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = &self.content_type {
            headers.insert(CONTENT_TYPE, value.clone());
        }
        let length = self.content_length.unwrap_or(body_len);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        headers
    }
}

/// A stored entry as returned by a lookup.
pub struct CachedEntry {
    pub headers: HeaderMap,
    pub body: Box<dyn AsyncRead + Send + Unpin>,
    pub body_len: u64,
}

impl CachedEntry {
    pub fn new(
        subset: &HeaderSubset,
        body: Box<dyn AsyncRead + Send + Unpin>,
        body_len: u64,
    ) -> Self {
        Self {
            headers: subset.to_header_map(body_len),
            body,
            body_len,
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }
}

impl std::fmt::Debug for CachedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEntry")
            .field("headers", &self.headers)
            .field("body_len", &self.body_len)
            .finish_non_exhaustive()
    }
}
