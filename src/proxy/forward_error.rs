use std::net::SocketAddr;

use anyhow::Error;
use http::StatusCode;
use tracing::warn;

use crate::proxy::cache::StoreError;
use crate::proxy::http::BodyTooLarge;
use crate::util::TimedOut;

/// Classification of a failed exchange, used to pick the client-facing status.
pub enum ForwardErrorKind<'a> {
    BodyTooLarge(&'a BodyTooLarge),
    Store(&'a StoreError),
    Timeout(&'a TimedOut),
    Other,
}

pub fn classify_forward_error(err: &Error) -> ForwardErrorKind<'_> {
    for cause in err.chain() {
        if let Some(body) = cause.downcast_ref::<BodyTooLarge>() {
            return ForwardErrorKind::BodyTooLarge(body);
        }
        if let Some(store) = cause.downcast_ref::<StoreError>() {
            return ForwardErrorKind::Store(store);
        }
        if let Some(timeout) = cause.downcast_ref::<TimedOut>() {
            return ForwardErrorKind::Timeout(timeout);
        }
    }
    ForwardErrorKind::Other
}

impl ForwardErrorKind<'_> {
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardErrorKind::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ForwardErrorKind::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ForwardErrorKind::Store(_) | ForwardErrorKind::Other => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ForwardErrorKind::BodyTooLarge(_) => "body_too_large",
            ForwardErrorKind::Store(_) => "cache_store_failed",
            ForwardErrorKind::Timeout(_) => "upstream_timeout",
            ForwardErrorKind::Other => "upstream_error",
        }
    }
}

pub fn log_forward_error(kind: &ForwardErrorKind<'_>, peer: SocketAddr, path: &str, err: &Error) {
    match kind {
        ForwardErrorKind::BodyTooLarge(body) => warn!(
            peer = %peer,
            path,
            bytes_read = body.bytes_read,
            "request body exceeds configured limit"
        ),
        ForwardErrorKind::Store(store) => warn!(
            peer = %peer,
            path,
            error = %store,
            "cache write failed; answering with bad gateway"
        ),
        ForwardErrorKind::Timeout(timeout) => warn!(
            peer = %peer,
            path,
            error = %timeout,
            "upstream request timed out"
        ),
        ForwardErrorKind::Other => warn!(
            peer = %peer,
            path,
            error = format!("{err:#}"),
            "upstream request failed"
        ),
    }
}
