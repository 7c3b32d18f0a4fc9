use std::{future::Future, time::Duration};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::time::timeout;

/// A deadline elapsed. Kept as a distinct type so callers can map it to 504.
#[derive(Debug, Error)]
#[error("timed out {context}")]
pub struct TimedOut {
    pub context: String,
}

impl TimedOut {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }
}

/// Returns true if any error in the chain is a [`TimedOut`].
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<TimedOut>())
}

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    match timeout(duration, future).await {
        Ok(result) => result.with_context(|| format!("failed while {context}")),
        Err(_) => Err(TimedOut::new(context).into()),
    }
}
