use std::{future::Future, path::Path, time::Duration};

use anyhow::{Context, Result};
use tokio::time::{error::Elapsed, timeout};

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values. A missed deadline keeps [`Elapsed`] as its cause so callers can
/// tell it apart with [`is_timeout`].
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
    timeout(duration, future)
        .await
        .map_err(|elapsed| anyhow::Error::new(elapsed).context(format!("timed out {context}")))?
        .with_context(|| format!("failed while {context}"))
}

pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Elapsed>().is_some()
}

/// Returns the lowercase extension of `path`, if it has one.
pub fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}
