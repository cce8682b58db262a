use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tokio::fs as async_fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessVerdict {
    Absent,
    Stale { modified: SystemTime },
    Fresh { modified: SystemTime },
}

impl FreshnessVerdict {
    /// Classifies an entry from its modification time alone.
    ///
    /// Age is `now - modified`; an mtime in the future counts as age zero.
    pub fn classify(modified: Option<SystemTime>, now: SystemTime, threshold: Duration) -> Self {
        let Some(modified) = modified else {
            return FreshnessVerdict::Absent;
        };
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age >= threshold {
            FreshnessVerdict::Stale { modified }
        } else {
            FreshnessVerdict::Fresh { modified }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FreshnessVerdict::Absent => "absent",
            FreshnessVerdict::Stale { .. } => "stale",
            FreshnessVerdict::Fresh { .. } => "fresh",
        }
    }

    /// The validator to send upstream, if this verdict calls for a conditional request.
    pub fn validator(&self) -> Option<SystemTime> {
        match self {
            FreshnessVerdict::Stale { modified } => Some(*modified),
            _ => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, FreshnessVerdict::Fresh { .. })
    }
}

/// Reads the entry's metadata and classifies it against `now`.
pub async fn evaluate_at(
    path: &Path,
    threshold: Duration,
    now: SystemTime,
) -> std::io::Result<FreshnessVerdict> {
    let modified = match async_fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.modified()?),
        Ok(_) => None,
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => return Err(err),
    };
    Ok(FreshnessVerdict::classify(modified, now, threshold))
}

pub async fn evaluate(path: &Path, threshold: Duration) -> std::io::Result<FreshnessVerdict> {
    evaluate_at(path, threshold, SystemTime::now()).await
}
