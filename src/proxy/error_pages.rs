use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use http::StatusCode;
use tokio::fs as async_fs;
use tracing::{debug, info};

use super::relay::reason_phrase;

/// Statuses this proxy can answer with a fixed page.
pub const ERROR_STATUSES: [StatusCode; 6] = [
    StatusCode::BAD_REQUEST,
    StatusCode::NOT_FOUND,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::NOT_IMPLEMENTED,
    StatusCode::BAD_GATEWAY,
    StatusCode::HTTP_VERSION_NOT_SUPPORTED,
];

/// Fixed error pages on disk, named `<code>.html`.
#[derive(Debug, Clone)]
pub struct ErrorPages {
    dir: PathBuf,
}

impl ErrorPages {
    /// Ensures every page exists in `dir`, writing the built-in page where one is missing.
    /// Pages already present are left alone.
    pub async fn prepare(dir: PathBuf) -> Result<Self> {
        async_fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create error page dir {}", dir.display()))?;
        let pages = Self { dir };
        let mut written = 0usize;
        for status in ERROR_STATUSES {
            let path = pages.page_path(status);
            if async_fs::try_exists(&path).await.unwrap_or(false) {
                debug!(path = %path.display(), "using existing error page");
                continue;
            }
            async_fs::write(&path, builtin_page(status))
                .await
                .with_context(|| format!("failed to write error page {}", path.display()))?;
            written += 1;
        }
        if written > 0 {
            info!(dir = %pages.dir.display(), written, "materialized built-in error pages");
        }
        Ok(pages)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn page_path(&self, status: StatusCode) -> PathBuf {
        self.dir.join(format!("{}.html", status.as_u16()))
    }
}

/// Page written at startup, and sent from memory if the file on disk has gone missing.
pub(crate) fn builtin_page(status: StatusCode) -> String {
    let code = status.as_u16();
    let reason = reason_phrase(status);
    format!(
        "<html><head><title>{code} {reason}</title></head>\n<body><h1>{code} {reason}</h1></body></html>\n"
    )
}
