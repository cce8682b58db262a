use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs as async_fs;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, trace};

mod freshness;
mod key;
mod locks;
mod writer;

pub use freshness::FreshnessVerdict;
pub use key::CacheKey;
pub(crate) use writer::CacheWriter;

use crate::proxy::error::CacheWriteError;
use locks::KeyLocks;

/// Filesystem-backed cache: one file per (host, port, path), freshness judged from its mtime.
///
/// There is no index; the filesystem is the only source of truth.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    expiry: Duration,
    max_entry_size: u64,
    locks: KeyLocks,
}

impl DiskCache {
    pub async fn new(root: PathBuf, expiry: Duration, max_entry_size: u64) -> Result<Self> {
        async_fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create cache root {}", root.display()))?;
        let removed = writer::remove_orphaned_temp_files(&root)
            .await
            .with_context(|| format!("failed to sweep temp files under {}", root.display()))?;
        if removed > 0 {
            info!(root = %root.display(), removed, "removed orphaned cache temp files");
        }
        Ok(Self {
            root,
            expiry,
            max_entry_size,
            locks: KeyLocks::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_entry_size(&self) -> u64 {
        self.max_entry_size
    }

    /// Maps `key` to its storage location and makes sure the parent directory exists.
    ///
    /// Idempotent: repeated calls return the same path and succeed.
    pub async fn prepare_entry_path(&self, key: &CacheKey) -> std::io::Result<PathBuf> {
        let dir = key.directory_under(&self.root);
        async_fs::create_dir_all(&dir).await?;
        let path = key.file_under(&self.root);
        trace!(key = %key, path = %path.display(), "mapped cache entry");
        Ok(path)
    }

    pub async fn freshness(&self, path: &Path) -> std::io::Result<FreshnessVerdict> {
        freshness::evaluate(path, self.expiry).await
    }

    pub(crate) async fn lock(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        self.locks.lock(key).await
    }

    pub(crate) async fn writer(&self, path: &Path) -> Result<CacheWriter, CacheWriteError> {
        CacheWriter::create(path).await
    }
}
