use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

use crate::io_util::CHUNK_SIZE;
use crate::proxy::error::CacheWriteError;

/// Streams one origin body into a temp file next to the entry, then renames it into place.
///
/// A failed or abandoned fill removes the temp file, so the previous entry (if any) stays
/// untouched.
pub(crate) struct CacheWriter {
    file: Option<AsyncFile>,
    temp_path: PathBuf,
    final_path: PathBuf,
    finished: bool,
}

impl CacheWriter {
    pub(crate) async fn create(final_path: &Path) -> Result<Self, CacheWriteError> {
        let temp_path = temp_path_for(final_path);
        let mut options = async_fs::OpenOptions::new();
        options.create_new(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o644);
        }
        let file = options.open(&temp_path).await?;
        Ok(Self {
            file: Some(file),
            temp_path,
            final_path: final_path.to_path_buf(),
            finished: false,
        })
    }

    /// Reads exactly `declared` bytes from `reader` and commits them as the new entry.
    ///
    /// Never reads past `declared`; an early EOF is a [`CacheWriteError::ByteCountMismatch`].
    pub(crate) async fn fill_from<R>(
        mut self,
        reader: &mut R,
        declared: u64,
        read_timeout: Duration,
    ) -> Result<u64, CacheWriteError>
    where
        R: AsyncRead + Unpin,
    {
        let result = self.write_and_commit(reader, declared, read_timeout).await;
        if result.is_err() {
            self.file = None;
            if let Err(err) = async_fs::remove_file(&self.temp_path).await {
                trace!(path = %self.temp_path.display(), error = %err, "temp file already gone");
            }
            self.finished = true;
        }
        result
    }

    async fn write_and_commit<R>(
        &mut self,
        reader: &mut R,
        declared: u64,
        read_timeout: Duration,
    ) -> Result<u64, CacheWriteError>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| std::io::Error::other("cache writer already used"))?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;

        while received < declared {
            let want = (declared - received).min(CHUNK_SIZE as u64) as usize;
            let read = timeout(read_timeout, reader.read(&mut buffer[..want]))
                .await
                .map_err(|_| CacheWriteError::Timeout("reading origin body".to_string()))??;
            if read == 0 {
                return Err(CacheWriteError::ByteCountMismatch { declared, received });
            }
            file.write_all(&buffer[..read]).await?;
            received += read as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        async_fs::rename(&self.temp_path, &self.final_path).await?;
        self.finished = true;
        trace!(path = %self.final_path.display(), bytes = received, "committed cache entry");
        Ok(received)
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let temp_path = self.temp_path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = async_fs::remove_file(temp_path).await;
            });
        } else {
            let _ = std::fs::remove_file(&temp_path);
        }
    }
}

const TEMP_MARKER: &str = ".tmp-";

fn temp_path_for(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(".{name}{TEMP_MARKER}{}", uuid::Uuid::new_v4()))
}

fn is_temp_file_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

/// Removes temp files left under `root` by fills that never finished (crash, kill, shutdown).
///
/// Returns how many were removed.
pub(crate) async fn remove_orphaned_temp_files(root: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = async_fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
                continue;
            }
            if file_type.is_file() && is_temp_file_name(&entry.file_name().to_string_lossy()) {
                let path = entry.path();
                match async_fs::remove_file(&path).await {
                    Ok(()) => {
                        trace!(path = %path.display(), "removed orphaned temp file");
                        removed += 1;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const READ_TIMEOUT: Duration = Duration::from_secs(1);

    fn leftover_temp_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| is_temp_file_name(&entry.file_name().to_string_lossy()))
            .count()
    }

    #[tokio::test]
    async fn writes_exactly_declared_bytes() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("img.png");
        let body: Vec<u8> = (0..42u8).collect();
        let mut wire = body.clone();
        wire.extend_from_slice(b"next-response-bytes");
        let mut reader = &wire[..];

        let writer = CacheWriter::create(&path).await?;
        let written = writer.fill_from(&mut reader, 42, READ_TIMEOUT).await?;

        assert_eq!(written, 42);
        assert_eq!(std::fs::read(&path)?, body);
        assert_eq!(reader, b"next-response-bytes");
        assert_eq!(leftover_temp_files(dir.path()), 0);
        Ok(())
    }

    #[tokio::test]
    async fn overwrites_previous_entry() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("page.html");
        std::fs::write(&path, b"old body that is longer")?;

        let mut reader = &b"new"[..];
        CacheWriter::create(&path)
            .await?
            .fill_from(&mut reader, 3, READ_TIMEOUT)
            .await?;
        assert_eq!(std::fs::read(&path)?, b"new");
        Ok(())
    }

    #[tokio::test]
    async fn short_body_keeps_previous_entry() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("page.html");
        std::fs::write(&path, b"previous")?;

        let mut reader = &b"only-ten.."[..];
        let err = CacheWriter::create(&path)
            .await?
            .fill_from(&mut reader, 42, READ_TIMEOUT)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CacheWriteError::ByteCountMismatch {
                declared: 42,
                received: 10
            }
        ));
        assert_eq!(std::fs::read(&path)?, b"previous");
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(leftover_temp_files(dir.path()), 0);
        Ok(())
    }

    #[test]
    fn temp_names_are_recognised() {
        let temp = temp_path_for(Path::new("/c/h_80/img.png"));
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".img.png.tmp-"));
        assert!(is_temp_file_name(&name));
        assert!(!is_temp_file_name("img.png"));
        assert!(!is_temp_file_name("notes.tmp-1"));
    }

    #[tokio::test]
    async fn sweep_removes_nested_orphans_only() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let nested = dir.path().join("h_80").join("a");
        std::fs::create_dir_all(&nested)?;
        let orphan = temp_path_for(&nested.join("img.png"));
        std::fs::write(&orphan, b"partial")?;
        let top_orphan = temp_path_for(&dir.path().join("x"));
        std::fs::write(&top_orphan, b"")?;
        std::fs::write(nested.join("img.png"), b"entry")?;

        let removed = remove_orphaned_temp_files(dir.path()).await?;

        assert_eq!(removed, 2);
        assert!(!orphan.exists());
        assert!(!top_orphan.exists());
        assert_eq!(std::fs::read(nested.join("img.png"))?, b"entry");
        Ok(())
    }

    #[tokio::test]
    async fn zero_length_body_creates_empty_entry() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("empty");
        let mut reader = &b""[..];
        CacheWriter::create(&path)
            .await?
            .fill_from(&mut reader, 0, READ_TIMEOUT)
            .await?;
        assert_eq!(std::fs::metadata(&path)?.len(), 0);
        Ok(())
    }
}
