use std::fmt;
use std::path::{Path, PathBuf};

/// File name used when the resource path ends in `/`.
const INDEX_FILE_NAME: &str = "index.html";

/// Identifies one cached resource: (origin host, origin port, resource path).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    host: String,
    port: u16,
    path: String,
}

impl CacheKey {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
        }
    }

    /// Top-level directory for every resource of this origin.
    pub fn origin_dir_name(&self) -> String {
        format!("{}_{}", self.host, self.port)
    }

    /// Splits the resource path into its directory segments and final file name.
    pub fn segments(&self) -> (Vec<&str>, &str) {
        let (dir, file) = match self.path.rsplit_once('/') {
            Some((dir, file)) => (dir, file),
            None => ("", self.path.as_str()),
        };
        let dirs = dir.split('/').filter(|segment| !segment.is_empty()).collect();
        let file = if file.is_empty() { INDEX_FILE_NAME } else { file };
        (dirs, file)
    }

    /// Directory holding this entry, relative to `root`.
    pub fn directory_under(&self, root: &Path) -> PathBuf {
        let (dirs, _) = self.segments();
        let mut dir = root.join(self.origin_dir_name());
        for segment in dirs {
            dir.push(segment);
        }
        dir
    }

    /// Full location of this entry, relative to `root`.
    pub fn file_under(&self, root: &Path) -> PathBuf {
        let (_, file) = self.segments();
        self.directory_under(root).join(file)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.path)
    }
}
