use async_trait::async_trait;

use crate::error::ProjectError;

/// A file or directory entry in a project filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// Absolute virtual path, e.g. `/static/base.css`.
    pub path: String,
    pub is_dir: bool,
    /// Size in bytes (0 for directories)
    pub size: u64,
}

/// Per-project virtual filesystem.
///
/// Paths are virtual and absolute (`/main.ix`); they never resolve outside
/// the project. Writes are bounded by the filesystem's usable space.
#[async_trait]
pub trait ProjectFilesystem: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ProjectError>;

    /// Create or replace a file, creating missing parent directories.
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), ProjectError>;

    async fn mkdir_all(&self, path: &str) -> Result<(), ProjectError>;

    async fn remove_file(&self, path: &str) -> Result<(), ProjectError>;

    async fn exists(&self, path: &str) -> bool;

    /// Direct children of a directory, sorted by path.
    async fn read_dir(&self, path: &str) -> Result<Vec<FsEntry>, ProjectError>;

    /// Bytes currently stored.
    fn used_space(&self) -> u64;

    /// Maximum usable bytes, `None` when unbounded.
    fn max_usable_space(&self) -> Option<u64>;

    /// Further operations fail after close.
    async fn close(&self) -> Result<(), ProjectError>;
}
