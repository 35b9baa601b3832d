//! Host filesystem layout and the quota-bounded per-project filesystem.
//!
//! Layout under the registry root:
//! ```text
//! {root}/
//!   metadata.db
//!   {project_id}/
//!     fs/              # project filesystem content
//!     dev-databases/   # host-side databases used during development
//! ```

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use projhub_core::{FsEntry, ProjectError, ProjectFilesystem, ProjectId};
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument};

const PROJECT_FS_DIR: &str = "fs";
const DEV_DATABASES_DIR: &str = "dev-databases";

fn fs_err(op: &str, path: &Path, e: io::Error) -> ProjectError {
    ProjectError::Filesystem(format!("{} {}: {}", op, path.display(), e))
}

/// Host filesystem rooted at the registry directory.
#[derive(Debug, Clone)]
pub struct HostFs {
    root: PathBuf,
}

impl HostFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn join<I, P>(&self, parts: I) -> PathBuf
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut path = self.root.clone();
        for part in parts {
            path.push(part);
        }
        path
    }

    /// Create a directory and its parents. An existing directory is not an error.
    pub async fn mkdir_all(&self, path: &Path) -> Result<(), ProjectError> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| fs_err("mkdir", path, e))
    }

    pub fn project_dir(&self, id: &ProjectId) -> PathBuf {
        self.join([id.as_str()])
    }

    pub fn project_fs_dir(&self, id: &ProjectId) -> PathBuf {
        self.join([id.as_str(), PROJECT_FS_DIR])
    }

    pub fn dev_databases_dir(&self, id: &ProjectId) -> PathBuf {
        self.join([id.as_str(), DEV_DATABASES_DIR])
    }

    /// Open the filesystem of a project, bounded by `max_usable_space`
    /// bytes (0 means unbounded).
    pub async fn open_project_fs(
        &self,
        id: &ProjectId,
        max_usable_space: u64,
    ) -> Result<Arc<QuotaFs>, ProjectError> {
        let max = (max_usable_space > 0).then_some(max_usable_space);
        QuotaFs::open(self.project_fs_dir(id), max).await.map(Arc::new)
    }
}

/// Project filesystem stored in a host directory, with a usable-space quota.
#[derive(Debug)]
pub struct QuotaFs {
    root: PathBuf,
    max_usable_space: Option<u64>,
    used: AtomicU64,
    closed: AtomicBool,
    /// Serializes quota accounting of mutations.
    write_lock: AsyncMutex<()>,
}

impl QuotaFs {
    /// Open (creating if absent) a filesystem stored in `root`.
    ///
    /// The used space is computed by walking the existing content.
    pub async fn open(root: PathBuf, max_usable_space: Option<u64>) -> Result<Self, ProjectError> {
        fs::create_dir_all(&root)
            .await
            .map_err(|e| fs_err("mkdir", &root, e))?;
        let used = Self::disk_usage(&root).await?;

        debug!(
            "Opened project filesystem at {} ({} bytes used, max {:?})",
            root.display(),
            used,
            max_usable_space
        );
        Ok(Self {
            root,
            max_usable_space,
            used: AtomicU64::new(used),
            closed: AtomicBool::new(false),
            write_lock: AsyncMutex::new(()),
        })
    }

    async fn disk_usage(root: &Path) -> Result<u64, ProjectError> {
        let mut total = 0;
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| fs_err("read dir", &dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| fs_err("read dir", &dir, e))?
            {
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| fs_err("stat", &entry.path(), e))?;
                if meta.is_dir() {
                    pending.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }

    /// Map a virtual path to a host path, refusing paths that leave the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, ProjectError> {
        let mut relative = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => relative.push(part),
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(ProjectError::InvalidInput(format!(
                            "path escapes project root: {}",
                            path
                        )));
                    }
                }
                Component::Prefix(_) => {
                    return Err(ProjectError::InvalidInput(format!("invalid path: {}", path)));
                }
            }
        }
        Ok(self.root.join(relative))
    }

    fn virtual_path(&self, host: &Path) -> String {
        let relative = host.strip_prefix(&self.root).unwrap_or(host);
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        format!("/{}", parts.join("/"))
    }

    fn check_open(&self) -> Result<(), ProjectError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProjectError::Filesystem(format!(
                "filesystem at {} is closed",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn existing_file_size(host: &Path) -> u64 {
        match fs::metadata(host).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        }
    }
}

#[async_trait]
impl ProjectFilesystem for QuotaFs {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ProjectError> {
        self.check_open()?;
        let host = self.resolve(path)?;
        fs::read(&host).await.map_err(|e| fs_err("read", &host, e))
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), ProjectError> {
        self.check_open()?;
        let host = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;

        let replaced = Self::existing_file_size(&host).await;
        let used = self.used.load(Ordering::Acquire);
        let new_used = used - replaced.min(used) + data.len() as u64;
        if let Some(max) = self.max_usable_space {
            if new_used > max {
                return Err(ProjectError::QuotaExceeded {
                    used,
                    requested: data.len() as u64,
                    max,
                });
            }
        }

        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| fs_err("mkdir", parent, e))?;
        }
        fs::write(&host, data)
            .await
            .map_err(|e| fs_err("write", &host, e))?;
        self.used.store(new_used, Ordering::Release);
        Ok(())
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), ProjectError> {
        self.check_open()?;
        let host = self.resolve(path)?;
        fs::create_dir_all(&host)
            .await
            .map_err(|e| fs_err("mkdir", &host, e))
    }

    async fn remove_file(&self, path: &str) -> Result<(), ProjectError> {
        self.check_open()?;
        let host = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;

        let size = Self::existing_file_size(&host).await;
        fs::remove_file(&host)
            .await
            .map_err(|e| fs_err("remove", &host, e))?;
        let used = self.used.load(Ordering::Acquire);
        self.used.store(used - size.min(used), Ordering::Release);
        Ok(())
    }

    async fn exists(&self, path: &str) -> bool {
        if self.check_open().is_err() {
            return false;
        }
        match self.resolve(path) {
            Ok(host) => fs::try_exists(&host).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FsEntry>, ProjectError> {
        self.check_open()?;
        let host = self.resolve(path)?;
        let mut entries = fs::read_dir(&host)
            .await
            .map_err(|e| fs_err("read dir", &host, e))?;

        let mut result = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| fs_err("read dir", &host, e))?
        {
            let meta = entry
                .metadata()
                .await
                .map_err(|e| fs_err("stat", &entry.path(), e))?;
            result.push(FsEntry {
                path: self.virtual_path(&entry.path()),
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        result.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(result)
    }

    fn used_space(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    fn max_usable_space(&self) -> Option<u64> {
        self.max_usable_space
    }

    async fn close(&self) -> Result<(), ProjectError> {
        self.closed.store(true, Ordering::Release);
        debug!("Closed project filesystem at {}", self.root.display());
        Ok(())
    }
}
