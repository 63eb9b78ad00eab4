//! Local directory source
//!
//! Serves a directory tree on the host filesystem. This is also the default
//! backing store for writable overlays.

use std::io::{self, SeekFrom};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{MergeFsError, Result};
use crate::path::VPath;
use crate::source::{
    option_flag, Capabilities, DirEntry, DirEntryStream, Metadata, PluginInfo, Source,
    SourceOptions, SourceProvider,
};

pub const LOCAL_PROVIDER_GUID: Uuid = Uuid::from_u128(0x6d1c_2f4e_8a07_4b3e_9c51_0e2a_7f31_b001);

/// Provider for host directory sources
#[derive(Debug, Default)]
pub struct LocalDirectoryProvider;

#[async_trait]
impl SourceProvider for LocalDirectoryProvider {
    fn info(&self) -> PluginInfo {
        PluginInfo::source(
            LOCAL_PROVIDER_GUID,
            "local",
            "Host directory tree",
            0x0001_0000,
        )
    }

    fn supports(&self, locator: &str) -> bool {
        std::fs::metadata(locator)
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn instantiate(&self, locator: &str, options: &SourceOptions) -> Result<Arc<dyn Source>> {
        let read_only = option_flag(options, "read_only")?;
        let source = LocalDirectorySource::open(locator, read_only).await?;
        Ok(Arc::new(source))
    }
}

/// A source rooted at one host directory
pub struct LocalDirectorySource {
    root: PathBuf,
    read_only: bool,
}

impl LocalDirectorySource {
    /// Open `root`, which must exist and be a directory
    pub async fn open(root: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&root).await.map_err(|e| {
            MergeFsError::SourceInit(format!("{}: {}", root.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(MergeFsError::SourceInit(format!(
                "{}: not a directory",
                root.display()
            )));
        }
        debug!("Opened local source at {} (read_only={})", root.display(), read_only);
        Ok(Self { root, read_only })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn physical(&self, path: &VPath) -> PathBuf {
        path.to_physical(&self.root)
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(MergeFsError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

/// Map an io::Error to the path-aware error kinds
fn map_io(path: &VPath, e: io::Error) -> MergeFsError {
    match e.kind() {
        io::ErrorKind::NotFound => MergeFsError::NotFound(path.to_string()),
        io::ErrorKind::AlreadyExists => MergeFsError::AlreadyExists(path.to_string()),
        io::ErrorKind::PermissionDenied => MergeFsError::PermissionDenied(path.to_string()),
        _ => match e.raw_os_error() {
            Some(libc::ENOTEMPTY) => MergeFsError::NotEmpty(path.to_string()),
            Some(libc::ENOTDIR) => MergeFsError::NotADirectory(path.to_string()),
            Some(libc::EISDIR) => MergeFsError::IsADirectory(path.to_string()),
            _ => MergeFsError::Io(e),
        },
    }
}

fn to_metadata(meta: &std::fs::Metadata) -> Metadata {
    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let base = if meta.is_dir() {
        Metadata::directory(mtime)
    } else {
        Metadata::file(meta.len(), mtime)
    };
    base.with_mode(meta.permissions().mode())
}

#[async_trait]
impl Source for LocalDirectorySource {
    fn capabilities(&self) -> Capabilities {
        if self.read_only {
            Capabilities::read_only()
        } else {
            Capabilities::full()
        }
    }

    fn locator(&self) -> String {
        self.root.display().to_string()
    }

    async fn stat(&self, path: &VPath) -> Result<Metadata> {
        trace!("local stat: {}", path);
        let meta = tokio::fs::metadata(self.physical(path))
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(to_metadata(&meta))
    }

    fn list_dir(&self, path: &VPath) -> DirEntryStream {
        let dir = self.physical(path);
        let vpath = path.clone();

        Box::pin(try_stream! {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| map_io(&vpath, e))?;

            while let Some(entry) = entries.next_entry().await.map_err(|e| map_io(&vpath, e))? {
                let name = match entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(raw) => {
                        warn!("Skipping non UTF-8 name {:?} in {}", raw, dir.display());
                        continue;
                    }
                };
                // Follow symlinks; entries removed mid-listing are skipped
                let meta = tokio::fs::metadata(entry.path()).await;
                if matches!(&meta, Err(e) if e.kind() == io::ErrorKind::NotFound) {
                    continue;
                }
                let meta = meta.map_err(|e| map_io(&vpath, e))?;
                yield DirEntry::new(name, to_metadata(&meta));
            }
        })
    }

    async fn read(&self, path: &VPath, offset: u64, size: u32) -> Result<Bytes> {
        trace!("local read: {} offset={} size={}", path, offset, size);
        let mut file = tokio::fs::File::open(self.physical(path))
            .await
            .map_err(|e| map_io(path, e))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(size as usize);
        file.take(size as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write(&self, path: &VPath, offset: u64, data: &[u8]) -> Result<u64> {
        self.check_writable()?;
        trace!("local write: {} offset={} len={}", path, offset, data.len());
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.physical(path))
            .await
            .map_err(|e| map_io(path, e))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len() as u64)
    }

    async fn create_file(&self, path: &VPath, mode: u32) -> Result<()> {
        self.check_writable()?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & 0o7777)
            .open(self.physical(path))
            .await
            .map_err(|e| map_io(path, e))?;
        // The process umask applies on create; restore the requested bits
        self.set_mode(path, mode).await
    }

    async fn create_dir(&self, path: &VPath, mode: u32) -> Result<()> {
        self.check_writable()?;
        tokio::fs::create_dir(self.physical(path))
            .await
            .map_err(|e| map_io(path, e))?;
        self.set_mode(path, mode).await
    }

    async fn remove_file(&self, path: &VPath) -> Result<()> {
        self.check_writable()?;
        tokio::fs::remove_file(self.physical(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn remove_dir(&self, path: &VPath) -> Result<()> {
        self.check_writable()?;
        tokio::fs::remove_dir(self.physical(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn rename(&self, from: &VPath, to: &VPath) -> Result<()> {
        self.check_writable()?;
        tokio::fs::rename(self.physical(from), self.physical(to))
            .await
            .map_err(|e| map_io(from, e))
    }

    async fn truncate(&self, path: &VPath, size: u64) -> Result<()> {
        self.check_writable()?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.physical(path))
            .await
            .map_err(|e| map_io(path, e))?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn set_mode(&self, path: &VPath, mode: u32) -> Result<()> {
        self.check_writable()?;
        tokio::fs::set_permissions(
            self.physical(path),
            std::fs::Permissions::from_mode(mode & 0o7777),
        )
        .await
        .map_err(|e| map_io(path, e))
    }

    async fn set_mtime(&self, path: &VPath, mtime: SystemTime) -> Result<()> {
        self.check_writable()?;
        let physical = self.physical(path);
        let vpath = path.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&physical)?;
            file.set_modified(mtime)
        })
        .await
        .map_err(|e| MergeFsError::Io(io::Error::other(e)))?
        .map_err(|e| map_io(&vpath, e))
    }

    async fn flush(&self, path: &VPath) -> Result<()> {
        let physical = self.physical(path);
        let vpath = path.clone();
        tokio::task::spawn_blocking(move || std::fs::File::open(&physical)?.sync_all())
            .await
            .map_err(|e| MergeFsError::Io(io::Error::other(e)))?
            .map_err(|e| map_io(&vpath, e))
    }
}
