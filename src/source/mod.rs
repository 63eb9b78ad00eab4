pub mod archive;
pub mod local;
pub mod memory;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use uuid::Uuid;

use crate::error::{MergeFsError, Result};
use crate::path::VPath;

/// Interface version every provider must declare
pub const PLUGIN_INTERFACE_VERSION: u32 = 2;

/// File type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
}

/// Default file mode (rw-r--r--)
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default directory mode (rwxr-xr-x)
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Metadata for a file or directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub file_type: FileType,
    pub size: u64,
    pub mtime: SystemTime,
    /// POSIX permission bits (e.g., 0o644). None means use default.
    pub mode: Option<u32>,
}

impl Metadata {
    pub fn file(size: u64, mtime: SystemTime) -> Self {
        Self {
            file_type: FileType::File,
            size,
            mtime,
            mode: None,
        }
    }

    pub fn directory(mtime: SystemTime) -> Self {
        Self {
            file_type: FileType::Directory,
            size: 0,
            mtime,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode & 0o7777);
        self
    }

    /// Get the mode, using defaults if not set
    pub fn mode_or_default(&self) -> u32 {
        self.mode.unwrap_or(if self.is_dir() {
            DEFAULT_DIR_MODE
        } else {
            DEFAULT_FILE_MODE
        })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.file_type, FileType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.file_type, FileType::Directory)
    }
}

/// Directory entry returned by list_dir
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub metadata: Metadata,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            name: name.into(),
            metadata,
        }
    }

    pub fn file_type(&self) -> FileType {
        self.metadata.file_type
    }
}

/// Source capabilities declaration
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Can read files
    pub read: bool,
    /// Can create, write and delete (false = read-only)
    pub write: bool,
    /// Native rename support
    pub rename: bool,
    /// Can update modification time
    pub set_mtime: bool,
    /// Can store and retrieve POSIX file modes
    pub set_mode: bool,
}

impl Capabilities {
    /// Full read-write capabilities
    pub fn full() -> Self {
        Self {
            read: true,
            write: true,
            rename: true,
            set_mtime: true,
            set_mode: true,
        }
    }

    /// Read-only capabilities
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// Whether the source can back a writable overlay
    pub fn can_back_overlay(&self) -> bool {
        self.read && self.write && self.rename
    }
}

/// Stream type for directory listings
pub type DirEntryStream = Pin<Box<dyn Stream<Item = Result<DirEntry>> + Send>>;

/// Provider-specific string options attached to a source descriptor
pub type SourceOptions = BTreeMap<String, String>;

/// Parse a boolean option, absent means false
pub fn option_flag(options: &SourceOptions, key: &str) -> Result<bool> {
    match options.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if v == "true" || v == "1" || v == "yes" => Ok(true),
        Some(v) if v == "false" || v == "0" || v == "no" => Ok(false),
        Some(v) => Err(MergeFsError::InvalidArgument(format!(
            "option {}: expected boolean, got '{}'",
            key, v
        ))),
    }
}

/// An instantiated source bound to one locator
///
/// Sources are path-based: every call names a virtual path relative to the
/// source root. Read-only sources only implement the read half; the default
/// mutators answer `ReadOnly`.
#[async_trait]
pub trait Source: Send + Sync {
    /// Get source capabilities
    fn capabilities(&self) -> Capabilities;

    /// Human-readable locator, used in logs and mount descriptions
    fn locator(&self) -> String;

    /// Get metadata for a path
    async fn stat(&self, path: &VPath) -> Result<Metadata>;

    /// Check if a path exists
    ///
    /// Default implementation uses stat()
    async fn exists(&self, path: &VPath) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List directory children as a stream
    fn list_dir(&self, path: &VPath) -> DirEntryStream;

    /// Read up to `size` bytes starting at `offset`
    async fn read(&self, path: &VPath, offset: u64, size: u32) -> Result<Bytes>;

    /// Write bytes at `offset`, returning the number of bytes written
    async fn write(&self, _path: &VPath, _offset: u64, _data: &[u8]) -> Result<u64> {
        Err(MergeFsError::ReadOnly)
    }

    /// Create an empty file
    async fn create_file(&self, _path: &VPath, _mode: u32) -> Result<()> {
        Err(MergeFsError::ReadOnly)
    }

    /// Create a directory
    async fn create_dir(&self, _path: &VPath, _mode: u32) -> Result<()> {
        Err(MergeFsError::ReadOnly)
    }

    async fn remove_file(&self, _path: &VPath) -> Result<()> {
        Err(MergeFsError::ReadOnly)
    }

    /// Remove an empty directory
    async fn remove_dir(&self, _path: &VPath) -> Result<()> {
        Err(MergeFsError::ReadOnly)
    }

    /// Rename, replacing an existing file at `to`
    async fn rename(&self, _from: &VPath, _to: &VPath) -> Result<()> {
        Err(MergeFsError::ReadOnly)
    }

    async fn truncate(&self, _path: &VPath, _size: u64) -> Result<()> {
        Err(MergeFsError::ReadOnly)
    }

    async fn set_mode(&self, _path: &VPath, _mode: u32) -> Result<()> {
        Err(MergeFsError::NotSupported("set_mode not supported".to_string()))
    }

    async fn set_mtime(&self, _path: &VPath, _mtime: SystemTime) -> Result<()> {
        Err(MergeFsError::NotSupported("set_mtime not supported".to_string()))
    }

    /// Flush pending writes for a path to durable storage
    async fn flush(&self, _path: &VPath) -> Result<()> {
        Ok(())
    }
}

/// Kind of plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginType {
    Source,
    Other(u32),
}

/// Identity and version metadata declared by a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub interface_version: u32,
    pub plugin_type: PluginType,
    pub guid: Uuid,
    pub name: String,
    pub description: String,
    pub version: u32,
    pub version_string: String,
    /// Identifier the plugin was loaded from; filled in by the registry
    pub origin: String,
}

impl PluginInfo {
    /// Info for a source provider built against this engine's interface
    pub fn source(guid: Uuid, name: &str, description: &str, version: u32) -> Self {
        Self {
            interface_version: PLUGIN_INTERFACE_VERSION,
            plugin_type: PluginType::Source,
            guid,
            name: name.to_string(),
            description: description.to_string(),
            version,
            version_string: format!(
                "{}.{}.{}",
                (version >> 16) & 0xff,
                (version >> 8) & 0xff,
                version & 0xff
            ),
            origin: String::new(),
        }
    }
}

/// Capability table of a source plugin
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Declared identity, type and interface version
    fn info(&self) -> PluginInfo;

    /// Whether this provider recognizes `locator` (used for auto-detection)
    fn supports(&self, locator: &str) -> bool;

    /// Bind a new source instance to `locator`
    async fn instantiate(&self, locator: &str, options: &SourceOptions) -> Result<Arc<dyn Source>>;
}
