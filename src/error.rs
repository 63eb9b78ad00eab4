use std::io;
use thiserror::Error;

/// Engine error codes reported through the last-error shim
pub mod codes {
    pub const SUCCESS: u32 = 0x0000_0000;
    pub const OS_ERROR: u32 = 0x0000_0001;
    pub const GENERIC_FAILURE: u32 = 0x0001_0000;
    pub const TIMEOUT: u32 = 0x0001_0002;
    pub const CANCELLED: u32 = 0x0001_0003;
    pub const COPY_UP_FAILED: u32 = 0x0001_0004;
    pub const METADATA_CORRUPT: u32 = 0x0001_0005;
    pub const RESOURCE_BUSY: u32 = 0x0001_0006;
    pub const NOT_SUPPORTED: u32 = 0x0001_0007;
    pub const INCOMPATIBLE_PLUGIN: u32 = 0x0002_0005;
    pub const INVALID_PARAMETER: u32 = 0x0003_0000;
    pub const INVALID_PLUGIN_ID: u32 = 0x0003_0001;
    pub const INVALID_SOURCE: u32 = 0x0003_0002;
    pub const INVALID_MOUNT_ID: u32 = 0x0003_0003;
    pub const INVALID_PATH: u32 = 0x0003_0005;
    pub const INEXISTENT_FILE: u32 = 0x0004_0001;
    pub const NOT_A_DIRECTORY: u32 = 0x0004_0005;
    pub const IS_A_DIRECTORY: u32 = 0x0004_0006;
    pub const NOT_EMPTY: u32 = 0x0004_0007;
    pub const ALREADY_EXISTING_FILE: u32 = 0x0005_0001;
    pub const ACCESS_DENIED: u32 = 0x0006_0001;
    pub const READ_ONLY: u32 = 0x0006_0002;
}

/// Main error type for mergefs operations
#[derive(Error, Debug)]
pub enum MergeFsError {
    #[error("Plugin load failed: {0}")]
    PluginLoad(String),

    #[error("Source initialization failed: {0}")]
    SourceInit(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Copy-up failed for {path}: {reason}")]
    CopyUpFailed { path: String, reason: String },

    #[error("Metadata corrupt: {0}")]
    MetadataCorrupt(String),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Read-only source")]
    ReadOnly,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid plugin id: {0}")]
    InvalidPluginId(String),

    #[error("Invalid mount id: {0}")]
    InvalidMountId(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MergeFsError {
    /// Build a copy-up failure for `path`
    pub fn copy_up(path: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        MergeFsError::CopyUpFailed {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Convert error to libc errno for FUSE responses
    pub fn to_errno(&self) -> i32 {
        match self {
            MergeFsError::PluginLoad(_) => libc::ENOEXEC,
            MergeFsError::SourceInit(_) => libc::EIO,
            MergeFsError::NotFound(_) => libc::ENOENT,
            MergeFsError::AlreadyExists(_) => libc::EEXIST,
            MergeFsError::PermissionDenied(_) => libc::EACCES,
            MergeFsError::CopyUpFailed { .. } => libc::EIO,
            MergeFsError::MetadataCorrupt(_) => libc::EIO,
            MergeFsError::ResourceBusy(_) => libc::EBUSY,
            MergeFsError::NotADirectory(_) => libc::ENOTDIR,
            MergeFsError::IsADirectory(_) => libc::EISDIR,
            MergeFsError::NotEmpty(_) => libc::ENOTEMPTY,
            MergeFsError::InvalidPath(_) => libc::EINVAL,
            MergeFsError::ReadOnly => libc::EROFS,
            MergeFsError::InvalidArgument(_) => libc::EINVAL,
            MergeFsError::NotSupported(_) => libc::ENOSYS,
            MergeFsError::Timeout(_) => libc::ETIMEDOUT,
            MergeFsError::Cancelled(_) => libc::EINTR,
            MergeFsError::InvalidPluginId(_) => libc::EINVAL,
            MergeFsError::InvalidMountId(_) => libc::EINVAL,
            MergeFsError::Config(_) => libc::EINVAL,
            MergeFsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Engine-defined error code, or the raw OS error for OS-originated failures
    pub fn code(&self) -> u32 {
        match self {
            MergeFsError::PluginLoad(_) => codes::INCOMPATIBLE_PLUGIN,
            MergeFsError::SourceInit(_) => codes::INVALID_SOURCE,
            MergeFsError::NotFound(_) => codes::INEXISTENT_FILE,
            MergeFsError::AlreadyExists(_) => codes::ALREADY_EXISTING_FILE,
            MergeFsError::PermissionDenied(_) => codes::ACCESS_DENIED,
            MergeFsError::CopyUpFailed { .. } => codes::COPY_UP_FAILED,
            MergeFsError::MetadataCorrupt(_) => codes::METADATA_CORRUPT,
            MergeFsError::ResourceBusy(_) => codes::RESOURCE_BUSY,
            MergeFsError::NotADirectory(_) => codes::NOT_A_DIRECTORY,
            MergeFsError::IsADirectory(_) => codes::IS_A_DIRECTORY,
            MergeFsError::NotEmpty(_) => codes::NOT_EMPTY,
            MergeFsError::InvalidPath(_) => codes::INVALID_PATH,
            MergeFsError::ReadOnly => codes::READ_ONLY,
            MergeFsError::InvalidArgument(_) | MergeFsError::Config(_) => {
                codes::INVALID_PARAMETER
            }
            MergeFsError::NotSupported(_) => codes::NOT_SUPPORTED,
            MergeFsError::Timeout(_) => codes::TIMEOUT,
            MergeFsError::Cancelled(_) => codes::CANCELLED,
            MergeFsError::InvalidPluginId(_) => codes::INVALID_PLUGIN_ID,
            MergeFsError::InvalidMountId(_) => codes::INVALID_MOUNT_ID,
            MergeFsError::Io(e) => match e.raw_os_error() {
                Some(errno) => errno as u32,
                None => codes::GENERIC_FAILURE,
            },
        }
    }

    /// Whether `code()` is an OS error number rather than an engine code
    pub fn is_os_error(&self) -> bool {
        matches!(self, MergeFsError::Io(e) if e.raw_os_error().is_some())
    }

    /// True for the "path absent" family
    pub fn is_not_found(&self) -> bool {
        match self {
            MergeFsError::NotFound(_) => true,
            MergeFsError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result type alias for mergefs operations
pub type Result<T> = std::result::Result<T, MergeFsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(MergeFsError::NotFound("/a".into()).to_errno(), libc::ENOENT);
        assert_eq!(MergeFsError::ResourceBusy("m".into()).to_errno(), libc::EBUSY);
        assert_eq!(
            MergeFsError::copy_up("/a", "disk full").to_errno(),
            libc::EIO
        );
        let io = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(MergeFsError::Io(io).to_errno(), libc::ENOSPC);
    }

    #[test]
    fn test_os_error_domain() {
        let io = MergeFsError::Io(io::Error::from_raw_os_error(libc::EACCES));
        assert!(io.is_os_error());
        assert_eq!(io.code(), libc::EACCES as u32);

        let engine = MergeFsError::MetadataCorrupt("bad crc".into());
        assert!(!engine.is_os_error());
        assert_eq!(engine.code(), codes::METADATA_CORRUPT);

        let synthetic = MergeFsError::Io(io::Error::new(io::ErrorKind::Other, "x"));
        assert!(!synthetic.is_os_error());
        assert_eq!(synthetic.code(), codes::GENERIC_FAILURE);
    }

    #[test]
    fn test_not_found_family() {
        assert!(MergeFsError::NotFound("/x".into()).is_not_found());
        assert!(MergeFsError::Io(io::Error::from(io::ErrorKind::NotFound)).is_not_found());
        assert!(!MergeFsError::ReadOnly.is_not_found());
    }
}
