//! Configuration parsing and structures

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::env::substitute_env_vars;
use crate::mount::MountOptions;
use crate::overlay::OverlayPolicy;
use crate::stack::{InsertPosition, SourceDescriptor};

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Plugins to load, in detection order
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,

    /// Mount defaults
    #[serde(default)]
    pub defaults: MountDefaults,

    pub mounts: Vec<RawMountConfig>,
}

/// One plugin to load at startup
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PluginConfig {
    /// Plugin path or builtin identifier (`builtin:local`)
    pub path: String,

    /// Prepend to the detection order instead of appending
    #[serde(default)]
    pub front: bool,
}

/// Top-level mount defaults; every mount inherits these unless it overrides them
#[derive(Debug, Clone, Deserialize)]
pub struct MountDefaults {
    #[serde(default)]
    pub writable: bool,

    #[serde(default = "default_true")]
    pub case_sensitive: bool,

    #[serde(default = "default_true")]
    pub defer_copy: bool,

    #[serde(with = "humantime_serde", default = "default_copy_timeout")]
    pub copy_timeout: Duration,

    #[serde(default = "default_copy_retries")]
    pub copy_retries: u32,

    #[serde(with = "humantime_serde", default = "default_drain_timeout")]
    pub drain_timeout: Duration,
}

fn default_true() -> bool {
    true
}

fn default_copy_timeout() -> Duration {
    OverlayPolicy::default().copy_timeout
}

fn default_copy_retries() -> u32 {
    OverlayPolicy::default().copy_retries
}

fn default_drain_timeout() -> Duration {
    OverlayPolicy::default().drain_timeout
}

impl Default for MountDefaults {
    fn default() -> Self {
        Self {
            writable: false,
            case_sensitive: true,
            defer_copy: true,
            copy_timeout: default_copy_timeout(),
            copy_retries: default_copy_retries(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

/// Raw mount configuration before resolution
#[derive(Debug, Clone, Deserialize)]
pub struct RawMountConfig {
    /// Path where the filesystem will be mounted
    pub path: PathBuf,

    /// Layers, in descriptor order
    #[serde(default)]
    pub sources: Vec<RawSourceConfig>,

    pub writable: Option<bool>,
    pub case_sensitive: Option<bool>,
    pub defer_copy: Option<bool>,

    #[serde(default, with = "humantime_serde")]
    pub copy_timeout: Option<Duration>,
    pub copy_retries: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub drain_timeout: Option<Duration>,

    /// Overlay metadata log (required when writable)
    pub metadata_file: Option<PathBuf>,

    /// Overlay backing directory; defaults to `<metadata_file>.overlay`
    pub overlay_dir: Option<PathBuf>,
}

/// One source layer
#[derive(Debug, Clone, Deserialize)]
pub struct RawSourceConfig {
    pub locator: String,

    /// Plugin name, file stem or GUID; omitted means auto-detect
    pub plugin: Option<String>,

    #[serde(default)]
    pub position: InsertPosition,

    /// Provider-specific options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub plugins: Vec<PluginConfig>,
    pub mounts: Vec<MountConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Mount point configuration (resolved)
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub path: PathBuf,
    pub sources: Vec<SourceDescriptor>,
    pub options: MountOptions,
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config by merging mount overrides with defaults
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let RawConfig {
            logging,
            plugins,
            defaults,
            mounts,
        } = self;

        let mounts = mounts
            .into_iter()
            .map(|raw| Self::resolve_mount(&defaults, raw))
            .collect();

        Ok(Config {
            logging,
            plugins,
            mounts,
        })
    }

    fn resolve_mount(defaults: &MountDefaults, raw: RawMountConfig) -> MountConfig {
        let sources = raw
            .sources
            .into_iter()
            .map(|s| SourceDescriptor {
                plugin: s.plugin,
                locator: s.locator,
                position: s.position,
                options: s.options,
            })
            .collect();

        let overlay = raw
            .overlay_dir
            .map(|dir| SourceDescriptor::new(dir.to_string_lossy()).with_plugin("local"));

        let options = MountOptions {
            mount_point: raw.path.clone(),
            writable: raw.writable.unwrap_or(defaults.writable),
            metadata_file: raw.metadata_file,
            overlay,
            defer_copy: raw.defer_copy.unwrap_or(defaults.defer_copy),
            case_sensitive: raw.case_sensitive.unwrap_or(defaults.case_sensitive),
            policy: OverlayPolicy {
                copy_timeout: raw.copy_timeout.unwrap_or(defaults.copy_timeout),
                copy_retries: raw.copy_retries.unwrap_or(defaults.copy_retries),
                drain_timeout: raw.drain_timeout.unwrap_or(defaults.drain_timeout),
            },
        };

        MountConfig {
            path: raw.path,
            sources,
            options,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, substituting `${VAR}` references first
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        let raw: RawConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mounts.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one mount point is required".to_string(),
            ));
        }

        let mut paths = HashSet::new();
        for mount in &self.mounts {
            if !paths.insert(&mount.path) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate mount path: {:?}",
                    mount.path
                )));
            }
        }

        for mount in &self.mounts {
            if mount.sources.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Mount {:?} has no sources",
                    mount.path
                )));
            }
            if mount.sources.iter().any(|s| s.locator.is_empty()) {
                return Err(ConfigError::ValidationError(format!(
                    "Mount {:?}: source locator cannot be empty",
                    mount.path
                )));
            }
            if mount.options.writable && mount.options.metadata_file.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Mount {:?} is writable but has no metadata_file",
                    mount.path
                )));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
