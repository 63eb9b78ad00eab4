//! mergefs: a union filesystem mount engine
//!
//! Stacks several read-only sources into one virtual tree and, for writable
//! mounts, puts a deferred-copy overlay on top: files are copied up on first
//! mutation, deletions become tombstones, and overlay state survives
//! restarts through an append-only metadata log.
//!
//! # Architecture
//!
//! - **Sources**: providers (local directory, zip archive, in-memory) that
//!   implement the `Source` trait for path-based file operations.
//! - **Plugin registry**: loads providers, validates them and hands out
//!   generation-checked `PluginId`s.
//! - **Resolver**: merges the source stack and the overlay into one view.
//! - **Overlay**: copy-up, tombstones and attribute overrides, persisted by
//!   the `MetadataStore`.
//! - **Mount manager**: mount lifecycle; `FuseHook` serves mounts to the
//!   kernel, `NullHook` leaves them to the embedder.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mergefs::mount::{MountManager, MountOptions, NullHook};
//! use mergefs::plugin::PluginRegistry;
//! use mergefs::stack::{InsertPosition, SourceDescriptor};
//!
//! # async fn example() -> mergefs::Result<()> {
//! let registry = Arc::new(PluginRegistry::with_builtins());
//! let manager = MountManager::new(registry, Arc::new(NullHook));
//!
//! let sources = [
//!     SourceDescriptor::new("/srv/base"),
//!     SourceDescriptor::new("/srv/patch.zip").at(InsertPosition::Front),
//! ];
//! let id = manager
//!     .mount(&sources, MountOptions::writable("/mnt/merged", "/var/lib/mergefs/merged.log"))
//!     .await?;
//! let mount = manager.get(id)?;
//! let listing = mount.list_dir(&mergefs::path::VPath::root()).await?;
//! # let _ = listing;
//! manager.unmount(id).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod env;
pub mod error;
pub mod fuse;
pub mod handle;
pub mod last_error;
pub mod mount;
pub mod overlay;
pub mod path;
pub mod plugin;
pub mod resolver;
pub mod source;
pub mod stack;

pub use error::{MergeFsError, Result};
pub use handle::{MountId, PluginId};
pub use last_error::get_last_error;
pub use mount::{Mount, MountManager, MountOptions, NullHook, OsHook};
pub use path::VPath;
