//! Deferred-copy overlay
//!
//! The writable layer of a mount. Read-only layers are never mutated:
//! the first mutation of a path copies it up into the backing store,
//! deletions become tombstones, and every state change is logged to the
//! mount's `MetadataStore` after the physical change it describes.
//!
//! Renaming content that still lives in a read-only layer copies nothing.
//! The new name goes into a rename map pointing back at the path the
//! read-only layers hold it under, and lookups below the new name follow
//! the longest mapped prefix.

pub mod metadata;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, trace, warn};

use crate::error::{MergeFsError, Result};
use crate::overlay::metadata::{MetadataState, MetadataStore};
use crate::path::VPath;
use crate::resolver::{Owner, PathResolver};
use crate::source::{FileType, Source};

/// Reserved overlay directory holding in-progress copies
pub const STAGING_DIR: &str = ".mergefs-staging";

/// Copy-up transfer unit
pub const COPY_CHUNK_SIZE: u32 = 256 * 1024;

/// Bounds applied to copy-up, metadata flush and unmount drain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPolicy {
    /// Per-attempt bound on a copy-up and on a metadata flush
    pub copy_timeout: Duration,
    /// Extra attempts after a failed or timed-out copy-up
    pub copy_retries: u32,
    /// How long unmount waits for in-flight operations
    pub drain_timeout: Duration,
}

impl Default for OverlayPolicy {
    fn default() -> Self {
        Self {
            copy_timeout: Duration::from_secs(30),
            copy_retries: 2,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Read-only layer a copied-up object came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Layer(u32),
    /// Created in the overlay; directories with this origin hide lower layers
    Created,
}

/// What the overlay knows about a copied-up path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyUpRecord {
    /// Location inside the backing store
    pub overlay_path: VPath,
    pub origin: Origin,
    pub kind: FileType,
    pub size: u64,
    pub mtime: SystemTime,
    /// CRC-32 of the copied bytes (0 for directories and created objects)
    pub checksum: u32,
    pub mode: u32,
}

/// Overlay state of one virtual path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEntry {
    CopiedUp(CopyUpRecord),
    Tombstone,
    Unmodified,
}

/// Attribute changes stored without copying the object up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrOverride {
    pub mode: Option<u32>,
    pub mtime: Option<SystemTime>,
}

impl AttrOverride {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.mtime.is_none()
    }

    fn merge(self, newer: AttrOverride) -> AttrOverride {
        AttrOverride {
            mode: newer.mode.or(self.mode),
            mtime: newer.mtime.or(self.mtime),
        }
    }
}

/// Writable overlay bound to one mount
pub struct DeferredCopyOverlay {
    backing: Arc<dyn Source>,
    store: Arc<MetadataStore>,
    entries: DashMap<String, (VPath, OverlayEntry)>,
    attrs: DashMap<String, (VPath, AttrOverride)>,
    /// New path -> path the read-only layers hold it at
    renames: DashMap<String, (VPath, VPath)>,
    copy_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    case_sensitive: bool,
    policy: OverlayPolicy,
    cancelled: AtomicBool,
    copy_ups: AtomicU64,
    staging_seq: AtomicU64,
}

/// One file copy from a read-only layer into the backing store
struct FileCopy<'a> {
    source: &'a Arc<dyn Source>,
    /// Virtual path being copied up
    path: &'a VPath,
    /// Where the layer holds it
    location: &'a VPath,
    target: &'a VPath,
    size: u64,
    mode: u32,
    mtime: SystemTime,
}

fn staging_root() -> VPath {
    VPath::parse(STAGING_DIR).unwrap_or_else(|_| VPath::root())
}

fn is_reserved(path: &VPath) -> bool {
    path.components().next() == Some(STAGING_DIR)
}

fn ignore_unsupported(result: Result<()>) -> Result<()> {
    match result {
        Err(MergeFsError::NotSupported(_)) => Ok(()),
        other => other,
    }
}

impl DeferredCopyOverlay {
    /// Open the metadata log, recover state against the backing store and
    /// reset the staging area
    pub async fn attach(
        backing: Arc<dyn Source>,
        metadata_file: &Path,
        case_sensitive: bool,
        policy: OverlayPolicy,
    ) -> Result<Self> {
        if !backing.capabilities().can_back_overlay() {
            return Err(MergeFsError::SourceInit(format!(
                "{} cannot back a writable overlay",
                backing.locator()
            )));
        }

        let log_path = metadata_file.to_path_buf();
        let (store, state) =
            tokio::task::spawn_blocking(move || MetadataStore::open(&log_path, case_sensitive))
                .await
                .map_err(|e| MergeFsError::Io(std::io::Error::other(e)))??;

        let overlay = Self {
            backing,
            store: Arc::new(store),
            entries: DashMap::new(),
            attrs: DashMap::new(),
            renames: DashMap::new(),
            copy_locks: DashMap::new(),
            case_sensitive,
            policy,
            cancelled: AtomicBool::new(false),
            copy_ups: AtomicU64::new(0),
            staging_seq: AtomicU64::new(0),
        };
        overlay.reset_staging().await?;
        overlay.recover(state).await?;
        Ok(overlay)
    }

    /// Entries whose backing object vanished fall back to unmodified
    async fn recover(&self, state: MetadataState) -> Result<()> {
        let mut dropped = 0;
        for (key, (path, entry)) in state.entries {
            if let OverlayEntry::CopiedUp(record) = &entry {
                let present = match self.backing.stat(&record.overlay_path).await {
                    Ok(meta) => meta.file_type == record.kind,
                    Err(e) if e.is_not_found() => false,
                    Err(e) => return Err(e),
                };
                if !present {
                    warn!(
                        "Overlay object for {} missing at {}, treating as unmodified",
                        path, record.overlay_path
                    );
                    self.store.clear(&path)?;
                    dropped += 1;
                    continue;
                }
            }
            self.entries.insert(key, (path, entry));
        }
        for (key, value) in state.attrs {
            self.attrs.insert(key, value);
        }
        for (key, value) in state.renames {
            self.renames.insert(key, value);
        }
        if dropped > 0 {
            self.store.flush()?;
        }
        info!(
            "Overlay on {} recovered {} entries ({} dropped)",
            self.backing.locator(),
            self.entries.len(),
            dropped
        );
        Ok(())
    }

    /// Remove leftovers of interrupted copy-ups
    async fn reset_staging(&self) -> Result<()> {
        let staging = staging_root();
        match self.backing.stat(&staging).await {
            Ok(meta) if meta.is_dir() => {
                let mut stream = self.backing.list_dir(&staging);
                let mut leftovers = Vec::new();
                while let Some(entry) = stream.next().await {
                    leftovers.push(entry?.name);
                }
                for name in leftovers {
                    debug!("Removing stale staging object {}", name);
                    self.backing.remove_file(&staging.join(&name)?).await?;
                }
                Ok(())
            }
            Ok(_) => Err(MergeFsError::SourceInit(format!(
                "{}: {} is not a directory",
                self.backing.locator(),
                STAGING_DIR
            ))),
            Err(e) if e.is_not_found() => self.backing.create_dir(&staging, 0o700).await,
            Err(e) => Err(e),
        }
    }

    pub fn backing(&self) -> &Arc<dyn Source> {
        &self.backing
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn policy(&self) -> &OverlayPolicy {
        &self.policy
    }

    fn key(&self, path: &VPath) -> String {
        path.key(self.case_sensitive)
    }

    /// Current state of `path`
    pub fn entry(&self, path: &VPath) -> OverlayEntry {
        self.entries
            .get(&self.key(path))
            .map(|e| e.1.clone())
            .unwrap_or(OverlayEntry::Unmodified)
    }

    pub fn attr_override(&self, path: &VPath) -> Option<AttrOverride> {
        self.attrs.get(&self.key(path)).map(|a| a.1)
    }

    /// Path the read-only layers hold `path` at, following the deepest
    /// renamed ancestor (or `path` itself)
    pub fn lower_path(&self, path: &VPath) -> VPath {
        if self.renames.is_empty() {
            return path.clone();
        }
        let mut cur = path.clone();
        loop {
            if let Some(mapped) = self.renames.get(&self.key(&cur)) {
                let original = &mapped.value().1;
                return path.rebase(&cur, original).unwrap_or_else(|| original.clone());
            }
            cur = match cur.parent() {
                Some(parent) => parent,
                None => return path.clone(),
            };
        }
    }

    /// Renamed read-only paths whose new name lives directly in `dir`
    pub fn renamed_children(&self, dir: &VPath) -> Vec<VPath> {
        let dir_key = self.key(dir);
        self.renames
            .iter()
            .filter(|r| {
                r.value()
                    .0
                    .parent()
                    .is_some_and(|parent| self.key(&parent) == dir_key)
            })
            .map(|r| r.value().0.clone())
            .collect()
    }

    /// Number of physical copy-ups performed since attach
    pub fn copy_up_count(&self) -> u64 {
        self.copy_ups.load(Ordering::SeqCst)
    }

    pub fn tombstone_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().1 == OverlayEntry::Tombstone)
            .count()
    }

    /// Backing-store location for `path`: its own record if copied up,
    /// otherwise the nearest copied-up ancestor's location plus the rest
    pub fn physical_path(&self, path: &VPath) -> VPath {
        let mut tail = Vec::new();
        let mut cur = path.clone();
        let mut base = VPath::root();
        while !cur.is_root() {
            if let Some(entry) = self.entries.get(&self.key(&cur)) {
                if let OverlayEntry::CopiedUp(record) = &entry.1 {
                    base = record.overlay_path.clone();
                    break;
                }
            }
            if let Some(name) = cur.file_name() {
                tail.push(name.to_string());
            }
            cur = match cur.parent() {
                Some(parent) => parent,
                None => break,
            };
        }
        for name in tail.into_iter().rev() {
            if let Ok(next) = base.join(&name) {
                base = next;
            }
        }
        base
    }

    /// Abandon in-flight copy-ups and refuse new mutations
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("Overlay on {} cancelled", self.backing.locator());
        }
    }

    fn check_active(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(MergeFsError::Cancelled("mount is unmounting".to_string()))
        } else {
            Ok(())
        }
    }

    fn path_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.copy_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn release_lock(&self, key: &str) {
        self.copy_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Overlay location if already copied up; tombstoned paths are absent
    fn materialized(&self, key: &str, path: &VPath) -> Result<Option<VPath>> {
        match self.entries.get(key).map(|e| e.1.clone()) {
            Some(OverlayEntry::CopiedUp(record)) => Ok(Some(record.overlay_path)),
            Some(OverlayEntry::Tombstone) => Err(MergeFsError::NotFound(path.to_string())),
            _ => Ok(None),
        }
    }

    fn commit(&self, path: &VPath, record: CopyUpRecord) -> Result<()> {
        self.store.record_copy_up(path, &record)?;
        let key = self.key(path);
        self.attrs.remove(&key);
        self.entries
            .insert(key, (path.clone(), OverlayEntry::CopiedUp(record)));
        Ok(())
    }

    fn tombstone(&self, path: &VPath) -> Result<()> {
        self.store.record_tombstone(path)?;
        let key = self.key(path);
        self.attrs.remove(&key);
        self.renames.remove(&key);
        self.entries.insert(key, (path.clone(), OverlayEntry::Tombstone));
        Ok(())
    }

    fn set_rename(&self, path: &VPath, original: &VPath) -> Result<()> {
        self.store.record_rename(path, original)?;
        let key = self.key(path);
        if path == original {
            self.renames.remove(&key);
        } else {
            self.renames.insert(key, (path.clone(), original.clone()));
        }
        Ok(())
    }

    /// Keys (with their display paths) of every record matching `select`
    fn keys_where(&self, select: impl Fn(&str) -> bool) -> Vec<(String, VPath)> {
        let mut seen = std::collections::HashSet::new();
        self.entries
            .iter()
            .filter(|e| select(e.key().as_str()))
            .map(|e| (e.key().clone(), e.value().0.clone()))
            .chain(
                self.attrs
                    .iter()
                    .filter(|a| select(a.key().as_str()))
                    .map(|a| (a.key().clone(), a.value().0.clone())),
            )
            .chain(
                self.renames
                    .iter()
                    .filter(|r| select(r.key().as_str()))
                    .map(|r| (r.key().clone(), r.value().0.clone())),
            )
            .filter(|(key, _)| seen.insert(key.clone()))
            .collect()
    }

    fn forget(&self, keys: Vec<(String, VPath)>) -> Result<()> {
        for (key, path) in keys {
            let had_entry = self.entries.remove(&key).is_some();
            let had_attr = self.attrs.remove(&key).is_some();
            let had_rename = self.renames.remove(&key).is_some();
            if had_entry || had_attr || had_rename {
                self.store.clear(&path)?;
            }
        }
        Ok(())
    }

    /// Drop all state strictly below `dir`
    fn clear_descendants(&self, dir: &VPath) -> Result<()> {
        let prefix = format!("{}/", self.key(dir));
        self.forget(self.keys_where(|key| key.starts_with(&prefix)))
    }

    /// Drop all state at `path` itself
    fn clear_path(&self, path: &VPath) -> Result<()> {
        let key = self.key(path);
        self.forget(self.keys_where(|k| k == key))
    }

    /// Move every record at or below `from` to the same place below `to`.
    /// Copied-up locations move from `from_phys` to `to_phys`.
    fn move_records(
        &self,
        from: &VPath,
        to: &VPath,
        from_phys: &VPath,
        to_phys: &VPath,
    ) -> Result<()> {
        let from_key = self.key(from);
        let prefix = format!("{}/", from_key);
        let under = |key: &str| key == from_key || key.starts_with(&prefix);

        let entries: Vec<(VPath, OverlayEntry)> = self
            .entries
            .iter()
            .filter(|e| under(e.key().as_str()))
            .map(|e| e.value().clone())
            .collect();
        let attrs: Vec<(VPath, AttrOverride)> = self
            .attrs
            .iter()
            .filter(|a| under(a.key().as_str()))
            .map(|a| a.value().clone())
            .collect();
        let renames: Vec<(VPath, VPath)> = self
            .renames
            .iter()
            .filter(|r| under(r.key().as_str()))
            .map(|r| r.value().clone())
            .collect();
        self.forget(self.keys_where(under))?;

        for (old_path, entry) in entries {
            let Some(new_path) = old_path.rebase(from, to) else {
                continue;
            };
            match entry {
                OverlayEntry::CopiedUp(mut record) => {
                    if let Some(new_phys) = record.overlay_path.rebase(from_phys, to_phys) {
                        record.overlay_path = new_phys;
                    }
                    self.commit(&new_path, record)?;
                }
                OverlayEntry::Tombstone => self.tombstone(&new_path)?,
                OverlayEntry::Unmodified => {}
            }
        }
        for (old_path, attr) in attrs {
            if let Some(new_path) = old_path.rebase(from, to) {
                self.store.record_attr(&new_path, attr)?;
                self.attrs.insert(self.key(&new_path), (new_path, attr));
            }
        }
        for (old_path, original) in renames {
            if let Some(new_path) = old_path.rebase(from, to) {
                self.set_rename(&new_path, &original)?;
            }
        }
        Ok(())
    }

    /// Make `path` (and its ancestors) live in the overlay, copying it up
    /// from its resolving layer if needed. Returns the overlay location.
    pub async fn ensure_writable(&self, resolver: &PathResolver, path: &VPath) -> Result<VPath> {
        self.check_active()?;
        for ancestor in path.ancestors() {
            self.ensure_one(resolver, &ancestor).await?;
        }
        self.ensure_one(resolver, path).await
    }

    async fn ensure_one(&self, resolver: &PathResolver, path: &VPath) -> Result<VPath> {
        if path.is_root() {
            return Ok(VPath::root());
        }
        let key = self.key(path);
        if let Some(existing) = self.materialized(&key, path)? {
            return Ok(existing);
        }

        let lock = self.path_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            // Another writer may have finished the copy while we waited
            match self.materialized(&key, path) {
                Ok(Some(existing)) => Ok(existing),
                Ok(None) => self.copy_up(resolver, path).await,
                Err(e) => Err(e),
            }
        };
        drop(lock);
        self.release_lock(&key);
        result
    }

    /// Physical copy of one path. Directories are shallow.
    async fn copy_up(&self, resolver: &PathResolver, path: &VPath) -> Result<VPath> {
        let resolved = resolver.resolve(path).await?;
        let index = match resolved.owner {
            Owner::Layer(index) => index,
            Owner::Overlay => return Ok(self.physical_path(path)),
        };
        let source = resolver
            .stack()
            .source(index)
            .cloned()
            .ok_or_else(|| MergeFsError::NotFound(path.to_string()))?;

        let target = self.physical_path(path);
        let mode = resolved.metadata.mode_or_default();
        let mtime = resolved.metadata.mtime;

        let record = if resolved.metadata.is_dir() {
            match self.backing.create_dir(&target, mode).await {
                Ok(()) | Err(MergeFsError::AlreadyExists(_)) => {}
                Err(e) => return Err(MergeFsError::copy_up(path, e)),
            }
            ignore_unsupported(self.backing.set_mtime(&target, mtime).await)
                .map_err(|e| MergeFsError::copy_up(path, e))?;
            CopyUpRecord {
                overlay_path: target.clone(),
                origin: Origin::Layer(index as u32),
                kind: FileType::Directory,
                size: 0,
                mtime,
                checksum: 0,
                mode,
            }
        } else {
            let job = FileCopy {
                source: &source,
                path,
                location: &resolved.location,
                target: &target,
                size: resolved.metadata.size,
                mode,
                mtime,
            };
            let (size, checksum) = self.copy_file_with_retry(&job).await?;
            CopyUpRecord {
                overlay_path: target.clone(),
                origin: Origin::Layer(index as u32),
                kind: FileType::File,
                size,
                mtime,
                checksum,
                mode,
            }
        };

        self.commit(path, record)?;
        self.copy_ups.fetch_add(1, Ordering::SeqCst);
        debug!("Copied up {} from layer {} to {}", path, index, target);
        Ok(target)
    }

    async fn copy_file_with_retry(&self, job: &FileCopy<'_>) -> Result<(u64, u32)> {
        let path = job.path;
        let mut last_error = String::new();
        for attempt in 0..=self.policy.copy_retries {
            self.check_active()?;
            let copy = self.copy_file_once(job);
            match tokio::time::timeout(self.policy.copy_timeout, copy).await {
                Ok(Ok(done)) => return Ok(done),
                Ok(Err(MergeFsError::Cancelled(reason))) => {
                    return Err(MergeFsError::Cancelled(reason))
                }
                Ok(Err(e)) => {
                    warn!("Copy-up of {} failed (attempt {}): {}", path, attempt + 1, e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(
                        "Copy-up of {} timed out after {:?} (attempt {})",
                        path,
                        self.policy.copy_timeout,
                        attempt + 1
                    );
                    last_error = format!("timed out after {:?}", self.policy.copy_timeout);
                }
            }
        }
        Err(MergeFsError::copy_up(path, last_error))
    }

    /// Stream the file into a staging object, then rename it into place.
    /// The staging object is removed if this future fails or is dropped.
    async fn copy_file_once(&self, job: &FileCopy<'_>) -> Result<(u64, u32)> {
        let path = job.path;
        let seq = self.staging_seq.fetch_add(1, Ordering::SeqCst);
        let staging = staging_root().join(&format!("copy-{}", seq))?;
        self.backing.create_file(&staging, 0o600).await?;

        let backing = self.backing.clone();
        let cleanup = scopeguard::guard(staging.clone(), move |staging| {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = backing.remove_file(&staging).await {
                        debug!("Failed to remove staging object {}: {}", staging, e);
                    }
                });
            }
        });

        let mut hasher = crc32fast::Hasher::new();
        let mut offset = 0u64;
        while offset < job.size {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(MergeFsError::Cancelled(format!("copy-up of {}", path)));
            }
            let chunk = job.source.read(job.location, offset, COPY_CHUNK_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            hasher.update(&chunk);
            self.backing.write(&staging, offset, &chunk).await?;
            offset += chunk.len() as u64;
        }
        trace!("Staged {} bytes of {} at {}", offset, path, staging);

        ignore_unsupported(self.backing.set_mode(&staging, job.mode).await)?;
        ignore_unsupported(self.backing.set_mtime(&staging, job.mtime).await)?;
        self.backing.rename(&staging, job.target).await?;

        scopeguard::ScopeGuard::into_inner(cleanup);
        Ok((offset, hasher.finalize()))
    }

    /// Create a file or directory purely in the overlay
    pub async fn create(
        &self,
        resolver: &PathResolver,
        path: &VPath,
        kind: FileType,
        mode: u32,
    ) -> Result<()> {
        self.check_active()?;
        if is_reserved(path) {
            return Err(MergeFsError::PermissionDenied(path.to_string()));
        }
        let parent = path
            .parent()
            .ok_or_else(|| MergeFsError::AlreadyExists(path.to_string()))?;
        if !resolver.resolve(&parent).await?.metadata.is_dir() {
            return Err(MergeFsError::NotADirectory(parent.to_string()));
        }
        match resolver.resolve(path).await {
            Ok(_) => return Err(MergeFsError::AlreadyExists(path.to_string())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.ensure_writable(resolver, &parent).await?;

        let key = self.key(path);
        let lock = self.path_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.create_locked(path, kind, mode).await
        };
        drop(lock);
        self.release_lock(&key);
        result
    }

    async fn create_locked(&self, path: &VPath, kind: FileType, mode: u32) -> Result<()> {
        if matches!(self.entry(path), OverlayEntry::CopiedUp(_)) {
            return Err(MergeFsError::AlreadyExists(path.to_string()));
        }
        let target = self.physical_path(path);
        match kind {
            FileType::File => match self.backing.create_file(&target, mode).await {
                Err(MergeFsError::AlreadyExists(_)) => {
                    // Orphan from an interrupted operation; nothing references it
                    self.backing.remove_file(&target).await?;
                    self.backing.create_file(&target, mode).await?;
                }
                other => other?,
            },
            FileType::Directory => match self.backing.create_dir(&target, mode).await {
                Ok(()) | Err(MergeFsError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            },
        }
        let meta = self.backing.stat(&target).await?;
        self.commit(
            path,
            CopyUpRecord {
                overlay_path: target,
                origin: Origin::Created,
                kind,
                size: 0,
                mtime: meta.mtime,
                checksum: 0,
                mode: mode & 0o7777,
            },
        )?;
        debug!("Created {:?} {} in overlay", kind, path);
        Ok(())
    }

    /// Write through the overlay, copying up first
    pub async fn write(
        &self,
        resolver: &PathResolver,
        path: &VPath,
        offset: u64,
        data: &[u8],
    ) -> Result<u64> {
        let resolved = resolver.resolve(path).await?;
        if resolved.metadata.is_dir() {
            return Err(MergeFsError::IsADirectory(path.to_string()));
        }
        let target = self.ensure_writable(resolver, path).await?;
        self.backing.write(&target, offset, data).await
    }

    pub async fn truncate(&self, resolver: &PathResolver, path: &VPath, size: u64) -> Result<()> {
        let resolved = resolver.resolve(path).await?;
        if resolved.metadata.is_dir() {
            return Err(MergeFsError::IsADirectory(path.to_string()));
        }
        let target = self.ensure_writable(resolver, path).await?;
        self.backing.truncate(&target, size).await
    }

    /// Remove a file or an empty directory from the merged view
    pub async fn remove(&self, resolver: &PathResolver, path: &VPath, dir: bool) -> Result<()> {
        self.check_active()?;
        if path.is_root() || is_reserved(path) {
            return Err(MergeFsError::PermissionDenied(path.to_string()));
        }
        let resolved = resolver.resolve(path).await?;
        match (dir, resolved.metadata.is_dir()) {
            (true, false) => return Err(MergeFsError::NotADirectory(path.to_string())),
            (false, true) => return Err(MergeFsError::IsADirectory(path.to_string())),
            _ => {}
        }
        if dir && !resolver.list_dir(path).await?.is_empty() {
            return Err(MergeFsError::NotEmpty(path.to_string()));
        }

        let key = self.key(path);
        let lock = self.path_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.mark_deleted(path).await
        };
        drop(lock);
        self.release_lock(&key);
        result
    }

    /// Hide `path` from the merged view. A copied-up object is removed from
    /// the backing store first; the tombstone keeps lower layers hidden.
    pub async fn mark_deleted(&self, path: &VPath) -> Result<()> {
        if let OverlayEntry::CopiedUp(record) = self.entry(path) {
            let removed = match record.kind {
                FileType::Directory => self.backing.remove_dir(&record.overlay_path).await,
                FileType::File => self.backing.remove_file(&record.overlay_path).await,
            };
            match removed {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        self.tombstone(path)?;
        self.clear_descendants(path)?;
        debug!("Tombstoned {}", path);
        Ok(())
    }

    /// Copy a directory and everything visible beneath it into the overlay
    async fn deep_copy_up(&self, resolver: &PathResolver, dir: &VPath) -> Result<()> {
        let mut pending = vec![dir.clone()];
        while let Some(current) = pending.pop() {
            self.ensure_writable(resolver, &current).await?;
            for entry in resolver.list_dir(&current).await? {
                let child = current.join(&entry.name)?;
                if entry.metadata.is_dir() {
                    pending.push(child);
                } else {
                    self.ensure_writable(resolver, &child).await?;
                }
            }
        }
        Ok(())
    }

    /// Rename within the merged view. Overlay objects move physically;
    /// read-only content is remapped without copying, unless the new
    /// parent hides lower layers, in which case it is copied up first.
    pub async fn rename(&self, resolver: &PathResolver, from: &VPath, to: &VPath) -> Result<()> {
        self.check_active()?;
        if from.is_root() || to.is_root() || is_reserved(from) || is_reserved(to) {
            return Err(MergeFsError::PermissionDenied(format!("{} -> {}", from, to)));
        }
        if from == to {
            return Ok(());
        }
        let from_key = self.key(from);
        let to_key = self.key(to);
        if to_key.starts_with(&format!("{}/", from_key)) {
            return Err(MergeFsError::InvalidArgument(format!(
                "cannot move {} into itself",
                from
            )));
        }
        let case_only = from_key == to_key;

        let src = resolver.resolve(from).await?;
        let to_parent = to
            .parent()
            .ok_or_else(|| MergeFsError::InvalidPath(to.to_string()))?;
        let parent = resolver.resolve(&to_parent).await?;
        if !parent.metadata.is_dir() {
            return Err(MergeFsError::NotADirectory(to_parent.to_string()));
        }
        // Under a case-insensitive policy `to` resolves to `from` itself
        let dst = match resolver.resolve(to).await {
            Ok(resolved) if !case_only => Some(resolved),
            Ok(_) => None,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if let Some(dst) = &dst {
            match (src.metadata.is_dir(), dst.metadata.is_dir()) {
                (true, false) => return Err(MergeFsError::NotADirectory(to.to_string())),
                (false, true) => return Err(MergeFsError::IsADirectory(to.to_string())),
                (true, true) if !resolver.list_dir(to).await?.is_empty() => {
                    return Err(MergeFsError::NotEmpty(to.to_string()))
                }
                _ => {}
            }
        }

        let is_dir = src.metadata.is_dir();
        let lower_backed = !src.opaque && (is_dir || matches!(src.owner, Owner::Layer(_)));
        let remap = if lower_backed && parent.opaque {
            if is_dir {
                self.deep_copy_up(resolver, from).await?;
            } else {
                self.ensure_writable(resolver, from).await?;
            }
            false
        } else {
            lower_backed
        };
        if matches!(self.entry(from), OverlayEntry::CopiedUp(_)) {
            self.ensure_writable(resolver, &to_parent).await?;
        }

        // Lock both names in key order
        let (first, second) = if from_key < to_key {
            (&from_key, &to_key)
        } else {
            (&to_key, &from_key)
        };
        let first_lock = self.path_lock(first);
        let second_lock = (!case_only).then(|| self.path_lock(second));
        let result = {
            let _first = first_lock.lock().await;
            let _second = match &second_lock {
                Some(lock) => Some(lock.lock().await),
                None => None,
            };
            let opaque_dir = is_dir && src.opaque;
            self.rename_locked(from, to, is_dir, remap, opaque_dir).await
        };
        drop(first_lock);
        drop(second_lock);
        self.release_lock(&from_key);
        self.release_lock(&to_key);
        result
    }

    async fn rename_locked(
        &self,
        from: &VPath,
        to: &VPath,
        is_dir: bool,
        remap: bool,
        opaque_dir: bool,
    ) -> Result<()> {
        let case_only = self.key(from) == self.key(to);
        let original = self.lower_path(from);
        let from_phys = self.physical_path(from);
        let physical = matches!(self.entry(from), OverlayEntry::CopiedUp(_));
        let to_phys = match (case_only, to.file_name(), from_phys.parent()) {
            (true, Some(name), Some(dir)) => dir.join(name)?,
            _ => self.physical_path(to),
        };

        if !case_only {
            if let OverlayEntry::CopiedUp(existing) = self.entry(to) {
                // A file is replaced by the backing rename itself
                let removed = match existing.kind {
                    FileType::Directory => self.backing.remove_dir(&existing.overlay_path).await,
                    FileType::File if !physical => {
                        self.backing.remove_file(&existing.overlay_path).await
                    }
                    FileType::File => Ok(()),
                };
                match removed {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        if physical {
            self.backing.rename(&from_phys, &to_phys).await?;
        }

        // Whatever `to` carried is replaced wholesale
        if !case_only {
            self.clear_descendants(to)?;
            self.clear_path(to)?;
        }
        self.move_records(from, to, &from_phys, &to_phys)?;

        // Moved out from under a created directory; keep lower layers out
        if opaque_dir {
            if let OverlayEntry::CopiedUp(mut record) = self.entry(to) {
                if record.origin != Origin::Created {
                    record.origin = Origin::Created;
                    self.commit(to, record)?;
                }
            }
        }
        if remap {
            self.set_rename(to, &original)?;
        }
        if !case_only {
            self.tombstone(from)?;
        }
        debug!(
            "Renamed {} {} -> {}{}",
            if is_dir { "directory" } else { "file" },
            from,
            to,
            if remap { " (remapped)" } else { "" }
        );
        Ok(())
    }

    /// Change mode and/or mtime. Copied-up objects are changed in place;
    /// anything else gets an override record and no data copy.
    pub async fn set_attributes(
        &self,
        resolver: &PathResolver,
        path: &VPath,
        mode: Option<u32>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        self.check_active()?;
        resolver.resolve(path).await?;

        if let OverlayEntry::CopiedUp(record) = self.entry(path) {
            if let Some(mode) = mode {
                self.backing.set_mode(&record.overlay_path, mode).await?;
            }
            if let Some(mtime) = mtime {
                self.backing.set_mtime(&record.overlay_path, mtime).await?;
            }
            return Ok(());
        }

        let key = self.key(path);
        let update = AttrOverride {
            mode: mode.map(|m| m & 0o7777),
            mtime,
        };
        let merged = self
            .attrs
            .get(&key)
            .map(|a| a.1)
            .unwrap_or_default()
            .merge(update);
        self.store.record_attr(path, merged)?;
        self.attrs.insert(key, (path.clone(), merged));
        trace!("Attribute override for {}: {:?}", path, merged);
        Ok(())
    }

    /// Flush a copied-up object (if any) and the metadata log
    pub async fn flush(&self, path: &VPath) -> Result<()> {
        if let OverlayEntry::CopiedUp(record) = self.entry(path) {
            self.backing.flush(&record.overlay_path).await?;
        }
        self.flush_metadata().await
    }

    /// Make the metadata log durable, bounded by the copy timeout
    pub async fn flush_metadata(&self) -> Result<()> {
        let store = self.store.clone();
        let flush = tokio::task::spawn_blocking(move || store.flush());
        match tokio::time::timeout(self.policy.copy_timeout, flush).await {
            Ok(joined) => joined.map_err(|e| MergeFsError::Io(std::io::Error::other(e)))?,
            Err(_) => Err(MergeFsError::Timeout(format!(
                "metadata flush of {}",
                self.store.path().display()
            ))),
        }
    }

    /// Current state as the store would replay it
    pub fn snapshot(&self) -> MetadataState {
        MetadataState {
            entries: self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            attrs: self
                .attrs
                .iter()
                .map(|a| (a.key().clone(), a.value().clone()))
                .collect(),
            renames: self
                .renames
                .iter()
                .map(|r| (r.key().clone(), r.value().clone()))
                .collect(),
        }
    }

    /// Final flush on unmount; a clean shutdown also compacts the log
    pub async fn shutdown(&self, compact: bool) -> Result<()> {
        self.cancel();
        self.flush_metadata().await?;
        if compact {
            let store = self.store.clone();
            let state = self.snapshot();
            tokio::task::spawn_blocking(move || store.compact(&state))
                .await
                .map_err(|e| MergeFsError::Io(std::io::Error::other(e)))??;
        }
        Ok(())
    }
}
