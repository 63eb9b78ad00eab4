//! Path resolution across a source stack
//!
//! A path exists only if its parent resolves to a directory. Among the
//! overlay and the read-only layers, the first to hold the path wins;
//! directory listings are the union of every layer holding a directory at
//! that path. Overlay tombstones hide names regardless of which layer
//! provides them, and directories created in the overlay are opaque.
//! Renamed read-only content is found through the overlay's rename map:
//! lower layers are consulted at the path the content was renamed from.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use tracing::trace;

use crate::error::{MergeFsError, Result};
use crate::overlay::{DeferredCopyOverlay, OverlayEntry, Origin, STAGING_DIR};
use crate::path::{fold, VPath};
use crate::source::{DirEntry, FileType, Metadata};
use crate::stack::SourceStack;

/// Who serves a resolved path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Overlay,
    Layer(usize),
}

/// Result of a successful resolve
#[derive(Debug, Clone)]
pub struct Resolved {
    pub owner: Owner,
    pub metadata: Metadata,
    /// Lower layers are hidden beneath this node
    pub opaque: bool,
    /// Where the owner holds the object: the backing-store path for the
    /// overlay, the pre-rename path for a read-only layer
    pub location: VPath,
}

/// Read path over one mount's layers
pub struct PathResolver {
    stack: Arc<SourceStack>,
    overlay: Option<Arc<DeferredCopyOverlay>>,
    case_sensitive: bool,
    /// First read-only hit per lower path. The read-only layers never
    /// change while mounted, so entries never go stale.
    lower_cache: DashMap<VPath, Option<(usize, FileType)>>,
}

/// Missing and not-a-directory both mean "absent in this layer"
fn is_absent(e: &MergeFsError) -> bool {
    e.is_not_found() || matches!(e, MergeFsError::NotADirectory(_))
}

impl PathResolver {
    pub fn new(
        stack: Arc<SourceStack>,
        overlay: Option<Arc<DeferredCopyOverlay>>,
        case_sensitive: bool,
    ) -> Self {
        Self {
            stack,
            overlay,
            case_sensitive,
            lower_cache: DashMap::new(),
        }
    }

    pub fn stack(&self) -> &Arc<SourceStack> {
        &self.stack
    }

    pub fn overlay(&self) -> Option<&Arc<DeferredCopyOverlay>> {
        self.overlay.as_ref()
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn overlay_entry(&self, path: &VPath) -> OverlayEntry {
        self.overlay
            .as_ref()
            .map(|o| o.entry(path))
            .unwrap_or(OverlayEntry::Unmodified)
    }

    /// Path the read-only layers hold `path` at
    fn lower_path(&self, path: &VPath) -> VPath {
        match &self.overlay {
            Some(overlay) => overlay.lower_path(path),
            None => path.clone(),
        }
    }

    /// First read-only layer holding `path`
    pub async fn lower_lookup(&self, path: &VPath) -> Result<Option<(usize, Metadata)>> {
        for (index, layer) in self.stack.layers().iter().enumerate() {
            match layer.source.stat(path).await {
                Ok(meta) => return Ok(Some((index, meta))),
                Err(e) if is_absent(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn lower_kind_cached(&self, path: &VPath) -> Result<Option<(usize, FileType)>> {
        if let Some(hit) = self.lower_cache.get(path) {
            return Ok(*hit);
        }
        let found = self
            .lower_lookup(path)
            .await?
            .map(|(index, meta)| (index, meta.file_type));
        self.lower_cache.insert(path.clone(), found);
        Ok(found)
    }

    /// Check every proper ancestor resolves to a directory. Returns whether
    /// lower layers are hidden at `path`.
    async fn check_ancestors(&self, path: &VPath) -> Result<bool> {
        let mut opaque = false;
        for ancestor in path.ancestors() {
            match self.overlay_entry(&ancestor) {
                OverlayEntry::Tombstone => return Err(MergeFsError::NotFound(path.to_string())),
                OverlayEntry::CopiedUp(rec) => {
                    if rec.kind != FileType::Directory {
                        return Err(MergeFsError::NotFound(path.to_string()));
                    }
                    if rec.origin == Origin::Created {
                        opaque = true;
                    }
                }
                OverlayEntry::Unmodified => {
                    if opaque {
                        return Err(MergeFsError::NotFound(path.to_string()));
                    }
                    match self.lower_kind_cached(&self.lower_path(&ancestor)).await? {
                        Some((_, FileType::Directory)) => {}
                        _ => return Err(MergeFsError::NotFound(path.to_string())),
                    }
                }
            }
        }
        Ok(opaque)
    }

    /// Effective entry for `path`
    pub async fn resolve(&self, path: &VPath) -> Result<Resolved> {
        trace!("resolve: {}", path);
        if path.is_root() {
            return self.resolve_root().await;
        }

        let opaque = self.check_ancestors(path).await?;
        match self.overlay_entry(path) {
            OverlayEntry::Tombstone => Err(MergeFsError::NotFound(path.to_string())),
            OverlayEntry::CopiedUp(rec) => {
                let overlay = self
                    .overlay
                    .as_ref()
                    .ok_or_else(|| MergeFsError::NotFound(path.to_string()))?;
                let metadata = overlay.backing().stat(&rec.overlay_path).await?;
                Ok(Resolved {
                    owner: Owner::Overlay,
                    metadata,
                    opaque: opaque || rec.origin == Origin::Created,
                    location: rec.overlay_path,
                })
            }
            OverlayEntry::Unmodified => {
                if opaque {
                    return Err(MergeFsError::NotFound(path.to_string()));
                }
                let location = self.lower_path(path);
                let (index, metadata) = self
                    .lower_lookup(&location)
                    .await?
                    .ok_or_else(|| MergeFsError::NotFound(path.to_string()))?;
                Ok(Resolved {
                    owner: Owner::Layer(index),
                    metadata: self.apply_overrides(path, metadata),
                    opaque: false,
                    location,
                })
            }
        }
    }

    /// The root belongs to the top source
    async fn resolve_root(&self) -> Result<Resolved> {
        let root = VPath::root();
        let top = self
            .stack
            .source(0)
            .ok_or_else(|| MergeFsError::NotFound(root.to_string()))?;
        let metadata = top.stat(&root).await?;
        Ok(Resolved {
            owner: Owner::Layer(0),
            metadata: self.apply_overrides(&root, metadata),
            opaque: false,
            location: root,
        })
    }

    fn apply_overrides(&self, path: &VPath, mut metadata: Metadata) -> Metadata {
        if let Some(attr) = self.overlay.as_ref().and_then(|o| o.attr_override(path)) {
            if let Some(mode) = attr.mode {
                metadata.mode = Some(mode);
            }
            if let Some(mtime) = attr.mtime {
                metadata.mtime = mtime;
            }
        }
        metadata
    }

    /// Which layer serves `path`
    pub async fn owning_layer(&self, path: &VPath) -> Result<Owner> {
        Ok(self.resolve(path).await?.owner)
    }

    /// Merged listing of a directory
    pub async fn list_dir(&self, path: &VPath) -> Result<Vec<DirEntry>> {
        let resolved = self.resolve(path).await?;
        if !resolved.metadata.is_dir() {
            return Err(MergeFsError::NotADirectory(path.to_string()));
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut entries = Vec::new();

        // Overlay children first; only objects with a CopiedUp record count
        if let Some(overlay) = &self.overlay {
            let in_overlay = path.is_root() || resolved.owner == Owner::Overlay;
            if in_overlay {
                let physical = overlay.physical_path(path);
                let mut stream = overlay.backing().list_dir(&physical);
                while let Some(item) = stream.next().await {
                    let entry = match item {
                        Ok(entry) => entry,
                        Err(e) if is_absent(&e) => break,
                        Err(e) => return Err(e),
                    };
                    if path.is_root() && entry.name == STAGING_DIR {
                        continue;
                    }
                    let child = path.join(&entry.name)?;
                    if !matches!(overlay.entry(&child), OverlayEntry::CopiedUp(_)) {
                        continue;
                    }
                    if seen.insert(fold(&entry.name, self.case_sensitive).into_owned()) {
                        entries.push(entry);
                    }
                }
            }
        }

        if resolved.opaque {
            return Ok(entries);
        }

        // Read-only content renamed into this directory
        if let Some(overlay) = &self.overlay {
            for child in overlay.renamed_children(path) {
                let Some(name) = child.file_name() else {
                    continue;
                };
                if seen.contains(fold(name, self.case_sensitive).as_ref()) {
                    continue;
                }
                match self.resolve(&child).await {
                    Ok(found) => {
                        seen.insert(fold(name, self.case_sensitive).into_owned());
                        entries.push(DirEntry::new(name, found.metadata));
                    }
                    Err(e) if is_absent(&e) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let lower = self.lower_path(path);
        for layer in self.stack.layers() {
            let mut stream = layer.source.list_dir(&lower);
            while let Some(item) = stream.next().await {
                let entry = match item {
                    Ok(entry) => entry,
                    // This layer has no directory here
                    Err(e) if is_absent(&e) => break,
                    Err(e) => return Err(e),
                };
                if !seen.insert(fold(&entry.name, self.case_sensitive).into_owned()) {
                    continue;
                }
                let child = path.join(&entry.name)?;
                match self.overlay_entry(&child) {
                    OverlayEntry::Tombstone => continue,
                    // Listed from the overlay already, or hidden by a missing backing object
                    OverlayEntry::CopiedUp(_) => continue,
                    OverlayEntry::Unmodified => {}
                }
                let metadata = self.apply_overrides(&child, entry.metadata);
                entries.push(DirEntry::new(entry.name, metadata));
            }
        }
        Ok(entries)
    }
}
