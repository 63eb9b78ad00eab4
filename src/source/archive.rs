//! Read-only zip archive source

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use globset::{Glob, GlobMatcher};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;
use zip::ZipArchive;

use crate::error::{MergeFsError, Result};
use crate::path::VPath;
use crate::source::{
    Capabilities, DirEntry, DirEntryStream, FileType, Metadata, PluginInfo, Source, SourceOptions,
    SourceProvider,
};

pub const ARCHIVE_PROVIDER_GUID: Uuid =
    Uuid::from_u128(0x6d1c_2f4e_8a07_4b3e_9c51_0e2a_7f31_b002);

/// Provider for zip archives
pub struct ArchiveProvider {
    pattern: GlobMatcher,
}

impl ArchiveProvider {
    pub fn new() -> Result<Self> {
        let pattern = Glob::new("*.zip")
            .map_err(|e| MergeFsError::PluginLoad(e.to_string()))?
            .compile_matcher();
        Ok(Self { pattern })
    }
}

#[async_trait]
impl SourceProvider for ArchiveProvider {
    fn info(&self) -> PluginInfo {
        PluginInfo::source(
            ARCHIVE_PROVIDER_GUID,
            "archive",
            "Read-only zip archive",
            0x0001_0000,
        )
    }

    fn supports(&self, locator: &str) -> bool {
        let lowered = locator.to_ascii_lowercase();
        self.pattern.is_match(&lowered)
            && std::fs::metadata(locator)
                .map(|m| m.is_file())
                .unwrap_or(false)
    }

    async fn instantiate(&self, locator: &str, _options: &SourceOptions) -> Result<Arc<dyn Source>> {
        let source = ArchiveSource::open(locator).await?;
        Ok(Arc::new(source))
    }
}

#[derive(Debug, Clone)]
struct ArchiveNode {
    file_type: FileType,
    size: u64,
    index: Option<usize>,
    mode: Option<u32>,
}

/// Index of an archive: node per virtual path plus child names per directory
struct ArchiveIndex {
    nodes: HashMap<VPath, ArchiveNode>,
    children: HashMap<VPath, BTreeSet<String>>,
}

impl ArchiveIndex {
    fn new() -> Self {
        let mut index = Self {
            nodes: HashMap::new(),
            children: HashMap::new(),
        };
        index.add_dir(VPath::root());
        index
    }

    fn add_dir(&mut self, path: VPath) {
        self.children.entry(path.clone()).or_default();
        self.nodes.entry(path).or_insert(ArchiveNode {
            file_type: FileType::Directory,
            size: 0,
            index: None,
            mode: None,
        });
    }

    fn link(&mut self, path: &VPath) {
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            self.children
                .entry(parent)
                .or_default()
                .insert(name.to_string());
        }
    }

    fn insert(&mut self, path: VPath, node: ArchiveNode) {
        for ancestor in path.ancestors() {
            self.add_dir(ancestor.clone());
            self.link(&ancestor);
        }
        self.link(&path);
        if node.file_type == FileType::Directory {
            self.children.entry(path.clone()).or_default();
            // Explicit directory entries carry their mode, synthesized ones don't
            let slot = self.nodes.entry(path).or_insert(node.clone());
            slot.mode = node.mode.or(slot.mode);
        } else {
            self.nodes.insert(path, node);
        }
    }
}

/// A zip archive exposed as a read-only tree
pub struct ArchiveSource {
    path: PathBuf,
    mtime: SystemTime,
    archive: Arc<Mutex<ZipArchive<File>>>,
    index: ArchiveIndex,
}

fn zip_err(e: zip::result::ZipError) -> MergeFsError {
    MergeFsError::Io(io::Error::other(e))
}

impl ArchiveSource {
    pub async fn open(locator: &str) -> Result<Self> {
        let path = PathBuf::from(locator);
        let path_clone = path.clone();

        let (archive, index, mtime) = tokio::task::spawn_blocking(move || -> Result<_> {
            let file = File::open(&path_clone)
                .map_err(|e| MergeFsError::SourceInit(format!("{}: {}", path_clone.display(), e)))?;
            let mtime = file
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let mut archive = ZipArchive::new(file).map_err(|e| {
                MergeFsError::SourceInit(format!("{}: {}", path_clone.display(), e))
            })?;

            let mut index = ArchiveIndex::new();
            for i in 0..archive.len() {
                let entry = archive.by_index(i).map_err(|e| {
                    MergeFsError::SourceInit(format!("{}: entry {}: {}", path_clone.display(), i, e))
                })?;
                let vpath = match VPath::parse(entry.name()) {
                    Ok(p) if !p.is_root() => p,
                    _ => {
                        warn!("Skipping unsafe archive entry name {:?}", entry.name());
                        continue;
                    }
                };
                let node = if entry.is_dir() {
                    ArchiveNode {
                        file_type: FileType::Directory,
                        size: 0,
                        index: None,
                        mode: entry.unix_mode(),
                    }
                } else {
                    ArchiveNode {
                        file_type: FileType::File,
                        size: entry.size(),
                        index: Some(i),
                        mode: entry.unix_mode(),
                    }
                };
                index.insert(vpath, node);
            }
            Ok((archive, index, mtime))
        })
        .await
        .map_err(|e| MergeFsError::SourceInit(e.to_string()))??;

        debug!(
            "Opened archive {} with {} nodes",
            path.display(),
            index.nodes.len()
        );
        Ok(Self {
            path,
            mtime,
            archive: Arc::new(Mutex::new(archive)),
            index,
        })
    }

    fn node(&self, path: &VPath) -> Result<&ArchiveNode> {
        self.index
            .nodes
            .get(path)
            .ok_or_else(|| MergeFsError::NotFound(path.to_string()))
    }

    fn metadata(&self, node: &ArchiveNode) -> Metadata {
        let base = match node.file_type {
            FileType::File => Metadata::file(node.size, self.mtime),
            FileType::Directory => Metadata::directory(self.mtime),
        };
        match node.mode {
            Some(mode) => base.with_mode(mode),
            None => base,
        }
    }
}

#[async_trait]
impl Source for ArchiveSource {
    fn capabilities(&self) -> Capabilities {
        Capabilities::read_only()
    }

    fn locator(&self) -> String {
        self.path.display().to_string()
    }

    async fn stat(&self, path: &VPath) -> Result<Metadata> {
        let node = self.node(path)?;
        Ok(self.metadata(node))
    }

    fn list_dir(&self, path: &VPath) -> DirEntryStream {
        let items: Vec<Result<DirEntry>> = match self.index.children.get(path) {
            Some(names) => names
                .iter()
                .filter_map(|name| {
                    let child = path.join(name).ok()?;
                    let node = self.index.nodes.get(&child)?;
                    Some(Ok(DirEntry::new(name.clone(), self.metadata(node))))
                })
                .collect(),
            None if self.index.nodes.contains_key(path) => {
                vec![Err(MergeFsError::NotADirectory(path.to_string()))]
            }
            None => vec![Err(MergeFsError::NotFound(path.to_string()))],
        };
        Box::pin(futures::stream::iter(items))
    }

    async fn read(&self, path: &VPath, offset: u64, size: u32) -> Result<Bytes> {
        let node = self.node(path)?;
        let index = node
            .index
            .ok_or_else(|| MergeFsError::IsADirectory(path.to_string()))?;
        if offset >= node.size {
            return Ok(Bytes::new());
        }

        let archive = self.archive.clone();
        tokio::task::spawn_blocking(move || -> Result<Bytes> {
            let mut archive = archive.lock();
            let mut entry = archive.by_index(index).map_err(zip_err)?;
            // Compressed entries are not seekable; skip forward to the offset
            io::copy(&mut (&mut entry).take(offset), &mut io::sink())?;
            let mut buf = Vec::with_capacity(size as usize);
            entry.take(size as u64).read_to_end(&mut buf)?;
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| MergeFsError::Io(io::Error::other(e)))?
    }
}
