//! In-memory source
//!
//! Named volumes live as long as the provider, so every instance bound to
//! the same `mem:<name>` locator shares one tree. `NULLFS` binds a fresh
//! empty volume.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{MergeFsError, Result};
use crate::path::VPath;
use crate::source::{
    option_flag, Capabilities, DirEntry, DirEntryStream, FileType, Metadata, PluginInfo, Source,
    SourceOptions, SourceProvider, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE,
};

pub const MEMORY_PROVIDER_GUID: Uuid = Uuid::from_u128(0x6d1c_2f4e_8a07_4b3e_9c51_0e2a_7f31_b003);

const VOLUME_PREFIX: &str = "mem:";
const NULL_LOCATOR: &str = "NULLFS";

/// Largest file a memory volume will grow
pub const MAX_FILE_SIZE: u64 = 1 << 32;

/// In-memory length of a file extended to `offset + len` bytes
fn checked_end(path: &VPath, offset: u64, len: usize) -> Result<usize> {
    offset
        .checked_add(len as u64)
        .filter(|end| *end <= MAX_FILE_SIZE)
        .and_then(|end| usize::try_from(end).ok())
        .ok_or_else(|| {
            MergeFsError::InvalidArgument(format!(
                "{}: {} bytes at offset {} exceeds the volume file limit",
                path, len, offset
            ))
        })
}

#[derive(Debug, Clone)]
struct Node {
    file_type: FileType,
    data: Vec<u8>,
    mtime: SystemTime,
    mode: u32,
}

impl Node {
    fn dir(mode: u32) -> Self {
        Self {
            file_type: FileType::Directory,
            data: Vec::new(),
            mtime: SystemTime::now(),
            mode,
        }
    }

    fn file(data: Vec<u8>, mode: u32) -> Self {
        Self {
            file_type: FileType::File,
            data,
            mtime: SystemTime::now(),
            mode,
        }
    }

    fn metadata(&self) -> Metadata {
        let base = match self.file_type {
            FileType::File => Metadata::file(self.data.len() as u64, self.mtime),
            FileType::Directory => Metadata::directory(self.mtime),
        };
        base.with_mode(self.mode)
    }
}

/// Shared tree behind one or more memory sources
pub struct MemoryVolume {
    nodes: RwLock<BTreeMap<VPath, Node>>,
    reads: AtomicUsize,
}

impl Default for MemoryVolume {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(VPath::root(), Node::dir(DEFAULT_DIR_MODE));
        Self {
            nodes: RwLock::new(nodes),
            reads: AtomicUsize::new(0),
        }
    }
}

impl MemoryVolume {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a file, creating missing parent directories
    pub fn insert_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = VPath::parse(path)?;
        let mut nodes = self.nodes.write();
        for ancestor in path.ancestors() {
            nodes
                .entry(ancestor)
                .or_insert_with(|| Node::dir(DEFAULT_DIR_MODE));
        }
        nodes.insert(path, Node::file(data.to_vec(), DEFAULT_FILE_MODE));
        Ok(())
    }

    /// Insert a directory, creating missing parents
    pub fn insert_dir(&self, path: &str) -> Result<()> {
        let path = VPath::parse(path)?;
        let mut nodes = self.nodes.write();
        for ancestor in path.ancestors() {
            nodes
                .entry(ancestor)
                .or_insert_with(|| Node::dir(DEFAULT_DIR_MODE));
        }
        nodes.insert(path, Node::dir(DEFAULT_DIR_MODE));
        Ok(())
    }

    /// Raw file content, bypassing the read counter
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let path = VPath::parse(path).ok()?;
        self.nodes
            .read()
            .get(&path)
            .filter(|n| n.file_type == FileType::File)
            .map(|n| n.data.clone())
    }

    /// Number of `read` calls served since creation
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

/// Provider for in-memory sources
#[derive(Default)]
pub struct MemoryProvider {
    volumes: DashMap<String, Arc<MemoryVolume>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the named volume
    pub fn volume(&self, name: &str) -> Arc<MemoryVolume> {
        self.volumes
            .entry(name.to_string())
            .or_insert_with(MemoryVolume::new)
            .clone()
    }
}

#[async_trait]
impl SourceProvider for MemoryProvider {
    fn info(&self) -> PluginInfo {
        PluginInfo::source(
            MEMORY_PROVIDER_GUID,
            "memory",
            "In-memory scratch tree",
            0x0001_0000,
        )
    }

    fn supports(&self, locator: &str) -> bool {
        locator.starts_with(VOLUME_PREFIX) || locator == NULL_LOCATOR
    }

    async fn instantiate(&self, locator: &str, options: &SourceOptions) -> Result<Arc<dyn Source>> {
        let read_only = option_flag(options, "read_only")?;
        let volume = if locator == NULL_LOCATOR {
            MemoryVolume::new()
        } else if let Some(name) = locator.strip_prefix(VOLUME_PREFIX) {
            self.volume(name)
        } else {
            return Err(MergeFsError::SourceInit(format!(
                "memory provider cannot open '{}'",
                locator
            )));
        };
        Ok(Arc::new(MemorySource {
            locator: locator.to_string(),
            volume,
            read_only,
        }))
    }
}

/// A source view over a memory volume
pub struct MemorySource {
    locator: String,
    volume: Arc<MemoryVolume>,
    read_only: bool,
}

impl MemorySource {
    pub fn new(volume: Arc<MemoryVolume>, read_only: bool) -> Self {
        Self {
            locator: "mem:<anonymous>".to_string(),
            volume,
            read_only,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(MergeFsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn check_parent(nodes: &BTreeMap<VPath, Node>, path: &VPath) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| MergeFsError::AlreadyExists(path.to_string()))?;
        match nodes.get(&parent) {
            Some(n) if n.file_type == FileType::Directory => Ok(()),
            Some(_) => Err(MergeFsError::NotADirectory(parent.to_string())),
            None => Err(MergeFsError::NotFound(parent.to_string())),
        }
    }
}

fn children_of<'a>(
    nodes: &'a BTreeMap<VPath, Node>,
    dir: &'a VPath,
) -> impl Iterator<Item = (&'a VPath, &'a Node)> + 'a {
    nodes
        .iter()
        .filter(move |(p, _)| p.parent().as_ref() == Some(dir))
}

#[async_trait]
impl Source for MemorySource {
    fn capabilities(&self) -> Capabilities {
        if self.read_only {
            Capabilities::read_only()
        } else {
            Capabilities::full()
        }
    }

    fn locator(&self) -> String {
        self.locator.clone()
    }

    async fn stat(&self, path: &VPath) -> Result<Metadata> {
        self.volume
            .nodes
            .read()
            .get(path)
            .map(Node::metadata)
            .ok_or_else(|| MergeFsError::NotFound(path.to_string()))
    }

    fn list_dir(&self, path: &VPath) -> DirEntryStream {
        let nodes = self.volume.nodes.read();
        let result: Result<Vec<DirEntry>> = match nodes.get(path) {
            None => Err(MergeFsError::NotFound(path.to_string())),
            Some(n) if n.file_type != FileType::Directory => {
                Err(MergeFsError::NotADirectory(path.to_string()))
            }
            Some(_) => Ok(children_of(&nodes, path)
                .filter_map(|(p, n)| p.file_name().map(|name| DirEntry::new(name, n.metadata())))
                .collect()),
        };
        let items: Vec<Result<DirEntry>> = match result {
            Ok(entries) => entries.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        };
        Box::pin(futures::stream::iter(items))
    }

    async fn read(&self, path: &VPath, offset: u64, size: u32) -> Result<Bytes> {
        self.volume.reads.fetch_add(1, Ordering::SeqCst);
        let nodes = self.volume.nodes.read();
        let node = nodes
            .get(path)
            .ok_or_else(|| MergeFsError::NotFound(path.to_string()))?;
        if node.file_type == FileType::Directory {
            return Err(MergeFsError::IsADirectory(path.to_string()));
        }
        let start = (offset as usize).min(node.data.len());
        let end = start.saturating_add(size as usize).min(node.data.len());
        Ok(Bytes::copy_from_slice(&node.data[start..end]))
    }

    async fn write(&self, path: &VPath, offset: u64, data: &[u8]) -> Result<u64> {
        self.check_writable()?;
        let mut nodes = self.volume.nodes.write();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| MergeFsError::NotFound(path.to_string()))?;
        if node.file_type == FileType::Directory {
            return Err(MergeFsError::IsADirectory(path.to_string()));
        }
        let end = checked_end(path, offset, data.len())?;
        let offset = end - data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset..end].copy_from_slice(data);
        node.mtime = SystemTime::now();
        Ok(data.len() as u64)
    }

    async fn create_file(&self, path: &VPath, mode: u32) -> Result<()> {
        self.check_writable()?;
        let mut nodes = self.volume.nodes.write();
        Self::check_parent(&nodes, path)?;
        if nodes.contains_key(path) {
            return Err(MergeFsError::AlreadyExists(path.to_string()));
        }
        nodes.insert(path.clone(), Node::file(Vec::new(), mode & 0o7777));
        Ok(())
    }

    async fn create_dir(&self, path: &VPath, mode: u32) -> Result<()> {
        self.check_writable()?;
        let mut nodes = self.volume.nodes.write();
        Self::check_parent(&nodes, path)?;
        if nodes.contains_key(path) {
            return Err(MergeFsError::AlreadyExists(path.to_string()));
        }
        nodes.insert(path.clone(), Node::dir(mode & 0o7777));
        Ok(())
    }

    async fn remove_file(&self, path: &VPath) -> Result<()> {
        self.check_writable()?;
        let mut nodes = self.volume.nodes.write();
        match nodes.get(path) {
            None => Err(MergeFsError::NotFound(path.to_string())),
            Some(n) if n.file_type == FileType::Directory => {
                Err(MergeFsError::IsADirectory(path.to_string()))
            }
            Some(_) => {
                nodes.remove(path);
                Ok(())
            }
        }
    }

    async fn remove_dir(&self, path: &VPath) -> Result<()> {
        self.check_writable()?;
        let mut nodes = self.volume.nodes.write();
        match nodes.get(path) {
            None => return Err(MergeFsError::NotFound(path.to_string())),
            Some(n) if n.file_type != FileType::Directory => {
                return Err(MergeFsError::NotADirectory(path.to_string()))
            }
            Some(_) => {}
        }
        if children_of(&nodes, path).next().is_some() {
            return Err(MergeFsError::NotEmpty(path.to_string()));
        }
        nodes.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &VPath, to: &VPath) -> Result<()> {
        self.check_writable()?;
        let mut nodes = self.volume.nodes.write();
        if !nodes.contains_key(from) {
            return Err(MergeFsError::NotFound(from.to_string()));
        }
        Self::check_parent(&nodes, to)?;
        let moved: Vec<VPath> = nodes
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for old in moved {
            if let (Some(node), Some(new)) = (nodes.remove(&old), old.rebase(from, to)) {
                nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn truncate(&self, path: &VPath, size: u64) -> Result<()> {
        self.check_writable()?;
        let mut nodes = self.volume.nodes.write();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| MergeFsError::NotFound(path.to_string()))?;
        let size = checked_end(path, size, 0)?;
        node.data.resize(size, 0);
        node.mtime = SystemTime::now();
        Ok(())
    }

    async fn set_mode(&self, path: &VPath, mode: u32) -> Result<()> {
        self.check_writable()?;
        let mut nodes = self.volume.nodes.write();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| MergeFsError::NotFound(path.to_string()))?;
        node.mode = mode & 0o7777;
        Ok(())
    }

    async fn set_mtime(&self, path: &VPath, mtime: SystemTime) -> Result<()> {
        self.check_writable()?;
        let mut nodes = self.volume.nodes.write();
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| MergeFsError::NotFound(path.to_string()))?;
        node.mtime = mtime;
        Ok(())
    }
}
