//! Inode management for path <-> inode mapping
//!
//! The kernel addresses files by inode number while mounts work with
//! virtual paths. Numbers are handed out on first lookup and never reused
//! for the life of the session.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::path::VPath;

/// Root directory inode (always 1 in FUSE)
pub const ROOT_INODE: u64 = 1;

/// Bidirectional inode <-> path table
pub struct InodeTable {
    inode_to_path: DashMap<u64, VPath>,
    path_to_inode: DashMap<VPath, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            inode_to_path: DashMap::new(),
            path_to_inode: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };
        table.inode_to_path.insert(ROOT_INODE, VPath::root());
        table.path_to_inode.insert(VPath::root(), ROOT_INODE);
        table
    }

    /// Get the inode for a path, allocating one on first sight
    pub fn get_or_create_inode(&self, path: &VPath) -> u64 {
        if let Some(inode) = self.path_to_inode.get(path) {
            return *inode;
        }
        match self.path_to_inode.entry(path.clone()) {
            Entry::Occupied(existing) => *existing.get(),
            Entry::Vacant(slot) => {
                let inode = self.next_inode.fetch_add(1, Ordering::SeqCst);
                self.inode_to_path.insert(inode, path.clone());
                slot.insert(inode);
                inode
            }
        }
    }

    pub fn get_path(&self, inode: u64) -> Option<VPath> {
        self.inode_to_path.get(&inode).map(|p| p.clone())
    }

    pub fn get_inode(&self, path: &VPath) -> Option<u64> {
        self.path_to_inode.get(path).map(|i| *i)
    }

    /// Forget a path and everything below it
    pub fn remove_path(&self, path: &VPath) {
        let doomed: Vec<VPath> = self
            .path_to_inode
            .iter()
            .filter(|e| e.key().starts_with(path))
            .map(|e| e.key().clone())
            .collect();
        for p in doomed {
            if let Some((_, inode)) = self.path_to_inode.remove(&p) {
                self.inode_to_path.remove(&inode);
            }
        }
    }

    /// Move a path and everything below it, keeping inode numbers
    pub fn rename_path(&self, old: &VPath, new: &VPath) {
        self.remove_path(new);
        let moved: Vec<(VPath, u64)> = self
            .path_to_inode
            .iter()
            .filter(|e| e.key().starts_with(old))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for (path, inode) in moved {
            let Some(renamed) = path.rebase(old, new) else {
                continue;
            };
            self.path_to_inode.remove(&path);
            self.inode_to_path.insert(inode, renamed.clone());
            self.path_to_inode.insert(renamed, inode);
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp(s: &str) -> VPath {
        VPath::parse(s).unwrap()
    }

    #[test]
    fn test_root_inode() {
        let table = InodeTable::new();
        assert_eq!(table.get_inode(&VPath::root()), Some(ROOT_INODE));
        assert_eq!(table.get_path(ROOT_INODE), Some(VPath::root()));
    }

    #[test]
    fn test_get_or_create() {
        let table = InodeTable::new();
        let inode1 = table.get_or_create_inode(&vp("/foo"));
        let inode2 = table.get_or_create_inode(&vp("/foo"));
        assert_eq!(inode1, inode2);
        assert_ne!(inode1, ROOT_INODE);
        assert_eq!(table.get_path(inode1), Some(vp("/foo")));
    }

    #[test]
    fn test_remove_drops_descendants() {
        let table = InodeTable::new();
        let dir = table.get_or_create_inode(&vp("/d"));
        let child = table.get_or_create_inode(&vp("/d/x"));
        let sibling = table.get_or_create_inode(&vp("/d-other"));

        table.remove_path(&vp("/d"));
        assert!(table.get_path(dir).is_none());
        assert!(table.get_path(child).is_none());
        assert_eq!(table.get_path(sibling), Some(vp("/d-other")));
    }

    #[test]
    fn test_rename_moves_subtree() {
        let table = InodeTable::new();
        let dir = table.get_or_create_inode(&vp("/a"));
        let child = table.get_or_create_inode(&vp("/a/b"));
        table.rename_path(&vp("/a"), &vp("/z"));

        assert!(table.get_inode(&vp("/a")).is_none());
        assert_eq!(table.get_inode(&vp("/z")), Some(dir));
        assert_eq!(table.get_path(child), Some(vp("/z/b")));
    }
}
