//! Virtual paths inside a mount

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{MergeFsError, Result};

/// A normalized absolute path relative to a mount root ("/", "/a/b")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VPath(String);

impl VPath {
    pub fn root() -> Self {
        VPath("/".to_string())
    }

    /// Parse and normalize a path. Empty and "." components are dropped,
    /// ".." is rejected since it could escape the mount root.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.contains('\0') {
            return Err(MergeFsError::InvalidPath(raw.replace('\0', "\\0")));
        }
        let mut out = String::with_capacity(raw.len() + 1);
        for component in raw.split('/') {
            match component {
                "" | "." => continue,
                ".." => return Err(MergeFsError::InvalidPath(raw.to_string())),
                name => {
                    out.push('/');
                    out.push_str(name);
                }
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        Ok(VPath(out))
    }

    /// Build from an OS path relative to some root (used when walking
    /// physical directories)
    pub fn from_relative(rel: &Path) -> Result<Self> {
        let s = rel
            .to_str()
            .ok_or_else(|| MergeFsError::InvalidPath(rel.display().to_string()))?;
        Self::parse(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path without the leading slash, suitable for joining onto a root dir
    pub fn relative(&self) -> &str {
        &self.0[1..]
    }

    /// Resolve against a physical root directory
    pub fn to_physical(&self, root: &Path) -> PathBuf {
        if self.is_root() {
            root.to_path_buf()
        } else {
            root.join(self.relative())
        }
    }

    pub fn parent(&self) -> Option<VPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(VPath::root()),
            Some(idx) => Some(VPath(self.0[..idx].to_string())),
            None => None,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    pub fn join(&self, name: &str) -> Result<VPath> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(MergeFsError::InvalidPath(format!("{}/{}", self.0, name)));
        }
        if self.is_root() {
            Ok(VPath(format!("/{}", name)))
        } else {
            Ok(VPath(format!("{}/{}", self.0, name)))
        }
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// Proper ancestors below the root, shallowest first.
    /// For "/a/b/c" this yields "/a", "/a/b".
    pub fn ancestors(&self) -> Vec<VPath> {
        let mut out = Vec::new();
        let mut idx = 0;
        while let Some(pos) = self.0[idx + 1..].find('/') {
            idx += pos + 1;
            out.push(VPath(self.0[..idx].to_string()));
        }
        out
    }

    /// Component-wise prefix check ("/a" is a prefix of "/a/b", not of "/ab")
    pub fn starts_with(&self, prefix: &VPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    /// Replace the `from` prefix with `to`
    pub fn rebase(&self, from: &VPath, to: &VPath) -> Option<VPath> {
        if !self.starts_with(from) {
            return None;
        }
        let rest = if from.is_root() {
            self.relative()
        } else {
            self.0[from.0.len()..].trim_start_matches('/')
        };
        if rest.is_empty() {
            return Some(to.clone());
        }
        VPath::parse(&format!("{}/{}", to.0, rest)).ok()
    }

    /// Lookup key for state maps
    pub fn key(&self, case_sensitive: bool) -> String {
        fold(&self.0, case_sensitive).into_owned()
    }
}

/// Fold a name or path for comparison under the mount's case policy
pub fn fold(s: &str, case_sensitive: bool) -> Cow<'_, str> {
    if case_sensitive {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(s.to_lowercase())
    }
}

impl fmt::Display for VPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
