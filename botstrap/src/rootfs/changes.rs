//! Recorded filesystem mutations of one stage.

use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Numeric owner written into layer headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub const ROOT: Owner = Owner { uid: 0, gid: 0 };
}

/// Ordered set of image paths touched by a stage.
///
/// Paths are absolute image paths. `BTreeSet` ordering puts a directory
/// before its children, which is the order tar extraction needs.
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    paths: BTreeSet<PathBuf>,
    owners: BTreeMap<PathBuf, Owner>,
}

impl ChangeSet {
    /// Change set containing every entry below `root`, each with the
    /// owner it has on disk.
    pub fn scan(root: &Path) -> BotstrapResult<Self> {
        let mut set = Self::default();
        for entry in walkdir::WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry = entry.map_err(|e| BotstrapError::Storage(e.to_string()))?;
            let meta = entry
                .metadata()
                .map_err(|e| BotstrapError::Storage(e.to_string()))?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| BotstrapError::Internal(e.to_string()))?;
            set.set_owner(
                &Path::new("/").join(rel),
                Owner {
                    uid: meta.uid(),
                    gid: meta.gid(),
                },
            );
        }
        Ok(set)
    }

    pub fn record(&mut self, image_path: &Path) {
        self.paths.insert(image_path.to_path_buf());
    }

    pub fn set_owner(&mut self, image_path: &Path, owner: Owner) {
        self.paths.insert(image_path.to_path_buf());
        self.owners.insert(image_path.to_path_buf(), owner);
    }

    /// Owner for the layer header; everything defaults to root.
    pub fn owner_of(&self, image_path: &Path) -> Owner {
        self.owners.get(image_path).copied().unwrap_or(Owner::ROOT)
    }

    /// Take owners from `base` for recorded paths that have none of their own.
    pub fn inherit_owners(&mut self, base: &ChangeSet) {
        for path in &self.paths {
            if self.owners.contains_key(path) {
                continue;
            }
            if let Some(owner) = base.owners.get(path) {
                self.owners.insert(path.clone(), *owner);
            }
        }
    }

    pub fn contains(&self, image_path: &Path) -> bool {
        self.paths.contains(image_path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Size and mtime of every entry below a directory, keyed by image path.
#[derive(Debug, Default, Clone)]
pub struct TreeSnapshot {
    entries: BTreeMap<PathBuf, (u64, Option<SystemTime>)>,
}

impl TreeSnapshot {
    /// Capture `dir` (a host path inside `root`). A missing directory is empty.
    pub fn capture(root: &Path, dir: &Path) -> BotstrapResult<Self> {
        let mut entries = BTreeMap::new();
        if dir.symlink_metadata().is_err() {
            return Ok(Self { entries });
        }

        for entry in walkdir::WalkDir::new(dir).follow_links(false) {
            let entry = entry.map_err(|e| BotstrapError::Storage(e.to_string()))?;
            let meta = entry
                .path()
                .symlink_metadata()
                .map_err(|e| BotstrapError::Storage(e.to_string()))?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| BotstrapError::Internal(e.to_string()))?;
            entries.insert(Path::new("/").join(rel), (meta.len(), meta.modified().ok()));
        }
        Ok(Self { entries })
    }

    /// Paths present in `self` that are absent from, or differ in, `before`.
    pub fn changed_since<'a>(&'a self, before: &'a TreeSnapshot) -> impl Iterator<Item = &'a Path> {
        self.entries
            .iter()
            .filter(move |(path, stamp)| before.entries.get(*path) != Some(*stamp))
            .map(|(path, _)| path.as_path())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
