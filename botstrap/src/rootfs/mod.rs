//! Working root filesystem for a build.
//!
//! Every mutation a stage makes goes through [`Rootfs`], which records the
//! touched paths in a [`ChangeSet`]. At the end of a stage the change set is
//! cut into a layer tarball, so the image's layer graph is exactly the
//! ledger of recorded mutations.

mod changes;
mod copy;
mod layer;

pub use changes::{ChangeSet, Owner, TreeSnapshot};
pub use copy::copy_tree;
pub use layer::{LayerBlob, write_layer};

use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

/// Symlink hops allowed while resolving one path, as with the kernel's ELOOP limit.
const MAX_SYMLINK_HOPS: usize = 40;

/// A root filesystem tree on the host with per-stage change tracking.
#[derive(Debug)]
pub struct Rootfs {
    root: PathBuf,
    changes: ChangeSet,
    /// Every base entry with its original owner.
    base: ChangeSet,
}

impl Rootfs {
    /// Copy `base` into `dest` and start tracking changes against it.
    ///
    /// The copy itself is not recorded; [`Rootfs::base_changes`] describes
    /// the whole base tree with the owners it had in `base`.
    pub fn from_base(base: &Path, dest: &Path) -> BotstrapResult<Self> {
        if !base.is_dir() {
            return Err(BotstrapError::Config(format!(
                "Base rootfs is not a directory: {}",
                base.display()
            )));
        }

        let base_set = ChangeSet::scan(base)?;
        copy_tree(base, dest).map_err(|e| {
            BotstrapError::Storage(format!(
                "Failed to copy base rootfs {} into {}: {}",
                base.display(),
                dest.display(),
                e
            ))
        })?;

        tracing::debug!(base = %base.display(), root = %dest.display(), entries = base_set.len(), "Base rootfs materialized");

        Ok(Self {
            root: dest.to_path_buf(),
            changes: ChangeSet::default(),
            base: base_set,
        })
    }

    /// Open an existing tree without copying.
    pub fn open(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            changes: ChangeSet::default(),
            base: ChangeSet::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Change set covering the base tree.
    pub fn base_changes(&self) -> &ChangeSet {
        &self.base
    }

    fn to_host(&self, image_path: &Path) -> PathBuf {
        self.root
            .join(image_path.strip_prefix("/").unwrap_or(image_path))
    }

    /// Resolve an absolute image path the way the kernel would inside a
    /// chroot at the root.
    ///
    /// Symlinks met along the way are followed within the tree: absolute
    /// targets restart at the root and `..` never climbs above it. The
    /// result names no existing symlink, so host I/O on it stays inside the
    /// root. Explicit `..` in `image_path` is rejected.
    pub fn resolve(&self, image_path: &str) -> BotstrapResult<PathBuf> {
        let path = Path::new(image_path);
        if !path.is_absolute() {
            return Err(BotstrapError::Internal(format!(
                "image path must be absolute: {}",
                image_path
            )));
        }

        let mut pending: VecDeque<OsString> = VecDeque::new();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => pending.push_back(part.to_os_string()),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(BotstrapError::Internal(format!(
                        "image path escapes the root: {}",
                        image_path
                    )));
                }
            }
        }

        let mut resolved = PathBuf::from("/");
        let mut hops = 0;
        while let Some(part) = pending.pop_front() {
            if part == ".." {
                resolved.pop();
                continue;
            }

            let candidate = resolved.join(&part);
            let host = self.to_host(&candidate);
            let is_link = host
                .symlink_metadata()
                .map(|meta| meta.file_type().is_symlink())
                .unwrap_or(false);
            if !is_link {
                resolved = candidate;
                continue;
            }

            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(BotstrapError::Storage(format!(
                    "too many levels of symbolic links resolving {}",
                    image_path
                )));
            }
            let target = std::fs::read_link(&host)?;
            if target.is_absolute() {
                resolved = PathBuf::from("/");
            }
            for component in target.components().rev() {
                match component {
                    Component::Normal(p) => pending.push_front(p.to_os_string()),
                    Component::ParentDir => pending.push_front(OsString::from("..")),
                    Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                }
            }
        }
        Ok(resolved)
    }

    /// Map an absolute image path onto the host, resolving symlinks inside the root.
    pub fn host_path(&self, image_path: &str) -> BotstrapResult<PathBuf> {
        Ok(self.to_host(&self.resolve(image_path)?))
    }

    pub fn exists(&self, image_path: &str) -> bool {
        self.host_path(image_path)
            .map(|p| p.symlink_metadata().is_ok())
            .unwrap_or(false)
    }

    pub fn read_to_string(&self, image_path: &str) -> BotstrapResult<String> {
        let path = self.host_path(image_path)?;
        Ok(std::fs::read_to_string(path)?)
    }

    /// Read a file, returning an empty string when it does not exist.
    pub fn read_optional(&self, image_path: &str) -> BotstrapResult<String> {
        let path = self.host_path(image_path)?;
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a directory and any missing parents, recording each one created.
    pub fn create_dir_all(&mut self, image_path: &str, mode: u32) -> BotstrapResult<PathBuf> {
        let resolved = self.resolve(image_path)?;
        let mut current = PathBuf::from("/");
        for component in resolved.components().skip(1) {
            current.push(component);
            let host = self.to_host(&current);
            if host.symlink_metadata().is_err() {
                std::fs::create_dir(&host)?;
                std::fs::set_permissions(&host, std::fs::Permissions::from_mode(mode))?;
                self.changes.record(&current);
            }
        }
        Ok(self.to_host(&resolved))
    }

    /// Write a file (replacing any existing one) and record it.
    pub fn write_file(&mut self, image_path: &str, contents: &[u8], mode: u32) -> BotstrapResult<()> {
        let resolved = self.resolve(image_path)?;
        if let Some(parent) = resolved.parent() {
            self.create_dir_all(&parent.to_string_lossy(), 0o755)?;
        }

        let host = self.to_host(&resolved);
        std::fs::write(&host, contents).map_err(|e| {
            BotstrapError::Storage(format!("Failed to write {}: {}", image_path, e))
        })?;
        std::fs::set_permissions(&host, std::fs::Permissions::from_mode(mode))?;
        self.changes.record(&resolved);
        Ok(())
    }

    /// Record ownership for a path in the layer headers.
    ///
    /// Ownership is carried by the layer rather than applied on the host,
    /// so the build itself never needs `chown`.
    pub fn set_owner(&mut self, image_path: &str, owner: Owner) -> BotstrapResult<()> {
        let resolved = self.resolve(image_path)?;
        self.changes.set_owner(&resolved, owner);
        Ok(())
    }

    /// Record every entry under `image_path` (inclusive) as changed.
    pub fn record_tree(&mut self, image_path: &str) -> BotstrapResult<usize> {
        let host = self.host_path(image_path)?;
        let before = self.changes.len();
        for entry in walkdir::WalkDir::new(&host).follow_links(false) {
            let entry = entry.map_err(|e| BotstrapError::Storage(e.to_string()))?;
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| BotstrapError::Internal(e.to_string()))?;
            self.changes.record(&Path::new("/").join(rel));
        }
        Ok(self.changes.len() - before)
    }

    /// Capture size and mtime of every entry under `image_path`.
    pub fn snapshot(&self, image_path: &str) -> BotstrapResult<TreeSnapshot> {
        let host = self.host_path(image_path)?;
        TreeSnapshot::capture(&self.root, &host)
    }

    /// Record entries under `image_path` that are new or differ from `before`.
    ///
    /// Used for stages whose mutations are made by an external tool.
    pub fn record_changed_since(
        &mut self,
        image_path: &str,
        before: &TreeSnapshot,
    ) -> BotstrapResult<usize> {
        let host = self.host_path(image_path)?;
        let after = TreeSnapshot::capture(&self.root, &host)?;
        let mut recorded = 0;
        for path in after.changed_since(before) {
            self.changes.record(path);
            recorded += 1;
        }
        Ok(recorded)
    }

    /// Take the changes recorded since the last cut.
    ///
    /// Base paths a stage rewrote keep their base owner unless the stage set one.
    pub fn take_changes(&mut self) -> ChangeSet {
        let mut changes = std::mem::take(&mut self.changes);
        changes.inherit_owners(&self.base);
        changes
    }

    pub fn pending_changes(&self) -> &ChangeSet {
        &self.changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn empty_rootfs() -> (TempDir, Rootfs) {
        let temp = TempDir::new().unwrap();
        let rootfs = Rootfs::open(temp.path());
        (temp, rootfs)
    }

    #[test]
    fn test_host_path_rejects_escape() {
        let (_temp, rootfs) = empty_rootfs();
        assert!(rootfs.host_path("/etc/../../passwd").is_err());
        assert!(rootfs.host_path("etc/passwd").is_err());
        assert_eq!(
            rootfs.host_path("/etc/passwd").unwrap(),
            rootfs.root().join("etc/passwd")
        );
    }

    #[test]
    fn test_write_file_records_new_parents() {
        let (_temp, mut rootfs) = empty_rootfs();
        rootfs
            .write_file("/etc/botstrap/launch.json", b"{}", 0o644)
            .unwrap();

        let changes = rootfs.take_changes();
        let paths: Vec<_> = changes.paths().map(|p| p.to_string_lossy().into_owned()).collect();
        assert_eq!(
            paths,
            vec!["/etc", "/etc/botstrap", "/etc/botstrap/launch.json"]
        );
        assert!(rootfs.pending_changes().is_empty());
    }

    #[test]
    fn test_existing_parents_not_recorded() {
        let (temp, mut rootfs) = empty_rootfs();
        std::fs::create_dir_all(temp.path().join("etc")).unwrap();
        rootfs.write_file("/etc/group", b"root:x:0:\n", 0o644).unwrap();

        let changes = rootfs.take_changes();
        assert_eq!(changes.len(), 1);
        assert!(changes.contains(Path::new("/etc/group")));
    }

    #[test]
    fn test_absolute_symlink_resolves_inside_root() {
        let (temp, mut rootfs) = empty_rootfs();
        let outside = TempDir::new().unwrap();
        let host_bundle = outside.path().join("ca-certificates.crt");
        std::fs::write(&host_bundle, "HOST BUNDLE\n").unwrap();
        std::fs::create_dir_all(temp.path().join("etc/ssl")).unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("etc/ssl/certs")).unwrap();

        assert_eq!(rootfs.read_optional("/etc/ssl/certs/ca-certificates.crt").unwrap(), "");
        rootfs
            .write_file("/etc/ssl/certs/ca-certificates.crt", b"IMAGE BUNDLE\n", 0o644)
            .unwrap();

        assert_eq!(std::fs::read_to_string(&host_bundle).unwrap(), "HOST BUNDLE\n");
        let inside = temp
            .path()
            .join(outside.path().strip_prefix("/").unwrap())
            .join("ca-certificates.crt");
        assert_eq!(std::fs::read_to_string(inside).unwrap(), "IMAGE BUNDLE\n");
        assert_eq!(
            rootfs.read_to_string("/etc/ssl/certs/ca-certificates.crt").unwrap(),
            "IMAGE BUNDLE\n"
        );
    }

    #[test]
    fn test_relative_symlink_cannot_climb_above_root() {
        let (temp, rootfs) = empty_rootfs();
        std::fs::create_dir_all(temp.path().join("usr/share/ca-certificates")).unwrap();
        std::fs::create_dir_all(temp.path().join("etc")).unwrap();
        std::os::unix::fs::symlink("../../../../../usr/share", temp.path().join("etc/share")).unwrap();

        assert_eq!(
            rootfs.resolve("/etc/share/ca-certificates").unwrap(),
            PathBuf::from("/usr/share/ca-certificates")
        );
        assert_eq!(
            rootfs.host_path("/etc/share/ca-certificates").unwrap(),
            temp.path().join("usr/share/ca-certificates")
        );
    }

    #[test]
    fn test_symlink_loop_is_storage_error() {
        let (temp, rootfs) = empty_rootfs();
        std::os::unix::fs::symlink("/b", temp.path().join("a")).unwrap();
        std::os::unix::fs::symlink("/a", temp.path().join("b")).unwrap();

        let err = rootfs.resolve("/a/file").unwrap_err();
        assert!(matches!(err, BotstrapError::Storage(ref m) if m.contains("symbolic links")));
    }

    #[test]
    fn test_from_base_keeps_base_owners() {
        use std::os::unix::fs::MetadataExt;

        let base = TempDir::new().unwrap();
        std::fs::create_dir_all(base.path().join("etc")).unwrap();
        std::fs::write(base.path().join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();
        let meta = std::fs::metadata(base.path().join("etc/hosts")).unwrap();
        let on_disk = Owner {
            uid: meta.uid(),
            gid: meta.gid(),
        };

        let dest = TempDir::new().unwrap();
        let mut rootfs = Rootfs::from_base(base.path(), &dest.path().join("rootfs")).unwrap();
        assert_eq!(rootfs.base_changes().owner_of(Path::new("/etc/hosts")), on_disk);

        rootfs.write_file("/etc/hosts", b"::1 localhost\n", 0o644).unwrap();
        rootfs.write_file("/etc/motd", b"hi\n", 0o644).unwrap();
        let changes = rootfs.take_changes();
        assert_eq!(changes.owner_of(Path::new("/etc/hosts")), on_disk);
        assert_eq!(changes.owner_of(Path::new("/etc/motd")), Owner::ROOT);
    }

    #[test]
    fn test_read_optional_missing() {
        let (_temp, rootfs) = empty_rootfs();
        assert_eq!(rootfs.read_optional("/etc/passwd").unwrap(), "");
    }
}
