//! Recursive tree copy that keeps modes, mtimes and symlinks.

use filetime::FileTime;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

/// Copy `src` into `dst`, creating `dst` if needed.
///
/// Regular files, directories and symlinks are copied. Device nodes, FIFOs
/// and sockets are skipped since they cannot be created without privilege;
/// the container runtime provides them at start.
///
/// Directory permissions are applied after their contents are copied so
/// read-only directories can still be populated.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut copied = 0u64;
    let mut dirs = Vec::new();

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dst.join(rel);
        let meta = entry.path().symlink_metadata()?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            dirs.push((target, meta));
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                std::fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
            copied += 1;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
            filetime::set_file_mtime(&target, FileTime::from_last_modification_time(&meta))?;
            copied += 1;
        } else {
            tracing::debug!(path = %entry.path().display(), "Skipping special file");
        }
    }

    for (dir, meta) in dirs.into_iter().rev() {
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(meta.permissions().mode()))?;
        filetime::set_file_mtime(&dir, FileTime::from_last_modification_time(&meta))?;
    }

    Ok(copied)
}
