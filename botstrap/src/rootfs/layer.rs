//! Layer tarball writer.
//!
//! A layer is the gzip-compressed tar of one change set. Both digests OCI
//! needs are computed while streaming: the diff id over the uncompressed
//! tar and the blob digest over the compressed bytes.

use super::changes::ChangeSet;
use crate::runtime::constants::layer;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use tar::{EntryType, Header, HeaderMode};

/// A layer written to the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerBlob {
    /// `sha256:<hex>` of the compressed blob.
    pub digest: String,
    /// `sha256:<hex>` of the uncompressed tar.
    pub diff_id: String,
    /// Compressed size in bytes.
    pub size: u64,
    /// Number of entries in the tar.
    pub entries: usize,
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write `changes` (read from `root`) as a layer blob into `blobs_dir`.
///
/// The blob lands at `blobs_dir/<hex digest>`. Paths that were recorded
/// and later vanished are skipped.
pub fn write_layer(root: &Path, changes: &ChangeSet, blobs_dir: &Path) -> BotstrapResult<LayerBlob> {
    std::fs::create_dir_all(blobs_dir)?;
    let staging = tempfile::NamedTempFile::new_in(blobs_dir)?;

    let file = staging.reopen()?;
    let compressed = HashingWriter::new(file);
    let gz = GzEncoder::new(compressed, Compression::new(layer::GZIP_LEVEL));
    let uncompressed = HashingWriter::new(gz);
    let mut builder = tar::Builder::new(uncompressed);
    builder.follow_symlinks(false);

    let mut entries = 0usize;
    for image_path in changes.paths() {
        let rel = image_path.strip_prefix("/").unwrap_or(image_path);
        let host = root.join(rel);
        let meta = match host.symlink_metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %image_path.display(), "Recorded path no longer exists");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let owner = changes.owner_of(image_path);
        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(&meta, HeaderMode::Complete);
        header.set_uid(owner.uid as u64);
        header.set_gid(owner.gid as u64);

        let file_type = meta.file_type();
        let result = if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, rel, io::empty())
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&host)?;
            header.set_size(0);
            builder.append_link(&mut header, rel, target)
        } else if file_type.is_file() {
            let file = File::open(&host)?;
            builder.append_data(&mut header, rel, file)
        } else {
            continue;
        };
        result.map_err(|e| {
            BotstrapError::Storage(format!(
                "Failed to add {} to layer: {}",
                image_path.display(),
                e
            ))
        })?;
        entries += 1;
    }

    let uncompressed = builder.into_inner()?;
    let (gz, diff_id, _) = uncompressed.finish();
    let compressed = gz.finish()?;
    let (mut file, digest, size) = compressed.finish();
    file.flush()?;

    let hex = digest.trim_start_matches("sha256:");
    let blob_path = blobs_dir.join(hex);
    staging.persist(&blob_path).map_err(|e| {
        BotstrapError::Storage(format!(
            "Failed to persist layer {}: {}",
            blob_path.display(),
            e
        ))
    })?;

    tracing::debug!(%digest, %diff_id, size, entries, "Layer written");

    Ok(LayerBlob {
        digest,
        diff_id,
        size,
        entries,
    })
}
