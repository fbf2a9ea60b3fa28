//! OS trust store mutation inside the image rootfs.
//!
//! Mirrors what `update-ca-certificates` does on Debian-family images:
//! local anchors live in `/usr/local/share/ca-certificates/*.crt` and the
//! combined bundle at `/etc/ssl/certs/ca-certificates.crt` is regenerated
//! from the base bundle plus every local anchor.

use super::pem::{Certificate, parse_pem_bundle};
use crate::rootfs::Rootfs;
use crate::runtime::constants::image_paths;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use std::collections::HashSet;

/// Result of a bundle rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSummary {
    /// Certificates carried over from the base bundle.
    pub base_certificates: usize,
    /// Local anchors appended.
    pub added: usize,
    /// Local anchors already present in the base bundle.
    pub duplicates: usize,
}

/// Place an anchor's certificates in the local CA directory.
///
/// Returns the image path written.
pub fn install_anchor(
    rootfs: &mut Rootfs,
    name: &str,
    certificates: &[Certificate],
) -> BotstrapResult<String> {
    let image_path = format!("{}/{}.crt", image_paths::LOCAL_CA_DIR, name);
    if rootfs.exists(&image_path) {
        tracing::warn!(path = %image_path, "Replacing existing local CA certificate");
    }

    let pem: String = certificates.iter().map(Certificate::to_pem).collect();
    rootfs.write_file(&image_path, pem.as_bytes(), 0o644)?;
    Ok(image_path)
}

/// Certificates of the base image's bundle.
///
/// A missing bundle is an empty trust store; a malformed one is an
/// inconsistency in the base image.
pub fn read_bundle(rootfs: &Rootfs) -> BotstrapResult<Vec<Certificate>> {
    let text = rootfs.read_optional(image_paths::CA_BUNDLE)?;
    parse_pem_bundle(&text).map_err(|e| {
        BotstrapError::Install(format!("{} is malformed: {}", image_paths::CA_BUNDLE, e))
    })
}

/// Regenerate the combined bundle from `base` plus every local anchor.
///
/// Every local `*.crt` is parsed; any malformed file aborts the rebuild
/// with [`BotstrapError::Install`] so a broken trust store never ships.
pub fn rebuild_bundle(rootfs: &mut Rootfs, base: &[Certificate]) -> BotstrapResult<BundleSummary> {
    let local_dir = rootfs.host_path(image_paths::LOCAL_CA_DIR)?;

    let mut local_files = Vec::new();
    if local_dir.is_dir() {
        for entry in walkdir::WalkDir::new(&local_dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| BotstrapError::Install(e.to_string()))?;
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "crt")
            {
                local_files.push(entry.into_path());
            }
        }
    }

    let mut bundle: String = base.iter().map(Certificate::to_pem).collect();
    let mut seen: HashSet<Vec<u8>> = base.iter().map(|c| c.der().to_vec()).collect();
    let mut summary = BundleSummary {
        base_certificates: base.len(),
        added: 0,
        duplicates: 0,
    };

    for file in local_files {
        let text = std::fs::read_to_string(&file).map_err(|e| {
            BotstrapError::Install(format!("cannot read {}: {}", file.display(), e))
        })?;
        let certs = parse_pem_bundle(&text)
            .map_err(|e| BotstrapError::Install(format!("{}: {}", file.display(), e)))?;
        if certs.is_empty() {
            return Err(BotstrapError::Install(format!(
                "{}: no certificate found",
                file.display()
            )));
        }

        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut anchor_pem = String::new();
        for cert in certs {
            anchor_pem.push_str(&cert.to_pem());
            if seen.insert(cert.der().to_vec()) {
                bundle.push_str(&cert.to_pem());
                summary.added += 1;
            } else {
                summary.duplicates += 1;
            }
        }
        rootfs.write_file(
            &format!("{}/{}.pem", image_paths::CERTS_DIR, stem),
            anchor_pem.as_bytes(),
            0o644,
        )?;
    }

    rootfs.write_file(image_paths::CA_BUNDLE, bundle.as_bytes(), 0o644)?;

    tracing::info!(
        base = summary.base_certificates,
        added = summary.added,
        duplicates = summary.duplicates,
        "Trust store rebuilt"
    );

    Ok(summary)
}
