//! Shared state of a running build.

use crate::db::BuildStore;
use crate::deps::PackageInstaller;
use crate::identity::Identity;
use crate::image::{ImageConfigDraft, LayerRecord, OciLayout};
use crate::ledger::BuildLedger;
use crate::recipe::Recipe;
use crate::rootfs::{Rootfs, TreeSnapshot};
use crate::trust::{Certificate, CertificateFetcher};
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Owns the staging directory and moves the finished image into place.
///
/// Dropped without [`PublishGuard::publish`], the staging directory and
/// everything built in it is removed, so a failed build leaves no output.
pub struct PublishGuard {
    staging: Option<TempDir>,
    output: PathBuf,
}

impl PublishGuard {
    const IMAGE_DIR: &'static str = "image";
    const ROOTFS_DIR: &'static str = "rootfs";

    /// Create a staging directory next to `output`.
    ///
    /// Staging on the same filesystem keeps the final rename atomic.
    pub fn new(output: &Path) -> BotstrapResult<Self> {
        if output.exists() {
            return Err(BotstrapError::Config(format!(
                "output {} already exists",
                output.display()
            )));
        }
        let parent = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let staging = tempfile::Builder::new()
            .prefix(".botstrap-staging-")
            .tempdir_in(parent)
            .map_err(|e| {
                BotstrapError::Storage(format!(
                    "Failed to create staging directory in {}: {}",
                    parent.display(),
                    e
                ))
            })?;

        Ok(Self {
            staging: Some(staging),
            output: output.to_path_buf(),
        })
    }

    fn staging_path(&self) -> BotstrapResult<&Path> {
        self.staging
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| BotstrapError::Internal("staging directory already released".into()))
    }

    pub fn image_dir(&self) -> BotstrapResult<PathBuf> {
        Ok(self.staging_path()?.join(Self::IMAGE_DIR))
    }

    pub fn rootfs_dir(&self) -> BotstrapResult<PathBuf> {
        Ok(self.staging_path()?.join(Self::ROOTFS_DIR))
    }

    /// Rename the staged image onto the output path and drop the working rootfs.
    pub fn publish(&mut self) -> BotstrapResult<PathBuf> {
        let image_dir = self.image_dir()?;
        std::fs::rename(&image_dir, &self.output).map_err(|e| {
            BotstrapError::Storage(format!(
                "Failed to publish image to {}: {}",
                self.output.display(),
                e
            ))
        })?;

        if let Some(staging) = self.staging.take() {
            if let Err(e) = staging.close() {
                tracing::warn!("Failed to remove staging directory: {}", e);
            }
        }
        Ok(self.output.clone())
    }
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if let Some(staging) = self.staging.take() {
            tracing::warn!(
                output = %self.output.display(),
                "Build did not complete, discarding staged image"
            );
            if let Err(e) = staging.close() {
                tracing::warn!("Failed to remove staging directory: {}", e);
            }
        }
    }
}

/// Shared build pipeline context.
///
/// Stages read the recipe, mutate the rootfs and fill in their outputs.
pub struct BuildContext {
    pub build_id: String,
    pub recipe: Recipe,
    pub rootfs: Rootfs,
    pub layout: OciLayout,
    /// Identity the next stage runs as.
    pub identity: Identity,
    pub ledger: BuildLedger,
    pub layers: Vec<LayerRecord>,
    pub draft: ImageConfigDraft,
    pub fetcher: Arc<dyn CertificateFetcher>,
    pub installer: Arc<dyn PackageInstaller>,
    pub history: Option<BuildStore>,
    /// Base image trust bundle; the only roots used for anchor fetches.
    pub base_certificates: Vec<Certificate>,
    /// Host path of the launcher binary placed by the payload stage.
    pub launcher_binary: Option<PathBuf>,
    pub guard: PublishGuard,
}

// ============================================================================
// STAGE INPUT/OUTPUT TYPES
// ============================================================================

/// Inputs of the dependency stage, taken from the context before installing.
pub struct DependencyInput {
    pub manifest: PathBuf,
    pub require_pins: bool,
    pub target: String,
    pub host_target: PathBuf,
    pub ca_bundle: Option<PathBuf>,
    /// Target tree before the installer ran.
    pub before: TreeSnapshot,
    pub installer: Arc<dyn PackageInstaller>,
}
