//! Image build orchestration.
//!
//! ## Architecture
//!
//! The build is table-driven from a validated [`BuildPlan`]:
//!
//! ```text
//!   0. base rootfs          (copied into staging, layer 0)
//!   1. TrustStore           root          Start -> TrustInstalled
//!   2. Dependencies         root          -> DependenciesInstalled
//!   3. Payload              root          -> PayloadStaged
//!   4. Identity             root -> user  -> IdentityDeescalated
//!   5. Environment          user          -> ConfigMaterialized
//!   6. Entrypoint           user          -> EntrypointFixed
//!   => config, manifest, index; staging renamed onto the output
//! ```
//!
//! Each stage cuts its recorded changes into one layer. `PublishGuard`
//! discards the staging directory on any failure.

mod plan;
mod tasks;
mod types;

pub use plan::{BuildPlan, Idempotency, Privilege, StageKind, StageSpec};
pub use tasks::BuildCtx;
pub use types::{BuildContext, PublishGuard};

use crate::db::{BuildStatus, BuildStore};
use crate::deps::{PackageInstaller, PipInstaller};
use crate::identity::Identity;
use crate::image::{LayerRecord, OciLayout, Platform, PublishedImage};
use crate::ledger::BuildLedger;
use crate::pipeline::{
    BoxedTask, ExecutionPlan, PipelineBuilder, PipelineExecutor, PipelineMetrics, Stage,
};
use crate::recipe::Recipe;
use crate::rootfs::{Rootfs, write_layer};
use crate::runtime::constants::labels;
use crate::trust::{CertificateFetcher, HttpFetcher, read_bundle};
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Execution plan for the pipeline executor.
fn get_execution_plan(plan: &BuildPlan) -> ExecutionPlan<BuildCtx> {
    let stages: Vec<Stage<BoxedTask<BuildCtx>>> = plan
        .kinds()
        .into_iter()
        .map(|kind| Stage::single(kind.name(), tasks::task_for(kind)))
        .collect();
    ExecutionPlan::new(stages)
}

/// Result of a published build.
#[derive(Debug)]
pub struct BuildOutcome {
    pub build_id: String,
    pub output: PathBuf,
    pub image: PublishedImage,
    pub ledger: BuildLedger,
    pub metrics: PipelineMetrics,
}

/// Builds an image from a recipe.
///
/// # Example
///
/// ```ignore
/// let outcome = ImageBuilder::new(recipe, "out/bot")?
///     .with_history(store)
///     .build()
///     .await?;
/// ```
pub struct ImageBuilder {
    recipe: Recipe,
    output: PathBuf,
    plan: BuildPlan,
    fetcher: Arc<dyn CertificateFetcher>,
    installer: Arc<dyn PackageInstaller>,
    history: Option<BuildStore>,
    launcher_binary: Option<PathBuf>,
    recipe_path: Option<PathBuf>,
}

impl ImageBuilder {
    /// Builder with the HTTP fetcher and pip installer the recipe asks for.
    pub fn new(recipe: Recipe, output: impl Into<PathBuf>) -> BotstrapResult<Self> {
        recipe.validate()?;

        let fetcher = HttpFetcher::new(Duration::from_secs(recipe.trust.timeout_secs));
        let installer = match &recipe.dependencies.installer {
            Some(command) => PipInstaller::new(command.clone())?,
            None => PipInstaller::default(),
        };
        let launcher_binary = std::env::current_exe().ok();

        Ok(Self {
            recipe,
            output: output.into(),
            plan: BuildPlan::default(),
            fetcher: Arc::new(fetcher),
            installer: Arc::new(installer),
            history: None,
            launcher_binary,
            recipe_path: None,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn CertificateFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = installer;
        self
    }

    pub fn with_history(mut self, store: BuildStore) -> Self {
        self.history = Some(store);
        self
    }

    pub fn with_plan(mut self, plan: BuildPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_launcher_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.launcher_binary = Some(path.into());
        self
    }

    /// Recipe file name recorded in the history database.
    pub fn with_recipe_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.recipe_path = Some(path.into());
        self
    }

    pub fn plan(&self) -> &BuildPlan {
        &self.plan
    }

    /// Run every stage and publish the image.
    ///
    /// Nothing exists at the output path unless this returns `Ok`.
    pub async fn build(self) -> BotstrapResult<BuildOutcome> {
        let total_start = Instant::now();
        self.plan.validate()?;

        let ImageBuilder {
            recipe,
            output,
            plan,
            fetcher,
            installer,
            history,
            launcher_binary,
            recipe_path,
        } = self;

        let build_id = ulid::Ulid::new().to_string();
        tracing::info!(build_id = %build_id, output = %output.display(), "Build started");

        let guard = PublishGuard::new(&output)?;
        let history = history.and_then(|store| {
            let recipe_label = recipe_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            match store.begin(&build_id, &recipe_label, &output.display().to_string()) {
                Ok(()) => Some(store),
                Err(e) => {
                    tracing::warn!(build_id = %build_id, "Build history unavailable: {}", e);
                    None
                }
            }
        });

        let result = run_build(
            &build_id,
            recipe,
            &plan,
            guard,
            fetcher,
            installer,
            history.clone(),
            launcher_binary,
        )
        .await;

        match result {
            Ok((mut guard, ledger, image, metrics)) => {
                let output = guard.publish().inspect_err(|e| {
                    record_finish(
                        history.as_ref(),
                        &ledger,
                        BuildStatus::Failed,
                        None,
                        Some(&e.to_string()),
                    );
                })?;
                record_finish(
                    history.as_ref(),
                    &ledger,
                    BuildStatus::Published,
                    Some(&image.manifest_digest),
                    None,
                );
                tracing::info!(
                    build_id = %build_id,
                    manifest = %image.manifest_digest,
                    total_ms = total_start.elapsed().as_millis() as u64,
                    "Build published"
                );
                Ok(BuildOutcome {
                    build_id,
                    output,
                    image,
                    ledger,
                    metrics,
                })
            }
            Err((ledger, e)) => {
                record_finish(
                    history.as_ref(),
                    &ledger,
                    BuildStatus::Failed,
                    None,
                    Some(&e.to_string()),
                );
                tracing::error!(build_id = %build_id, state = %ledger.state(), "Build aborted: {}", e);
                Err(e)
            }
        }
    }
}

/// History writes never fail a build.
fn record_finish(
    history: Option<&BuildStore>,
    ledger: &BuildLedger,
    status: BuildStatus,
    manifest_digest: Option<&str>,
    error: Option<&str>,
) {
    if let Some(store) = history {
        if let Err(e) = store.finish(ledger, status, manifest_digest, error) {
            tracing::warn!(build_id = %ledger.build_id, "Failed to record build result: {}", e);
        }
    }
}

type BuildSuccess = (PublishGuard, BuildLedger, PublishedImage, PipelineMetrics);

/// Stage the base, run the pipeline and write the image metadata.
///
/// On failure the ledger reached so far is returned with the error; the
/// guard is dropped inside, discarding the staging directory.
#[allow(clippy::too_many_arguments)]
async fn run_build(
    build_id: &str,
    recipe: Recipe,
    plan: &BuildPlan,
    guard: PublishGuard,
    fetcher: Arc<dyn CertificateFetcher>,
    installer: Arc<dyn PackageInstaller>,
    history: Option<BuildStore>,
    launcher_binary: Option<PathBuf>,
) -> Result<BuildSuccess, (BuildLedger, BotstrapError)> {
    let fail = |e: BotstrapError| (BuildLedger::new(build_id), e);

    let image_dir = guard.image_dir().map_err(fail)?;
    let rootfs_dir = guard.rootfs_dir().map_err(fail)?;
    let layout = OciLayout::create(&image_dir).map_err(fail)?;
    let (rootfs, base_layer, base_certificates) =
        stage_base(&recipe.image.base, &rootfs_dir, &layout).map_err(fail)?;

    let platform = Platform {
        architecture: recipe
            .image
            .architecture
            .clone()
            .unwrap_or_else(|| Platform::default().architecture),
        os: recipe.image.os.clone().unwrap_or_else(|| "linux".to_string()),
    };
    let reference = recipe.image.reference.clone();

    let ctx = BuildContext {
        build_id: build_id.to_string(),
        recipe,
        rootfs,
        layout: layout.clone(),
        identity: Identity::Root,
        ledger: BuildLedger::new(build_id),
        layers: vec![base_layer],
        draft: Default::default(),
        fetcher,
        installer,
        history,
        base_certificates,
        launcher_binary,
        guard,
    };
    let ctx = Arc::new(Mutex::new(ctx));

    let pipeline = PipelineBuilder::from_plan(get_execution_plan(plan));
    let executed = PipelineExecutor::execute(pipeline, Arc::clone(&ctx)).await;

    let ctx = match Arc::try_unwrap(ctx) {
        Ok(mutex) => mutex.into_inner(),
        Err(_) => {
            return Err(fail(BotstrapError::Internal(
                "build context still shared after the pipeline finished".into(),
            )));
        }
    };
    let BuildContext {
        ledger,
        layers,
        mut draft,
        guard,
        resolved,
        ..
    } = ctx;

    let metrics = match executed {
        Ok(metrics) => metrics,
        Err(e) => return Err((ledger, e)),
    };
    if !ledger.is_complete() {
        return Err((
            ledger,
            BotstrapError::Internal("pipeline finished without fixing the entrypoint".into()),
        ));
    }

    if let Some(resolved) = &resolved {
        draft
            .labels
            .insert(labels::DEPENDENCY_DIGEST.to_string(), resolved.digest());
    }
    let ledger_json = match ledger.to_json() {
        Ok(json) => json,
        Err(e) => return Err((ledger, e)),
    };
    draft.labels.insert(labels::LEDGER.to_string(), ledger_json);

    let image = match layout.publish(&platform, &draft, &layers, &reference, Utc::now()) {
        Ok(image) => image,
        Err(e) => return Err((ledger, e)),
    };

    Ok((guard, ledger, image, metrics))
}

/// Copy the base rootfs, cut layer 0 and read the base trust bundle.
fn stage_base(
    base: &Path,
    rootfs_dir: &Path,
    layout: &OciLayout,
) -> BotstrapResult<(Rootfs, LayerRecord, Vec<crate::trust::Certificate>)> {
    let rootfs = Rootfs::from_base(base, rootfs_dir)?;
    let blob = write_layer(rootfs.root(), rootfs.base_changes(), &layout.blobs_dir())?;

    let base_certificates = read_bundle(&rootfs)?;
    if base_certificates.is_empty() {
        tracing::warn!(
            base = %base.display(),
            "Base image has no trust bundle; anchor sources cannot be verified"
        );
    }

    Ok((
        rootfs,
        LayerRecord {
            blob,
            created_by: "botstrap base".to_string(),
        },
        base_certificates,
    ))
}
