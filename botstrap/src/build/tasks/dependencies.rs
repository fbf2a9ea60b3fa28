//! Task: Dependency provisioning.
//!
//! Resolves the lock manifest, installs the exact set into the image's
//! library directory and records whatever the installer created there.

use super::{BuildCtx, log_task_error, task_finish, task_start};
use crate::build::plan::StageKind;
use crate::build::types::DependencyInput;
use crate::deps::{DependencyManifest, InstallRequest};
use crate::pipeline::PipelineTask;
use crate::runtime::constants::image_paths;
use async_trait::async_trait;
use botstrap_shared::errors::BotstrapResult;
use std::sync::Arc;

pub struct DependenciesTask;

#[async_trait]
impl PipelineTask<BuildCtx> for DependenciesTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> BotstrapResult<()> {
        let kind = StageKind::Dependencies;
        let (build_id, started) = task_start(&ctx, kind).await?;

        let input = {
            let mut ctx = ctx.lock().await;
            prepare_input(&mut ctx).inspect_err(|e| log_task_error(&build_id, kind, e))?
        };

        let Some(input) = input else {
            tracing::info!(build_id = %build_id, "No dependency manifest, stage is empty");
            return task_finish(&ctx, kind, started, None).await;
        };

        let resolved = DependencyManifest::load(&input.manifest)
            .and_then(|manifest| manifest.resolve(input.require_pins))
            .inspect_err(|e| log_task_error(&build_id, kind, e))?;
        tracing::info!(
            build_id = %build_id,
            packages = resolved.len(),
            digest = %resolved.digest(),
            "Dependency set resolved"
        );

        let request = InstallRequest {
            packages: &resolved,
            target: &input.host_target,
            ca_bundle: input.ca_bundle.as_deref(),
            no_deps: input.require_pins,
        };
        input
            .installer
            .install(&request)
            .await
            .inspect_err(|e| log_task_error(&build_id, kind, e))?;
        // With `no_deps` nothing else notices a transitive dependency missing from the lock.
        input
            .installer
            .check(&request)
            .await
            .inspect_err(|e| log_task_error(&build_id, kind, e))?;

        let digest = resolved.digest();
        {
            let mut ctx = ctx.lock().await;
            let recorded = ctx
                .rootfs
                .record_changed_since(&input.target, &input.before)
                .inspect_err(|e| log_task_error(&build_id, kind, e))?;
            tracing::debug!(build_id = %build_id, recorded, "Installed files recorded");
        }

        task_finish(&ctx, kind, started, Some(digest)).await
    }

    fn name(&self) -> &str {
        StageKind::Dependencies.name()
    }
}

/// Create the target directory and snapshot it before the installer runs.
fn prepare_input(
    ctx: &mut crate::build::types::BuildContext,
) -> BotstrapResult<Option<DependencyInput>> {
    let Some(manifest) = ctx.recipe.dependencies.manifest.clone() else {
        return Ok(None);
    };
    let target = ctx.recipe.dependencies.target.clone();

    let host_target = ctx.rootfs.create_dir_all(&target, 0o755)?;
    let before = ctx.rootfs.snapshot(&target)?;
    let ca_bundle = if ctx.rootfs.exists(image_paths::CA_BUNDLE) {
        Some(ctx.rootfs.host_path(image_paths::CA_BUNDLE)?)
    } else {
        None
    };

    Ok(Some(DependencyInput {
        manifest,
        require_pins: ctx.recipe.dependencies.require_pins,
        target,
        host_target,
        ca_bundle,
        before,
        installer: Arc::clone(&ctx.installer),
    }))
}
