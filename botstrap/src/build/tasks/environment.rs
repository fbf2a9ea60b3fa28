//! Task: Runtime configuration.
//!
//! Freezes the environment snapshot. Defaults go into the image `Env`;
//! secrets are recorded by name only and bound by the launcher at start.

use super::{BuildCtx, log_task_error, task_finish, task_start};
use crate::build::plan::StageKind;
use crate::build::types::BuildContext;
use crate::env::{LaunchSpec, materialize};
use crate::pipeline::PipelineTask;
use crate::runtime::constants::{image_paths, labels};
use async_trait::async_trait;
use botstrap_shared::errors::BotstrapResult;

pub struct EnvironmentTask;

#[async_trait]
impl PipelineTask<BuildCtx> for EnvironmentTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> BotstrapResult<()> {
        let kind = StageKind::Environment;
        let (build_id, started) = task_start(&ctx, kind).await?;

        let detail = {
            let mut ctx = ctx.lock().await;
            materialize_environment(&mut ctx).inspect_err(|e| log_task_error(&build_id, kind, e))?
        };

        task_finish(&ctx, kind, started, Some(detail)).await
    }

    fn name(&self) -> &str {
        StageKind::Environment.name()
    }
}

fn join(names: impl IntoIterator<Item = impl AsRef<str>>) -> String {
    names
        .into_iter()
        .map(|n| n.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn materialize_environment(ctx: &mut BuildContext) -> BotstrapResult<String> {
    let snapshot = materialize(&ctx.recipe.environment_request())?;

    if let Some(tz) = snapshot.timezone() {
        let zone = format!("{}/{}", image_paths::ZONEINFO_DIR, tz);
        if tz != "UTC" && !ctx.rootfs.exists(&zone) {
            tracing::warn!(timezone = %tz, "Zone data not found in the image; the payload may fall back to UTC");
        }
    }

    let mut spec = LaunchSpec::new(snapshot.clone(), ctx.identity.oci_user());
    spec.argv = ctx.recipe.entrypoint.argv.clone();
    spec.working_dir = ctx.draft.working_dir.clone();
    ctx.rootfs
        .write_file(image_paths::LAUNCH_SPEC, &spec.to_json()?, 0o644)?;

    ctx.draft.env = snapshot.oci_env();
    ctx.draft
        .labels
        .insert(labels::SECRETS.to_string(), join(&snapshot.secrets));
    ctx.draft
        .labels
        .insert(labels::OVERRIDABLE.to_string(), join(&snapshot.overridable));

    let detail = format!(
        "defaults={} secrets={} overridable={}",
        snapshot.defaults.len(),
        snapshot.secrets.len(),
        snapshot.overridable.len()
    );
    tracing::info!(
        defaults = snapshot.defaults.len(),
        secrets = %join(&snapshot.secrets),
        "Environment materialized"
    );
    Ok(detail)
}
