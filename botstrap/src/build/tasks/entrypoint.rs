//! Task: Entrypoint.

use super::{BuildCtx, log_task_error, task_finish, task_start};
use crate::build::plan::StageKind;
use crate::build::types::BuildContext;
use crate::launch::validate_argv;
use crate::pipeline::PipelineTask;
use crate::runtime::constants::image_paths;
use async_trait::async_trait;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};

pub struct EntrypointTask;

#[async_trait]
impl PipelineTask<BuildCtx> for EntrypointTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> BotstrapResult<()> {
        let kind = StageKind::Entrypoint;
        let (build_id, started) = task_start(&ctx, kind).await?;

        let detail = {
            let mut ctx = ctx.lock().await;
            fix_entrypoint(&mut ctx).inspect_err(|e| log_task_error(&build_id, kind, e))?
        };

        task_finish(&ctx, kind, started, Some(detail)).await
    }

    fn name(&self) -> &str {
        StageKind::Entrypoint.name()
    }
}

/// Exec-form entrypoint, optionally routed through the launcher.
pub(crate) fn entrypoint_argv(argv: &[String], supervised: bool) -> Vec<String> {
    if supervised {
        [image_paths::LAUNCHER_BINARY, "launch", "--"]
            .iter()
            .map(|s| s.to_string())
            .chain(argv.iter().cloned())
            .collect()
    } else {
        argv.to_vec()
    }
}

fn fix_entrypoint(ctx: &mut BuildContext) -> BotstrapResult<String> {
    if ctx.identity.is_root() {
        return Err(BotstrapError::Privilege(
            "entrypoint would inherit the root identity".into(),
        ));
    }

    let argv = &ctx.recipe.entrypoint.argv;
    validate_argv(argv)?;

    let supervised = ctx.recipe.payload.supervised;
    if supervised && !ctx.rootfs.exists(image_paths::LAUNCHER_BINARY) {
        return Err(BotstrapError::Launch(format!(
            "supervised entrypoint needs {} in the image",
            image_paths::LAUNCHER_BINARY
        )));
    }

    let entrypoint = entrypoint_argv(argv, supervised);
    let detail = entrypoint.join(" ");
    ctx.draft.entrypoint = entrypoint;
    ctx.draft.cmd = Vec::new();

    tracing::info!(entrypoint = %detail, user = %ctx.identity, supervised, "Entrypoint fixed");
    Ok(detail)
}
