//! Task: Payload staging.

use super::{BuildCtx, log_task_error, task_finish, task_start};
use crate::build::plan::StageKind;
use crate::build::types::BuildContext;
use crate::pipeline::PipelineTask;
use crate::rootfs::copy_tree;
use crate::runtime::constants::image_paths;
use async_trait::async_trait;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};

pub struct PayloadTask;

#[async_trait]
impl PipelineTask<BuildCtx> for PayloadTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> BotstrapResult<()> {
        let kind = StageKind::Payload;
        let (build_id, started) = task_start(&ctx, kind).await?;

        let copied = {
            let mut ctx = ctx.lock().await;
            stage_payload(&mut ctx).inspect_err(|e| log_task_error(&build_id, kind, e))?
        };

        task_finish(&ctx, kind, started, Some(format!("files={}", copied))).await
    }

    fn name(&self) -> &str {
        StageKind::Payload.name()
    }
}

/// Copy the payload tree to the working directory and place the launcher.
fn stage_payload(ctx: &mut BuildContext) -> BotstrapResult<u64> {
    let source = ctx.recipe.payload.source.clone();
    let workdir = ctx.recipe.payload.workdir.clone();

    if !source.is_dir() {
        return Err(BotstrapError::MissingSource(format!(
            "payload directory {} does not exist or is not a directory",
            source.display()
        )));
    }

    let dest = ctx.rootfs.create_dir_all(&workdir, 0o755)?;
    let copied = copy_tree(&source, &dest).map_err(|e| {
        BotstrapError::Storage(format!(
            "Failed to copy payload {} to {}: {}",
            source.display(),
            workdir,
            e
        ))
    })?;
    ctx.rootfs.record_tree(&workdir)?;
    tracing::info!(source = %source.display(), workdir = %workdir, files = copied, "Payload staged");

    if ctx.recipe.payload.supervised {
        let launcher = ctx
            .recipe
            .payload
            .launcher
            .clone()
            .or_else(|| ctx.launcher_binary.clone())
            .ok_or_else(|| {
                BotstrapError::Config("supervised entrypoint needs a launcher binary".into())
            })?;
        let bytes = std::fs::read(&launcher).map_err(|e| {
            BotstrapError::MissingSource(format!(
                "launcher binary {} is not readable: {}",
                launcher.display(),
                e
            ))
        })?;
        ctx.rootfs
            .write_file(image_paths::LAUNCHER_BINARY, &bytes, 0o755)?;
        tracing::debug!(launcher = %launcher.display(), "Launcher placed");
    }

    ctx.draft.working_dir = Some(workdir);
    Ok(copied)
}
