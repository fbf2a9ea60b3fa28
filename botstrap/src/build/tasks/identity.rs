//! Task: Privilege de-escalation.
//!
//! Last root stage. Creates the execution identity and switches the build
//! to it; from here on every stage runs unprivileged.

use super::{BuildCtx, log_task_error, task_finish, task_start};
use crate::build::plan::StageKind;
use crate::identity::{Identity, create_identity};
use crate::pipeline::PipelineTask;
use crate::runtime::constants::labels;
use async_trait::async_trait;
use botstrap_shared::errors::BotstrapResult;

pub struct IdentityTask;

#[async_trait]
impl PipelineTask<BuildCtx> for IdentityTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> BotstrapResult<()> {
        let kind = StageKind::Identity;
        let (build_id, started) = task_start(&ctx, kind).await?;

        let detail = {
            let mut ctx = ctx.lock().await;
            let ctx = &mut *ctx;
            let request = ctx.recipe.identity_request();
            let identity = create_identity(&mut ctx.rootfs, &request)
                .inspect_err(|e| log_task_error(&build_id, kind, e))?;

            ctx.draft.user = Some(identity.name.clone());
            ctx.draft
                .labels
                .insert(labels::IDENTITY_UID.to_string(), identity.uid.to_string());
            let detail = format!("{} uid={} gid={}", identity.name, identity.uid, identity.gid);
            ctx.identity = Identity::User(identity);
            detail
        };

        task_finish(&ctx, kind, started, Some(detail)).await
    }

    fn name(&self) -> &str {
        StageKind::Identity.name()
    }
}
