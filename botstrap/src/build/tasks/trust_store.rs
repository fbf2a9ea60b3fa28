//! Task: Trust store installation.
//!
//! Fetches every anchor over TLS validated by the base bundle only, then
//! installs them and rebuilds the bundle. All fetches complete before the
//! rootfs is touched, so an unreachable source leaves the trust store as it was.

use super::{BuildCtx, log_task_error, task_finish, task_start};
use crate::build::plan::StageKind;
use crate::pipeline::PipelineTask;
use crate::trust::{install_anchor, rebuild_bundle};
use async_trait::async_trait;
use botstrap_shared::errors::BotstrapResult;
use std::sync::Arc;

pub struct TrustStoreTask;

#[async_trait]
impl PipelineTask<BuildCtx> for TrustStoreTask {
    async fn run(self: Box<Self>, ctx: BuildCtx) -> BotstrapResult<()> {
        let kind = StageKind::TrustStore;
        let (build_id, started) = task_start(&ctx, kind).await?;

        let (anchors, fetcher, roots) = {
            let ctx = ctx.lock().await;
            (
                ctx.recipe.trust.anchors.clone(),
                Arc::clone(&ctx.fetcher),
                ctx.base_certificates.clone(),
            )
        };

        let mut fetched = Vec::with_capacity(anchors.len());
        for anchor in anchors {
            let certificates = fetcher
                .fetch(&anchor.url, &roots)
                .await
                .inspect_err(|e| log_task_error(&build_id, kind, e))?;
            tracing::debug!(anchor = %anchor.name, certificates = certificates.len(), "Anchor fetched");
            fetched.push((anchor, certificates));
        }

        let anchors = fetched.len();
        let summary = {
            let mut ctx = ctx.lock().await;
            let ctx = &mut *ctx;
            for (anchor, certificates) in fetched {
                let path = install_anchor(&mut ctx.rootfs, &anchor.name, &certificates)
                    .inspect_err(|e| log_task_error(&build_id, kind, e))?;
                tracing::debug!(anchor = %anchor.name, url = %anchor.url, path = %path, "Anchor installed");
            }

            rebuild_bundle(&mut ctx.rootfs, &ctx.base_certificates)
                .inspect_err(|e| log_task_error(&build_id, kind, e))?
        };

        let detail = format!(
            "anchors={} added={} duplicates={}",
            anchors,
            summary.added,
            summary.duplicates
        );
        task_finish(&ctx, kind, started, Some(detail)).await
    }

    fn name(&self) -> &str {
        StageKind::TrustStore.name()
    }
}
