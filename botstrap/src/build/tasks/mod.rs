//! Build stage tasks.
//!
//! Every task starts with [`task_start`], which enforces the stage's
//! privilege against the current identity, and ends with [`task_finish`],
//! which cuts the stage's changes into a layer and appends the ledger entry.

mod dependencies;
mod entrypoint;
mod environment;
mod identity;
mod payload;
mod trust_store;

pub use dependencies::DependenciesTask;
pub use entrypoint::EntrypointTask;
pub use environment::EnvironmentTask;
pub use identity::IdentityTask;
pub use payload::PayloadTask;
pub use trust_store::TrustStoreTask;

use super::plan::{Privilege, StageKind, StageSpec};
use super::types::BuildContext;
use crate::image::LayerRecord;
use crate::ledger::LedgerEntry;
use crate::pipeline::BoxedTask;
use crate::rootfs::write_layer;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

pub type BuildCtx = Arc<Mutex<BuildContext>>;

/// Task implementing a stage.
pub(crate) fn task_for(kind: StageKind) -> BoxedTask<BuildCtx> {
    match kind {
        StageKind::TrustStore => Box::new(TrustStoreTask),
        StageKind::Dependencies => Box::new(DependenciesTask),
        StageKind::Payload => Box::new(PayloadTask),
        StageKind::Identity => Box::new(IdentityTask),
        StageKind::Environment => Box::new(EnvironmentTask),
        StageKind::Entrypoint => Box::new(EntrypointTask),
    }
}

/// Log the stage start and check that the current identity may run it.
///
/// Returns the build id and the start instant.
pub(super) async fn task_start(ctx: &BuildCtx, kind: StageKind) -> BotstrapResult<(String, Instant)> {
    let ctx = ctx.lock().await;
    let spec = StageSpec::standard(kind);

    tracing::info!(
        build_id = %ctx.build_id,
        stage = %kind,
        identity = %ctx.identity,
        privilege = %spec.privilege,
        "Stage started"
    );

    let is_root = ctx.identity.is_root();
    let result = match spec.privilege {
        Privilege::Root if !is_root => Err(BotstrapError::Privilege(format!(
            "stage {} requires root but the build runs as {}",
            kind, ctx.identity
        ))),
        Privilege::Unprivileged if is_root => Err(BotstrapError::Privilege(format!(
            "stage {} must not run as root",
            kind
        ))),
        _ => Ok((ctx.build_id.clone(), Instant::now())),
    };
    result.inspect_err(|e| log_task_error(&ctx.build_id, kind, e))
}

/// Cut the stage's changes into a layer and record the transition.
pub(super) async fn task_finish(
    ctx: &BuildCtx,
    kind: StageKind,
    started: Instant,
    detail: Option<String>,
) -> BotstrapResult<()> {
    let mut ctx = ctx.lock().await;
    let ctx = &mut *ctx;

    let changes = ctx.rootfs.take_changes();
    let blob = write_layer(ctx.rootfs.root(), &changes, &ctx.layout.blobs_dir())
        .inspect_err(|e| log_task_error(&ctx.build_id, kind, e))?;

    let entry = LedgerEntry {
        stage: kind.name().to_string(),
        from: ctx.ledger.state(),
        to: kind.reaches(),
        layer_digest: blob.digest.clone(),
        identity: ctx.identity.to_string(),
        changed_paths: changes.len(),
        duration_ms: started.elapsed().as_millis() as u64,
        completed_at: Utc::now(),
        detail,
    };
    ctx.ledger
        .record(entry.clone())
        .inspect_err(|e| log_task_error(&ctx.build_id, kind, e))?;
    ctx.layers.push(LayerRecord {
        blob,
        created_by: format!("botstrap {}", kind),
    });

    if let Some(history) = &ctx.history {
        let seq = ctx.ledger.entries.len() - 1;
        if let Err(e) = history.record_transition(&ctx.build_id, seq, &entry) {
            tracing::warn!(build_id = %ctx.build_id, stage = %kind, "Failed to record transition: {}", e);
        }
    }

    tracing::info!(
        build_id = %ctx.build_id,
        stage = %kind,
        state = %entry.to,
        layer = %entry.layer_digest,
        changed_paths = entry.changed_paths,
        duration_ms = entry.duration_ms,
        "Stage completed"
    );
    Ok(())
}

/// Log a stage error with context.
pub(super) fn log_task_error(build_id: &str, kind: StageKind, error: &BotstrapError) {
    tracing::error!(
        build_id = %build_id,
        stage = %kind,
        error_kind = error.kind(),
        "Stage failed: {}",
        error
    );
}
