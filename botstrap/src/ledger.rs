//! Build state machine and the per-build ledger of stage transitions.

use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const LEDGER_VERSION: u32 = 1;

/// Where a build is in the bootstrap sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Start,
    TrustInstalled,
    DependenciesInstalled,
    PayloadStaged,
    IdentityDeescalated,
    ConfigMaterialized,
    EntrypointFixed,
}

impl BuildState {
    pub const ALL: [BuildState; 7] = [
        BuildState::Start,
        BuildState::TrustInstalled,
        BuildState::DependenciesInstalled,
        BuildState::PayloadStaged,
        BuildState::IdentityDeescalated,
        BuildState::ConfigMaterialized,
        BuildState::EntrypointFixed,
    ];

    /// The only legal successor, `None` once the entrypoint is fixed.
    pub fn next(self) -> Option<BuildState> {
        let index = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(index + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        self == BuildState::EntrypointFixed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildState::Start => "start",
            BuildState::TrustInstalled => "trust_installed",
            BuildState::DependenciesInstalled => "dependencies_installed",
            BuildState::PayloadStaged => "payload_staged",
            BuildState::IdentityDeescalated => "identity_deescalated",
            BuildState::ConfigMaterialized => "config_materialized",
            BuildState::EntrypointFixed => "entrypoint_fixed",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub stage: String,
    pub from: BuildState,
    pub to: BuildState,
    /// Compressed digest of the layer this stage produced.
    pub layer_digest: String,
    /// Identity in effect when the stage's layer was cut.
    pub identity: String,
    pub changed_paths: usize,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
    /// Stage-specific fact worth keeping, e.g. the dependency digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Ordered record of the transitions a build went through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLedger {
    pub build_id: String,
    pub version: u32,
    pub entries: Vec<LedgerEntry>,
}

impl BuildLedger {
    pub fn new(build_id: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            version: LEDGER_VERSION,
            entries: Vec::new(),
        }
    }

    pub fn state(&self) -> BuildState {
        self.entries
            .last()
            .map(|entry| entry.to)
            .unwrap_or(BuildState::Start)
    }

    pub fn is_complete(&self) -> bool {
        self.state().is_terminal()
    }

    /// Append an entry. Only the single legal successor of the current
    /// state is accepted.
    pub fn record(&mut self, entry: LedgerEntry) -> BotstrapResult<()> {
        let current = self.state();
        if entry.from != current || current.next() != Some(entry.to) {
            return Err(BotstrapError::Plan(format!(
                "illegal transition {} -> {} for stage {} (build is at {})",
                entry.from, entry.to, entry.stage, current
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn to_json(&self) -> BotstrapResult<String> {
        serde_json::to_string(self)
            .map_err(|e| BotstrapError::Internal(format!("Failed to serialize ledger: {}", e)))
    }
}
