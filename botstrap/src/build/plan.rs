//! Declared stage graph.
//!
//! Each stage names its prerequisites and the privilege it needs. The plan
//! is checked before anything runs, so an ordering mistake is a plan error
//! rather than a stage failing halfway through a build.

use crate::ledger::BuildState;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    TrustStore,
    Dependencies,
    Payload,
    Identity,
    Environment,
    Entrypoint,
}

impl StageKind {
    pub const ALL: [StageKind; 6] = [
        StageKind::TrustStore,
        StageKind::Dependencies,
        StageKind::Payload,
        StageKind::Identity,
        StageKind::Environment,
        StageKind::Entrypoint,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageKind::TrustStore => "trust_store",
            StageKind::Dependencies => "dependencies",
            StageKind::Payload => "payload",
            StageKind::Identity => "identity",
            StageKind::Environment => "environment",
            StageKind::Entrypoint => "entrypoint",
        }
    }

    /// Build state reached when the stage completes.
    pub fn reaches(self) -> BuildState {
        match self {
            StageKind::TrustStore => BuildState::TrustInstalled,
            StageKind::Dependencies => BuildState::DependenciesInstalled,
            StageKind::Payload => BuildState::PayloadStaged,
            StageKind::Identity => BuildState::IdentityDeescalated,
            StageKind::Environment => BuildState::ConfigMaterialized,
            StageKind::Entrypoint => BuildState::EntrypointFixed,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity a stage must run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Root,
    Unprivileged,
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Privilege::Root => "root",
            Privilege::Unprivileged => "unprivileged",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// Same inputs give the same layer on every rebuild.
    Repeatable,
    /// Mutates global image state; runs once per build.
    OneTime,
}

impl fmt::Display for Idempotency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Idempotency::Repeatable => "repeatable",
            Idempotency::OneTime => "one-time",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub kind: StageKind,
    pub prerequisites: Vec<StageKind>,
    pub privilege: Privilege,
    pub idempotency: Idempotency,
}

impl StageSpec {
    /// The declared contract of each stage.
    pub fn standard(kind: StageKind) -> Self {
        use StageKind::*;
        let (prerequisites, privilege, idempotency) = match kind {
            TrustStore => (vec![], Privilege::Root, Idempotency::OneTime),
            Dependencies => (vec![TrustStore], Privilege::Root, Idempotency::Repeatable),
            Payload => (vec![Dependencies], Privilege::Root, Idempotency::Repeatable),
            Identity => (
                vec![TrustStore, Dependencies, Payload],
                Privilege::Root,
                Idempotency::OneTime,
            ),
            Environment => (vec![Identity], Privilege::Unprivileged, Idempotency::Repeatable),
            Entrypoint => (
                vec![Payload, Identity, Environment],
                Privilege::Unprivileged,
                Idempotency::Repeatable,
            ),
        };
        Self {
            kind,
            prerequisites,
            privilege,
            idempotency,
        }
    }
}

/// Ordered stages of one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPlan {
    stages: Vec<StageSpec>,
}

impl Default for BuildPlan {
    fn default() -> Self {
        Self::new(StageKind::ALL.iter().copied().map(StageSpec::standard).collect())
    }
}

impl BuildPlan {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind).collect()
    }

    /// Check the plan before execution.
    ///
    /// Every stage appears exactly once, each prerequisite comes earlier,
    /// and no root stage follows the identity stage.
    pub fn validate(&self) -> BotstrapResult<()> {
        let mut seen: HashSet<StageKind> = HashSet::new();
        let mut deescalated = false;

        for spec in &self.stages {
            if seen.contains(&spec.kind) {
                return Err(BotstrapError::Plan(format!(
                    "stage {} appears more than once",
                    spec.kind
                )));
            }
            for prerequisite in &spec.prerequisites {
                if !seen.contains(prerequisite) {
                    return Err(BotstrapError::Plan(format!(
                        "stage {} requires {} to run first",
                        spec.kind, prerequisite
                    )));
                }
            }
            if deescalated && spec.privilege == Privilege::Root {
                return Err(BotstrapError::Plan(format!(
                    "stage {} requires root but runs after privileges were dropped",
                    spec.kind
                )));
            }
            if spec.kind == StageKind::Identity {
                deescalated = true;
            }
            seen.insert(spec.kind);
        }

        if let Some(missing) = StageKind::ALL.iter().find(|kind| !seen.contains(kind)) {
            return Err(BotstrapError::Plan(format!("stage {} is missing", missing)));
        }
        Ok(())
    }
}
