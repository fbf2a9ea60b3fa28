//! botstrap: a secure bootstrap pipeline for bot container images.
//!
//! A build takes a pre-extracted base root filesystem through six ordered
//! stages (trust store, dependencies, payload, identity, environment,
//! entrypoint) and publishes an OCI image layout in which every stage is
//! one layer. At container start, `botstrap launch` binds secrets and
//! overrides and execs the payload as the unprivileged identity.

pub mod build;
pub mod db;
pub mod deps;
pub mod env;
pub mod identity;
pub mod image;
pub mod launch;
pub mod ledger;
pub mod logging;
pub mod pipeline;
pub mod recipe;
pub mod rootfs;
pub mod runtime;
pub mod trust;

pub use botstrap_shared::errors::{BotstrapError, BotstrapResult};
pub use build::{BuildOutcome, BuildPlan, ImageBuilder, StageKind};
pub use db::{BuildStore, Database};
pub use ledger::{BuildLedger, BuildState, LedgerEntry};
pub use recipe::Recipe;
pub use runtime::{BotstrapOptions, FilesystemLayout};
