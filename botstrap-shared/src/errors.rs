//! Error taxonomy for the bootstrap pipeline.
//!
//! Every build-time error is fatal: a failed stage aborts the pipeline and
//! no image is published. The first five variants are the stage failures;
//! the rest cover configuration, plan validation and the runtime launcher.

use thiserror::Error;

/// Result alias used across botstrap.
pub type BotstrapResult<T> = Result<T, BotstrapError>;

#[derive(Debug, Error)]
pub enum BotstrapError {
    /// A certificate authority could not be retrieved, or the payload
    /// was not a certificate.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// Trust-store rebuild or package installation reported an inconsistency.
    #[error("install error: {0}")]
    Install(String),

    /// A declared dependency could not be located or its constraints are unsatisfiable.
    #[error("resolution error: {0}")]
    Resolution(String),

    /// The payload source directory is absent.
    #[error("missing source: {0}")]
    MissingSource(String),

    /// The execution identity already exists in the base image.
    #[error("identity conflict: {0}")]
    IdentityConflict(String),

    /// Invalid recipe or options.
    #[error("configuration error: {0}")]
    Config(String),

    /// The stage graph is not a valid total order.
    #[error("invalid plan: {0}")]
    Plan(String),

    /// A stage or process would run with the wrong privilege.
    #[error("privilege error: {0}")]
    Privilege(String),

    /// A declared secret was not supplied at container start.
    #[error("secret error: {0}")]
    Secret(String),

    /// The entrypoint could not be executed.
    #[error("launch error: {0}")]
    Launch(String),

    /// OCI image layout could not be written.
    #[error("image error: {0}")]
    Image(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BotstrapError {
    /// Short, stable name of the error class (used in the build history).
    pub fn kind(&self) -> &'static str {
        match self {
            BotstrapError::Fetch(_) => "fetch",
            BotstrapError::Install(_) => "install",
            BotstrapError::Resolution(_) => "resolution",
            BotstrapError::MissingSource(_) => "missing_source",
            BotstrapError::IdentityConflict(_) => "identity_conflict",
            BotstrapError::Config(_) => "config",
            BotstrapError::Plan(_) => "plan",
            BotstrapError::Privilege(_) => "privilege",
            BotstrapError::Secret(_) => "secret",
            BotstrapError::Launch(_) => "launch",
            BotstrapError::Image(_) => "image",
            BotstrapError::Storage(_) => "storage",
            BotstrapError::Database(_) => "database",
            BotstrapError::Internal(_) => "internal",
            BotstrapError::Io(_) => "io",
        }
    }
}
