//! Dependency provisioning: manifest parsing, resolution and installation.

mod installer;
mod manifest;
mod version;

pub use installer::{InstallRequest, PackageInstaller, PipInstaller};
pub use manifest::{
    Constraint, DependencyManifest, Operator, Requirement, ResolvedPackage, ResolvedSet,
    normalize_name,
};
pub use version::Version;
