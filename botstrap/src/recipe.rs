//! Declarative build recipe (`botstrap.toml`).
//!
//! ```toml
//! [image]
//! base = "rootfs"
//! reference = "helpline-bot:latest"
//!
//! [[trust.anchors]]
//! name = "corp-root"
//! url = "https://pki.example.com/root.pem"
//!
//! [dependencies]
//! manifest = "requirements.lock"
//!
//! [payload]
//! source = "app"
//! workdir = "/app"
//!
//! [environment]
//! timezone = "Europe/Berlin"
//!
//! [entrypoint]
//! argv = ["python3", "main.py"]
//! ```

use crate::env::{EnvironmentRequest, materialize};
use crate::identity::IdentityRequest;
use crate::launch::validate_argv;
use crate::runtime::constants::identity as identity_defaults;
use crate::trust::TrustAnchor;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const DEFAULT_PACKAGE_TARGET: &str = "/usr/local/lib/botstrap/site-packages";
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

fn default_reference() -> String {
    "botstrap:latest".to_string()
}

fn default_package_target() -> String {
    DEFAULT_PACKAGE_TARGET.to_string()
}

fn default_true() -> bool {
    true
}

fn default_workdir() -> String {
    "/app".to_string()
}

fn default_identity_name() -> String {
    identity_defaults::DEFAULT_NAME.to_string()
}

fn default_fetch_timeout() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    /// Pre-extracted base root filesystem.
    pub base: PathBuf,
    #[serde(default = "default_reference")]
    pub reference: String,
    pub architecture: Option<String>,
    pub os: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustSection {
    #[serde(default)]
    pub anchors: Vec<TrustAnchor>,
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
}

impl Default for TrustSection {
    fn default() -> Self {
        Self {
            anchors: Vec::new(),
            timeout_secs: default_fetch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependenciesSection {
    pub manifest: Option<PathBuf>,
    /// Image path packages are installed into.
    #[serde(default = "default_package_target")]
    pub target: String,
    #[serde(default = "default_true")]
    pub require_pins: bool,
    /// Installer command prefix, `python3 -m pip` when unset.
    pub installer: Option<Vec<String>>,
}

impl Default for DependenciesSection {
    fn default() -> Self {
        Self {
            manifest: None,
            target: default_package_target(),
            require_pins: true,
            installer: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PayloadSection {
    pub source: PathBuf,
    #[serde(default = "default_workdir")]
    pub workdir: String,
    /// Route the entrypoint through `botstrap launch`.
    #[serde(default = "default_true")]
    pub supervised: bool,
    /// Host path of the launcher binary; the running executable when unset.
    pub launcher: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentitySection {
    #[serde(default = "default_identity_name")]
    pub name: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            name: default_identity_name(),
            uid: None,
            gid: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSection {
    pub timezone: Option<String>,
    /// Secret name for the bot credential.
    pub auth_token: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub locked: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntrypointSection {
    pub argv: Vec<String>,
}

/// A parsed recipe with paths resolved against its directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub image: ImageSection,
    #[serde(default)]
    pub trust: TrustSection,
    #[serde(default)]
    pub dependencies: DependenciesSection,
    pub payload: PayloadSection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub environment: EnvironmentSection,
    pub entrypoint: EntrypointSection,
}

fn anchor_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("anchor name regex is valid"))
}

fn user_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("user name regex is valid"))
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn require_image_path(field: &str, value: &str) -> BotstrapResult<()> {
    let path = Path::new(value);
    if !path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(BotstrapError::Config(format!(
            "{} must be an absolute image path without '..': {}",
            field, value
        )));
    }
    Ok(())
}

impl Recipe {
    /// Read, parse and validate a recipe file.
    pub fn load(path: &Path) -> BotstrapResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BotstrapError::Config(format!("Failed to read recipe {}: {}", path.display(), e))
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base_dir)
    }

    /// Parse and validate recipe text; relative paths resolve against `base_dir`.
    pub fn parse(text: &str, base_dir: &Path) -> BotstrapResult<Self> {
        let mut recipe: Recipe = toml::from_str(text)
            .map_err(|e| BotstrapError::Config(format!("Invalid recipe: {}", e)))?;

        recipe.image.base = resolve(base_dir, &recipe.image.base);
        recipe.payload.source = resolve(base_dir, &recipe.payload.source);
        if let Some(manifest) = &recipe.dependencies.manifest {
            recipe.dependencies.manifest = Some(resolve(base_dir, manifest));
        }
        if let Some(launcher) = &recipe.payload.launcher {
            recipe.payload.launcher = Some(resolve(base_dir, launcher));
        }

        recipe.validate()?;
        Ok(recipe)
    }

    /// Static checks that need no network and no rootfs.
    pub fn validate(&self) -> BotstrapResult<()> {
        let mut names = BTreeSet::new();
        for anchor in &self.trust.anchors {
            if !anchor_name_regex().is_match(&anchor.name) {
                return Err(BotstrapError::Config(format!(
                    "invalid trust anchor name '{}'",
                    anchor.name
                )));
            }
            if !names.insert(anchor.name.as_str()) {
                return Err(BotstrapError::Config(format!(
                    "duplicate trust anchor '{}'",
                    anchor.name
                )));
            }
            if !anchor.url.starts_with("https://") {
                return Err(BotstrapError::Config(format!(
                    "trust anchor '{}' must use https: {}",
                    anchor.name, anchor.url
                )));
            }
        }

        require_image_path("dependencies.target", &self.dependencies.target)?;
        if self
            .dependencies
            .installer
            .as_ref()
            .is_some_and(|installer| installer.is_empty())
        {
            return Err(BotstrapError::Config("dependencies.installer is empty".into()));
        }

        require_image_path("payload.workdir", &self.payload.workdir)?;

        if !user_name_regex().is_match(&self.identity.name) {
            return Err(BotstrapError::Config(format!(
                "invalid identity name '{}'",
                self.identity.name
            )));
        }
        if self.identity.name == "root" || self.identity.uid == Some(0) || self.identity.gid == Some(0) {
            return Err(BotstrapError::Privilege(
                "execution identity must not be root".into(),
            ));
        }

        materialize(&self.environment_request())?;
        validate_argv(&self.entrypoint.argv)?;
        Ok(())
    }

    pub fn environment_request(&self) -> EnvironmentRequest {
        let mut vars = self.environment.vars.clone();
        if self.dependencies.manifest.is_some() && !vars.contains_key("PYTHONPATH") {
            vars.insert("PYTHONPATH".to_string(), self.dependencies.target.clone());
        }
        EnvironmentRequest {
            timezone: self.environment.timezone.clone(),
            auth_token: self.environment.auth_token.clone(),
            vars,
            secrets: self.environment.secrets.clone(),
            locked: self.environment.locked.clone(),
        }
    }

    pub fn identity_request(&self) -> IdentityRequest {
        let mut request = IdentityRequest::named(self.identity.name.clone());
        request.uid = self.identity.uid;
        request.gid = self.identity.gid;
        request
    }
}
