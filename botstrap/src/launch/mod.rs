//! Container-start launcher.
//!
//! Reads the launch spec written at build time, binds secrets and
//! overrides from the container environment, and replaces itself with the
//! payload process. No shell is involved at any point.

mod secrets;

pub use secrets::{SecretSource, resolve_secret};

use crate::env::LaunchSpec;
use crate::runtime::constants::{env as names, image_paths};
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::ffi::{OsStr, OsString};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};

/// Where the launcher looks for its inputs.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub spec_path: PathBuf,
    pub secrets_dir: PathBuf,
    /// Argv passed on the command line; replaces the launch spec's argv when non-empty.
    pub argv: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            spec_path: PathBuf::from(image_paths::LAUNCH_SPEC),
            secrets_dir: PathBuf::from(image_paths::SECRETS_DIR),
            argv: Vec::new(),
        }
    }
}

/// Compute the payload environment.
///
/// Starts from `inherited`. Defaults fill names the container did not set,
/// and locked defaults always win. Every declared secret must resolve.
/// Inherited values pass through byte for byte, whatever their encoding.
pub fn resolve_environment(
    spec: &LaunchSpec,
    inherited: &BTreeMap<OsString, OsString>,
    secrets_dir: &Path,
) -> BotstrapResult<BTreeMap<OsString, OsString>> {
    let snapshot = &spec.environment;
    let mut effective = inherited.clone();

    for (name, default) in &snapshot.defaults {
        let overridden =
            snapshot.overridable.contains(name) && inherited.contains_key(OsStr::new(name));
        if overridden {
            tracing::debug!(name = %name, "Using container override");
        } else {
            effective.insert(OsString::from(name), OsString::from(default));
        }
    }

    for name in &snapshot.secrets {
        let (value, source) = resolve_secret(name, inherited, secrets_dir)?;
        tracing::debug!(name = %name, source = %source, "Secret resolved");
        effective.insert(OsString::from(name), value);
        effective.remove(OsStr::new(&format!("{}{}", name, names::FILE_SUFFIX)));
    }

    Ok(effective)
}

/// Refuse to start the payload with effective uid 0.
pub fn ensure_unprivileged(euid: u32) -> BotstrapResult<()> {
    if euid == 0 {
        return Err(BotstrapError::Privilege(
            "refusing to launch the payload as root".into(),
        ));
    }
    Ok(())
}

const SHELLS: [&str; 6] = ["sh", "bash", "dash", "ash", "zsh", "ksh"];

/// Check an exec-form command vector.
///
/// Must be non-empty and must not hand a command string to a shell via `-c`.
pub fn validate_argv(argv: &[String]) -> BotstrapResult<()> {
    let Some(program) = argv.first() else {
        return Err(BotstrapError::Config("entrypoint argv is empty".into()));
    };
    if program.trim().is_empty() {
        return Err(BotstrapError::Config("entrypoint program is empty".into()));
    }
    let base = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if SHELLS.contains(&base.as_str()) && argv[1..].iter().any(|a| a == "-c") {
        return Err(BotstrapError::Config(format!(
            "entrypoint must be exec form, not '{} -c ...'",
            program
        )));
    }
    Ok(())
}

/// Final argv: the command line wins over the baked one.
pub fn effective_argv(spec: &LaunchSpec, argv: &[String]) -> BotstrapResult<Vec<String>> {
    let argv = if argv.is_empty() { &spec.argv } else { argv };
    if argv.is_empty() {
        return Err(BotstrapError::Launch("no command to launch".into()));
    }
    validate_argv(argv).map_err(|e| BotstrapError::Launch(e.to_string()))?;
    Ok(argv.to_vec())
}

/// Resolve everything and exec the payload.
///
/// Returns only on failure.
pub fn launch(options: &LaunchOptions) -> BotstrapResult<Infallible> {
    let spec = LaunchSpec::load(&options.spec_path)?;

    ensure_unprivileged(nix::unistd::geteuid().as_raw())?;

    let inherited: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
    let environment = resolve_environment(&spec, &inherited, &options.secrets_dir)?;
    let argv = effective_argv(&spec, &options.argv)?;

    tracing::info!(
        program = %argv[0],
        args = argv.len() - 1,
        secrets = spec.environment.secrets.len(),
        "Launching payload"
    );

    let mut command = std::process::Command::new(&argv[0]);
    command.args(&argv[1..]).env_clear().envs(&environment);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }

    let err = command.exec();
    Err(BotstrapError::Launch(format!(
        "Failed to exec {}: {}",
        argv[0], err
    )))
}
