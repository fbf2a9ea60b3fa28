use crate::runtime::constants::env as names;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::Path;

/// Where a secret value came from. Only the source is ever logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Environment,
    File,
    Mounted,
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SecretSource::Environment => "environment",
            SecretSource::File => "file",
            SecretSource::Mounted => "mounted",
        })
    }
}

fn read_secret_file(path: &Path, name: &str) -> BotstrapResult<String> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BotstrapError::Secret(format!(
            "Failed to read secret {} from {}: {}",
            name,
            path.display(),
            e
        ))
    })?;
    let value = raw.trim_end_matches(['\r', '\n']).to_string();
    if value.is_empty() {
        return Err(BotstrapError::Secret(format!(
            "secret {} in {} is empty",
            name,
            path.display()
        )));
    }
    Ok(value)
}

/// Resolve one secret: `NAME`, then `NAME_FILE`, then `<secrets_dir>/<name>`.
pub fn resolve_secret(
    name: &str,
    inherited: &BTreeMap<OsString, OsString>,
    secrets_dir: &Path,
) -> BotstrapResult<(OsString, SecretSource)> {
    if let Some(value) = inherited.get(OsStr::new(name)).filter(|v| !v.is_empty()) {
        return Ok((value.clone(), SecretSource::Environment));
    }

    let file_var = format!("{}{}", name, names::FILE_SUFFIX);
    if let Some(path) = inherited.get(OsStr::new(&file_var)).filter(|v| !v.is_empty()) {
        let value = read_secret_file(Path::new(path), name)?;
        return Ok((value.into(), SecretSource::File));
    }

    let mounted = secrets_dir.join(name.to_lowercase());
    if mounted.is_file() {
        return Ok((read_secret_file(&mounted, name)?.into(), SecretSource::Mounted));
    }

    Err(BotstrapError::Secret(format!(
        "secret {} is not set (checked ${}, ${} and {})",
        name,
        name,
        file_var,
        mounted.display()
    )))
}
