//! Frozen runtime configuration and its validation rules.

use crate::runtime::constants::env as names;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Environment captured at build time.
///
/// `defaults` are concrete values baked into the image config. `secrets`
/// are names only; their values are supplied when the container starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub defaults: BTreeMap<String, String>,
    pub secrets: BTreeSet<String>,
    /// Defaults a container instance may replace.
    pub overridable: BTreeSet<String>,
}

impl EnvironmentSnapshot {
    /// `NAME=value` pairs for the OCI `Env` field.
    pub fn oci_env(&self) -> Vec<String> {
        self.defaults
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect()
    }

    pub fn timezone(&self) -> Option<&str> {
        self.defaults.get(names::TIMEZONE).map(String::as_str)
    }
}

/// Recognized runtime options plus free-form variables.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRequest {
    /// IANA zone name exported as `TZ`.
    pub timezone: Option<String>,
    /// Name of the secret carrying the bot credential.
    pub auth_token: Option<String>,
    pub vars: BTreeMap<String, String>,
    pub secrets: Vec<String>,
    /// Defaults the container cannot replace.
    pub locked: Vec<String>,
}

fn env_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env name regex is valid"))
}

fn bot_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9]{5,}:[A-Za-z0-9_-]{35,}$").expect("bot token regex is valid")
    })
}

fn timezone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_+-]*(/[A-Za-z0-9][A-Za-z0-9_+-]*){0,2}$")
            .expect("timezone regex is valid")
    })
}

/// True for values shaped like a live bot API credential.
pub fn looks_like_bot_token(value: &str) -> bool {
    bot_token_regex().is_match(value.trim())
}

pub fn validate_env_name(name: &str) -> BotstrapResult<()> {
    if env_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(BotstrapError::Config(format!(
            "invalid environment variable name '{}'",
            name
        )))
    }
}

/// Syntactic check of an IANA zone name such as `UTC` or `Europe/Berlin`.
pub fn validate_timezone(tz: &str) -> BotstrapResult<()> {
    if timezone_regex().is_match(tz) && !tz.split('/').any(|part| part == "." || part == "..") {
        Ok(())
    } else {
        Err(BotstrapError::Config(format!("invalid timezone '{}'", tz)))
    }
}

/// Build the snapshot from a request.
///
/// Fails if a plain variable carries a declared secret's name or a value
/// that looks like a credential.
pub fn materialize(request: &EnvironmentRequest) -> BotstrapResult<EnvironmentSnapshot> {
    let mut snapshot = EnvironmentSnapshot::default();

    let auth_token = request
        .auth_token
        .clone()
        .unwrap_or_else(|| names::DEFAULT_AUTH_TOKEN.to_string());
    for secret in std::iter::once(&auth_token).chain(request.secrets.iter()) {
        validate_env_name(secret)?;
        snapshot.secrets.insert(secret.clone());
    }

    if let Some(tz) = &request.timezone {
        validate_timezone(tz)?;
        snapshot
            .defaults
            .insert(names::TIMEZONE.to_string(), tz.clone());
    }

    for (name, value) in &request.vars {
        validate_env_name(name)?;
        if snapshot.secrets.contains(name) {
            return Err(BotstrapError::Secret(format!(
                "'{}' is declared as a secret and cannot have a baked value",
                name
            )));
        }
        if name == names::TIMEZONE && request.timezone.is_some() {
            return Err(BotstrapError::Config(format!(
                "'{}' is set both as timezone and as a variable",
                name
            )));
        }
        if looks_like_bot_token(value) {
            return Err(BotstrapError::Secret(format!(
                "value of '{}' looks like a bot credential; declare it as a secret instead",
                name
            )));
        }
        snapshot.defaults.insert(name.clone(), value.clone());
    }

    for name in &request.locked {
        if !snapshot.defaults.contains_key(name) {
            return Err(BotstrapError::Config(format!(
                "locked variable '{}' has no default",
                name
            )));
        }
    }
    snapshot.overridable = snapshot
        .defaults
        .keys()
        .filter(|name| !request.locked.contains(name))
        .cloned()
        .collect();

    Ok(snapshot)
}
