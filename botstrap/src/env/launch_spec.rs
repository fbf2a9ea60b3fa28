use super::EnvironmentSnapshot;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const LAUNCH_SPEC_VERSION: u32 = 1;

/// What `botstrap launch` reads at container start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub version: u32,
    pub environment: EnvironmentSnapshot,
    /// Payload argv; empty until the entrypoint stage fixes it.
    #[serde(default)]
    pub argv: Vec<String>,
    /// Name of the identity the payload is expected to run as.
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl LaunchSpec {
    pub fn new(environment: EnvironmentSnapshot, user: impl Into<String>) -> Self {
        Self {
            version: LAUNCH_SPEC_VERSION,
            environment,
            argv: Vec::new(),
            user: user.into(),
            working_dir: None,
        }
    }

    pub fn to_json(&self) -> BotstrapResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| BotstrapError::Internal(format!("Failed to serialize launch spec: {}", e)))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn from_json(bytes: &[u8]) -> BotstrapResult<Self> {
        let spec: Self = serde_json::from_slice(bytes)
            .map_err(|e| BotstrapError::Launch(format!("Invalid launch spec: {}", e)))?;
        if spec.version != LAUNCH_SPEC_VERSION {
            return Err(BotstrapError::Launch(format!(
                "Unsupported launch spec version {} (expected {})",
                spec.version, LAUNCH_SPEC_VERSION
            )));
        }
        Ok(spec)
    }

    pub fn load(path: &Path) -> BotstrapResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            BotstrapError::Launch(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&bytes)
    }
}
