//! Host options for the botstrap runtime.

use crate::runtime::constants::env;
use std::path::PathBuf;

/// Options controlling where botstrap keeps its own state.
#[derive(Debug, Clone)]
pub struct BotstrapOptions {
    /// Home directory for logs and the build history database.
    pub home_dir: PathBuf,
    /// Record builds in the history database.
    pub record_history: bool,
    /// Write a rolling log file under `home_dir/logs`.
    pub log_to_file: bool,
}

impl Default for BotstrapOptions {
    fn default() -> Self {
        let home_dir = std::env::var_os(env::BOTSTRAP_HOME)
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".botstrap")))
            .unwrap_or_else(|| std::env::temp_dir().join("botstrap"));

        Self {
            home_dir,
            record_history: true,
            log_to_file: true,
        }
    }
}

impl BotstrapOptions {
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            ..Self::default()
        }
    }
}
