//! Botstrap home directory layout.

use std::path::{Path, PathBuf};

use super::constants::filenames;

/// Layout of `BOTSTRAP_HOME`.
///
/// ```text
/// ~/.botstrap/
/// ├── db/botstrap.db
/// └── logs/botstrap.log.<date>
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.home_dir.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join(filenames::DB)
    }
}
