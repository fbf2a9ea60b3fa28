//! Build history persistence.
//!
//! SQLite database under the botstrap home directory:
//! - builds: one row per build attempt, with the final ledger as a JSON blob
//! - stage_transitions: one row per completed stage, for querying

mod builds;
mod schema;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};

use botstrap_shared::errors::{BotstrapError, BotstrapResult};

pub use builds::{BuildRecord, BuildStatus, BuildStore};

/// Convert rusqlite errors to BotstrapError.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| BotstrapError::Database(e.to_string()))
    };
}

pub(crate) use db_err;

/// SQLite database handle, shared behind a `parking_lot::Mutex`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database.
    pub fn open(db_path: &Path) -> BotstrapResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;
        Self::configure(conn)
    }

    /// In-memory database, used by tests and `--no-history` dry runs.
    pub fn open_in_memory() -> BotstrapResult<Self> {
        let conn = db_err!(Connection::open_in_memory())?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> BotstrapResult<Self> {
        // WAL for concurrent readers (`history` while a build runs),
        // FULL sync so a published build is never missing its record.
        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA foreign_keys=ON;
            PRAGMA busy_timeout=100000;
            "
        ))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init_schema(conn: &Connection) -> BotstrapResult<()> {
        for sql in schema::all_schemas() {
            db_err!(conn.execute_batch(sql))?;
        }

        let current_version: Option<i32> = db_err!(
            conn.query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
        )?;

        match current_version {
            None => {
                let now = Utc::now().to_rfc3339();
                db_err!(conn.execute(
                    "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                    rusqlite::params![schema::SCHEMA_VERSION, now],
                ))?;
                tracing::debug!(
                    "Initialized history schema version {}",
                    schema::SCHEMA_VERSION
                );
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(BotstrapError::Database(format!(
                    "History schema version {} is newer than supported {}. Please upgrade botstrap.",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_db_open_twice() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("history.db");
        drop(Database::open(&db_path).unwrap());
        let _db = Database::open(&db_path).unwrap();
    }

    #[test]
    fn test_newer_schema_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("history.db");
        {
            let db = Database::open(&db_path).unwrap();
            db.conn()
                .execute("UPDATE schema_version SET version = 99 WHERE id = 1", [])
                .unwrap();
        }
        assert!(matches!(
            Database::open(&db_path),
            Err(BotstrapError::Database(_))
        ));
    }
}
