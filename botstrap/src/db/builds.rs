//! Build records and their stage transitions.

use super::{Database, db_err};
use crate::ledger::{BuildLedger, BuildState, LedgerEntry};
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Running,
    Published,
    Failed,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Running => "running",
            BuildStatus::Published => "published",
            BuildStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = BotstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(BuildStatus::Running),
            "published" => Ok(BuildStatus::Published),
            "failed" => Ok(BuildStatus::Failed),
            other => Err(BotstrapError::Database(format!(
                "unknown build status '{}'",
                other
            ))),
        }
    }
}

/// One row of the `builds` table.
#[derive(Debug, Clone)]
pub struct BuildRecord {
    pub id: String,
    pub recipe: String,
    pub output: String,
    pub status: BuildStatus,
    pub state: String,
    pub manifest_digest: Option<String>,
    pub error: Option<String>,
    pub ledger: BuildLedger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Build history store.
#[derive(Clone)]
pub struct BuildStore {
    db: Database,
}

fn parse_time(value: &str) -> BotstrapResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| BotstrapError::Database(format!("invalid timestamp '{}': {}", value, e)))
}

impl BuildStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a build in the `running` state.
    pub fn begin(&self, build_id: &str, recipe: &str, output: &str) -> BotstrapResult<()> {
        let ledger = BuildLedger::new(build_id).to_json()?;
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT INTO builds (id, recipe, output, status, state, ledger, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                build_id,
                recipe,
                output,
                BuildStatus::Running.as_str(),
                BuildState::Start.as_str(),
                ledger,
                Utc::now().to_rfc3339(),
            ],
        ))?;
        Ok(())
    }

    /// Append one completed stage.
    pub fn record_transition(&self, build_id: &str, seq: usize, entry: &LedgerEntry) -> BotstrapResult<()> {
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT INTO stage_transitions
             (build_id, seq, stage, from_state, to_state, layer_digest, identity, changed_paths, duration_ms, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                build_id,
                seq as i64,
                entry.stage,
                entry.from.as_str(),
                entry.to.as_str(),
                entry.layer_digest,
                entry.identity,
                entry.changed_paths as i64,
                entry.duration_ms as i64,
                entry.completed_at.to_rfc3339(),
            ],
        ))?;
        db_err!(conn.execute(
            "UPDATE builds SET state = ?2 WHERE id = ?1",
            rusqlite::params![build_id, entry.to.as_str()],
        ))?;
        Ok(())
    }

    /// Close out a build with its final ledger.
    pub fn finish(
        &self,
        ledger: &BuildLedger,
        status: BuildStatus,
        manifest_digest: Option<&str>,
        error: Option<&str>,
    ) -> BotstrapResult<()> {
        let json = ledger.to_json()?;
        let conn = self.db.conn();
        let updated = db_err!(conn.execute(
            "UPDATE builds
             SET status = ?2, state = ?3, manifest_digest = ?4, error = ?5, ledger = ?6, finished_at = ?7
             WHERE id = ?1",
            rusqlite::params![
                ledger.build_id,
                status.as_str(),
                ledger.state().as_str(),
                manifest_digest,
                error,
                json,
                Utc::now().to_rfc3339(),
            ],
        ))?;
        if updated == 0 {
            return Err(BotstrapError::Database(format!(
                "build {} not found",
                ledger.build_id
            )));
        }
        Ok(())
    }

    pub fn get(&self, build_id: &str) -> BotstrapResult<Option<BuildRecord>> {
        let conn = self.db.conn();
        let row = db_err!(
            conn.query_row(
                "SELECT id, recipe, output, status, state, manifest_digest, error, ledger, started_at, finished_at
                 FROM builds WHERE id = ?1",
                [build_id],
                Self::raw_row,
            )
            .optional()
        )?;
        row.map(Self::into_record).transpose()
    }

    /// Most recent builds first.
    pub fn list(&self, limit: usize) -> BotstrapResult<Vec<BuildRecord>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(
            "SELECT id, recipe, output, status, state, manifest_digest, error, ledger, started_at, finished_at
             FROM builds ORDER BY started_at DESC, id DESC LIMIT ?1"
        ))?;
        let rows = db_err!(stmt.query_map([limit as i64], Self::raw_row))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(Self::into_record(db_err!(row)?)?);
        }
        Ok(records)
    }

    /// Number of recorded transitions for a build.
    pub fn transition_count(&self, build_id: &str) -> BotstrapResult<usize> {
        let conn = self.db.conn();
        let count: i64 = db_err!(conn.query_row(
            "SELECT COUNT(*) FROM stage_transitions WHERE build_id = ?1",
            [build_id],
            |row| row.get(0),
        ))?;
        Ok(count as usize)
    }

    fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawBuildRow> {
        Ok(RawBuildRow {
            id: row.get(0)?,
            recipe: row.get(1)?,
            output: row.get(2)?,
            status: row.get(3)?,
            state: row.get(4)?,
            manifest_digest: row.get(5)?,
            error: row.get(6)?,
            ledger: row.get(7)?,
            started_at: row.get(8)?,
            finished_at: row.get(9)?,
        })
    }

    fn into_record(raw: RawBuildRow) -> BotstrapResult<BuildRecord> {
        let ledger: BuildLedger = serde_json::from_str(&raw.ledger)
            .map_err(|e| BotstrapError::Database(format!("corrupt ledger for {}: {}", raw.id, e)))?;
        Ok(BuildRecord {
            status: raw.status.parse()?,
            started_at: parse_time(&raw.started_at)?,
            finished_at: raw.finished_at.as_deref().map(parse_time).transpose()?,
            id: raw.id,
            recipe: raw.recipe,
            output: raw.output,
            state: raw.state,
            manifest_digest: raw.manifest_digest,
            error: raw.error,
            ledger,
        })
    }
}

struct RawBuildRow {
    id: String,
    recipe: String,
    output: String,
    status: String,
    state: String,
    manifest_digest: Option<String>,
    error: Option<String>,
    ledger: String,
    started_at: String,
    finished_at: Option<String>,
}
