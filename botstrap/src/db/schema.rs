pub(super) const SCHEMA_VERSION: i32 = 1;

const SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

const BUILDS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS builds (
    id TEXT PRIMARY KEY NOT NULL,
    recipe TEXT NOT NULL,
    output TEXT NOT NULL,
    status TEXT NOT NULL,
    state TEXT NOT NULL,
    manifest_digest TEXT,
    error TEXT,
    ledger TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_builds_started_at ON builds(started_at);
";

const STAGE_TRANSITIONS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS stage_transitions (
    build_id TEXT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    stage TEXT NOT NULL,
    from_state TEXT NOT NULL,
    to_state TEXT NOT NULL,
    layer_digest TEXT NOT NULL,
    identity TEXT NOT NULL,
    changed_paths INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    completed_at TEXT NOT NULL,
    PRIMARY KEY (build_id, seq)
);
";

pub(super) fn all_schemas() -> [&'static str; 3] {
    [SCHEMA_VERSION_TABLE, BUILDS_TABLE, STAGE_TRANSITIONS_TABLE]
}
