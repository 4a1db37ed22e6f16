//! `SQLite` schema definitions for the artifact store.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the artifacts table.
///
/// `location_timeline` and `compliance_flags` hold JSON; `media` holds the
/// payload bytes verbatim so the stored row can be re-verified.
pub const CREATE_ARTIFACTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    operator_id TEXT NOT NULL,
    counterparty_id TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER NOT NULL,
    location_timeline TEXT NOT NULL,
    compliance_flags TEXT NOT NULL,
    media BLOB NOT NULL,
    mime_type TEXT NOT NULL,
    media_digest TEXT NOT NULL,
    metadata_digest TEXT NOT NULL,
    upload_state TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// SQL statement to create an index on `organization_id` for the vault view.
pub const CREATE_ORGANIZATION_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_artifacts_organization ON artifacts(organization_id)
";

/// SQL statement to create an index on `upload_state` for pending counts.
pub const CREATE_STATE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_artifacts_state ON artifacts(upload_state)
";

/// SQL statement to create an index on `started_at` for ordering.
pub const CREATE_STARTED_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_artifacts_started ON artifacts(started_at DESC)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_ARTIFACTS_TABLE,
    CREATE_ORGANIZATION_INDEX,
    CREATE_STATE_INDEX,
    CREATE_STARTED_INDEX,
    CREATE_METADATA_TABLE,
];
