//! Storage layer for sealed artifacts.
//!
//! [`ArtifactStore`] is the persistence boundary the offline queue writes
//! through. [`SqliteStore`] is the durable implementation: one row per
//! artifact, payload included, so a record can be re-verified and re-sent
//! after a restart.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::artifact::{MediaPayload, SealedArtifact, UploadState};
use crate::error::{Error, Result};

const SELECT_COLUMNS: &str = r"
    SELECT id, task_id, organization_id, operator_id, counterparty_id,
           started_at, ended_at, location_timeline, compliance_flags,
           media, mime_type, media_digest, metadata_digest, upload_state
    FROM artifacts
";

/// The persistence boundary.
///
/// Implementations must be durable across restarts. Calls may block; async
/// callers should go through `spawn_blocking`.
pub trait ArtifactStore: Send + Sync {
    /// Insert or replace the artifact with this id.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn put(&self, artifact: &SealedArtifact) -> Result<()>;

    /// Look up one artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get(&self, id: &str) -> Result<Option<SealedArtifact>>;

    /// Every stored artifact, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get_all(&self) -> Result<Vec<SealedArtifact>>;

    /// Change the upload state of an existing artifact.
    ///
    /// Never creates a row. Returns `false` if no artifact has this id.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn set_upload_state(&self, id: &str, state: UploadState) -> Result<bool>;

    /// Delete one artifact. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn delete(&self, id: &str) -> Result<bool>;
}

/// `SQLite`-backed artifact store.
#[derive(Debug)]
pub struct SqliteStore {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    /// Initializes the schema if this is a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening artifact store at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // WAL keeps list reads from blocking behind payload writes.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        migrations::initialize_schema(&conn)?;

        info!("Artifact store opened at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count stored artifacts.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn count(&self) -> Result<i64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM artifacts", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Count artifacts in one upload state.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn count_in_state(&self, state: UploadState) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM artifacts WHERE upload_state = ?1",
            [state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Get store statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StoreStats> {
        let total_artifacts = self.count()?;
        let pending = self.count_in_state(UploadState::Pending)?;
        let uploading = self.count_in_state(UploadState::Uploading)?;
        let uploaded = self.count_in_state(UploadState::Uploaded)?;
        let failed = self.count_in_state(UploadState::Failed)?;

        let (oldest, newest): (Option<i64>, Option<i64>) = self.conn().query_row(
            "SELECT MIN(started_at), MAX(started_at) FROM artifacts",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StoreStats {
            total_artifacts,
            pending,
            uploading,
            uploaded,
            failed,
            oldest_capture: oldest.and_then(DateTime::from_timestamp_millis),
            newest_capture: newest.and_then(DateTime::from_timestamp_millis),
            db_size_bytes,
        })
    }

    /// Convert a database row to a [`SealedArtifact`].
    fn row_to_artifact(row: &rusqlite::Row) -> rusqlite::Result<SealedArtifact> {
        let id: String = row.get(0)?;
        let timeline_json: String = row.get(7)?;
        let flags_json: String = row.get(8)?;
        let media: Vec<u8> = row.get(9)?;
        let mime_type: String = row.get(10)?;
        let state_str: String = row.get(13)?;

        let location_timeline = serde_json::from_str(&timeline_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
        let compliance_flags = serde_json::from_str(&flags_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;

        let upload_state = state_str.parse().unwrap_or_else(|_| {
            warn!(
                "Unknown upload state {:?} on artifact {}, treating as failed",
                state_str, id
            );
            UploadState::Failed
        });

        Ok(SealedArtifact {
            id,
            task_id: row.get(1)?,
            organization_id: row.get(2)?,
            operator_id: row.get(3)?,
            counterparty_id: row.get(4)?,
            started_at_ms: row.get(5)?,
            ended_at_ms: row.get(6)?,
            location_timeline,
            compliance_flags,
            media: MediaPayload::new(media, mime_type),
            media_digest: row.get(11)?,
            metadata_digest: row.get(12)?,
            upload_state,
        })
    }
}

impl ArtifactStore for SqliteStore {
    fn put(&self, artifact: &SealedArtifact) -> Result<()> {
        let timeline = serde_json::to_string(artifact.location_timeline())?;
        let flags = serde_json::to_string(&artifact.compliance_flags())?;

        self.conn().execute(
            r"
            INSERT INTO artifacts (
                id, task_id, organization_id, operator_id, counterparty_id,
                started_at, ended_at, location_timeline, compliance_flags,
                media, mime_type, media_digest, metadata_digest, upload_state
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(id) DO UPDATE SET
                task_id = excluded.task_id,
                organization_id = excluded.organization_id,
                operator_id = excluded.operator_id,
                counterparty_id = excluded.counterparty_id,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                location_timeline = excluded.location_timeline,
                compliance_flags = excluded.compliance_flags,
                media = excluded.media,
                mime_type = excluded.mime_type,
                media_digest = excluded.media_digest,
                metadata_digest = excluded.metadata_digest,
                upload_state = excluded.upload_state
            ",
            params![
                artifact.id(),
                artifact.task_id(),
                artifact.organization_id(),
                artifact.operator_id(),
                artifact.counterparty_id(),
                artifact.started_at_ms(),
                artifact.ended_at_ms(),
                timeline,
                flags,
                artifact.media().bytes.as_ref(),
                artifact.media().mime_type,
                artifact.media_digest(),
                artifact.metadata_digest(),
                artifact.upload_state().as_str(),
            ],
        )?;

        debug!(
            "Stored artifact {} ({})",
            artifact.id(),
            artifact.upload_state()
        );
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<SealedArtifact>> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let result = self
            .conn()
            .query_row(&sql, [id], Self::row_to_artifact)
            .optional()?;
        Ok(result)
    }

    fn get_all(&self) -> Result<Vec<SealedArtifact>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY started_at DESC, id ASC");
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let artifacts = stmt
            .query_map([], Self::row_to_artifact)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(artifacts)
    }

    fn set_upload_state(&self, id: &str, state: UploadState) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE artifacts SET upload_state = ?2 WHERE id = ?1",
            params![id, state.as_str()],
        )?;
        if affected > 0 {
            debug!("Artifact {} is now {}", id, state);
        }
        Ok(affected > 0)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM artifacts WHERE id = ?1", [id])?;
        if affected > 0 {
            info!("Deleted artifact {}", id);
        }
        Ok(affected > 0)
    }
}

/// Statistics about the store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    /// Total number of artifacts stored.
    pub total_artifacts: i64,
    /// Artifacts waiting to be sent.
    pub pending: i64,
    /// Artifacts marked as in transfer.
    pub uploading: i64,
    /// Artifacts the remote store accepted.
    pub uploaded: i64,
    /// Artifacts whose last transfer failed.
    pub failed: i64,
    /// Start of the oldest capture.
    pub oldest_capture: Option<DateTime<Utc>>,
    /// Start of the newest capture.
    pub newest_capture: Option<DateTime<Utc>>,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::SessionRecord;
    use crate::compliance::ComplianceFlags;
    use crate::location::LocationSample;
    use crate::seal::Sealer;
    use crate::session::{Party, SessionContext, TaskRef};

    fn create_test_store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("failed to create test store")
    }

    fn create_test_artifact(org: &str, started_at_ms: i64) -> SealedArtifact {
        let context = SessionContext::new(
            TaskRef::new("T-1", "C-1"),
            Party::new("op-1", "Ana"),
            Party::new(org, "Org"),
            started_at_ms,
        );
        SealedArtifact::seal(
            &context,
            SessionRecord {
                started_at_ms,
                ended_at_ms: started_at_ms + 5_000,
                location_timeline: vec![
                    LocationSample::new(40.0, -74.0, 12.5, started_at_ms + 100),
                    LocationSample::new(40.25, -74.5, 75.0, started_at_ms + 200),
                ],
                compliance_flags: ComplianceFlags {
                    accuracy_exceeded: true,
                    ..ComplianceFlags::default()
                },
            },
            MediaPayload::webm(vec![7u8; 1024]),
            &Sealer,
        )
        .unwrap()
    }

    #[test]
    fn test_open_in_memory() {
        let store = SqliteStore::open_in_memory();
        assert!(store.is_ok());
    }

    #[test]
    fn test_put_and_get_round_trip() {
        let store = create_test_store();
        let artifact = create_test_artifact("org-1", 1_000);

        store.put(&artifact).unwrap();
        let loaded = store.get(artifact.id()).unwrap().unwrap();

        assert_eq!(loaded, artifact);
        assert!(Sealer.verify(&loaded).unwrap().is_intact());
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_put_is_upsert() {
        let store = create_test_store();
        let mut artifact = create_test_artifact("org-1", 1_000);
        store.put(&artifact).unwrap();

        artifact.upload_state = UploadState::Failed;
        store.put(&artifact).unwrap();

        assert_eq!(store.count().unwrap(), 1);
        let loaded = store.get(artifact.id()).unwrap().unwrap();
        assert_eq!(loaded.upload_state(), UploadState::Failed);
    }

    #[test]
    fn test_get_all_newest_first() {
        let store = create_test_store();
        store.put(&create_test_artifact("org-1", 1_000)).unwrap();
        store.put(&create_test_artifact("org-1", 3_000)).unwrap();
        store.put(&create_test_artifact("org-2", 2_000)).unwrap();

        let started: Vec<i64> = store
            .get_all()
            .unwrap()
            .iter()
            .map(SealedArtifact::started_at_ms)
            .collect();
        assert_eq!(started, vec![3_000, 2_000, 1_000]);
    }

    #[test]
    fn test_delete() {
        let store = create_test_store();
        let artifact = create_test_artifact("org-1", 1_000);
        store.put(&artifact).unwrap();

        assert!(store.delete(artifact.id()).unwrap());
        assert!(!store.delete(artifact.id()).unwrap());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_set_upload_state_only_touches_existing_rows() {
        let store = create_test_store();
        let artifact = create_test_artifact("org-1", 1_000);
        store.put(&artifact).unwrap();

        assert!(store
            .set_upload_state(artifact.id(), UploadState::Uploading)
            .unwrap());
        let loaded = store.get(artifact.id()).unwrap().unwrap();
        assert_eq!(loaded.upload_state(), UploadState::Uploading);
        assert_eq!(loaded.media(), artifact.media());

        store.delete(artifact.id()).unwrap();
        assert!(!store
            .set_upload_state(artifact.id(), UploadState::Uploaded)
            .unwrap());
        assert!(store.get(artifact.id()).unwrap().is_none());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_unknown_state_reads_as_failed() {
        let store = create_test_store();
        let artifact = create_test_artifact("org-1", 1_000);
        store.put(&artifact).unwrap();
        store
            .conn()
            .execute(
                "UPDATE artifacts SET upload_state = 'lost' WHERE id = ?1",
                [artifact.id()],
            )
            .unwrap();

        let loaded = store.get(artifact.id()).unwrap().unwrap();
        assert_eq!(loaded.upload_state(), UploadState::Failed);
    }

    #[test]
    fn test_stats() {
        let store = create_test_store();
        let mut uploaded = create_test_artifact("org-1", 1_000);
        uploaded.upload_state = UploadState::Uploaded;
        store.put(&uploaded).unwrap();
        store.put(&create_test_artifact("org-1", 2_000)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_artifacts, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.uploaded, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.oldest_capture.unwrap().timestamp_millis(), 1_000);
        assert_eq!(stats.newest_capture.unwrap().timestamp_millis(), 2_000);
        assert_eq!(stats.db_size_bytes, 0);
    }

    #[test]
    fn test_open_creates_file_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("artifacts.db");
        let artifact = create_test_artifact("org-1", 1_000);

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(&artifact).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.path(), path.as_path());
        assert_eq!(store.get(artifact.id()).unwrap().unwrap(), artifact);
        assert!(store.stats().unwrap().db_size_bytes > 0);
    }
}
