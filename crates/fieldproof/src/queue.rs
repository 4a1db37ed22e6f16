//! Offline queue and upload orchestration.
//!
//! Sealed artifacts are persisted first and sent later. The queue never
//! deletes on upload; a synced artifact stays local with state `uploaded`.
//! There is no background retry loop. Callers trigger [`OfflineQueue::upload_one`]
//! or [`OfflineQueue::upload_all`] when they judge connectivity to be back.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::artifact::{SealedArtifact, UploadState};
use crate::error::{Error, Result};
use crate::storage::ArtifactStore;
use crate::transport::Transport;

/// Why an upload was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another upload of the same artifact is running.
    InFlight,
    /// The remote store already has it.
    AlreadyUploaded,
}

/// Result of one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The remote store accepted the artifact.
    Uploaded,
    /// The transfer failed; the artifact is now `failed`.
    Failed(String),
    /// Nothing was sent.
    Skipped(SkipReason),
    /// The artifact was removed locally while the upload ran. Its result was
    /// not recorded.
    Removed,
}

/// Totals from [`OfflineQueue::upload_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    /// Artifacts accepted by the remote store.
    pub uploaded: usize,
    /// Artifacts whose transfer failed.
    pub failed: usize,
    /// Artifacts skipped because they were in flight, already uploaded, or
    /// removed mid-upload.
    pub skipped: usize,
    /// `(id, reason)` for every failure.
    pub errors: Vec<(String, String)>,
}

impl UploadSummary {
    /// Number of artifacts considered.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.uploaded + self.failed + self.skipped
    }
}

/// Persists sealed artifacts and sends them on demand.
pub struct OfflineQueue {
    store: Arc<dyn ArtifactStore>,
    transport: Arc<dyn Transport>,
    in_flight: Mutex<HashSet<String>>,
}

impl fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("transport", &self.transport.name())
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

/// Holds an id in the in-flight set until dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl OfflineQueue {
    /// Create a queue over `store`, sending through `transport`.
    #[must_use]
    pub fn new(store: Arc<dyn ArtifactStore>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Persist `artifact` as `pending`. Re-enqueueing an id overwrites it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn enqueue(&self, mut artifact: SealedArtifact) -> Result<SealedArtifact> {
        artifact.upload_state = UploadState::Pending;
        let stored = artifact.clone();
        self.blocking(move |store| store.put(&stored)).await?;
        info!("Queued artifact {} for upload", artifact.id());
        Ok(artifact)
    }

    /// Every local artifact, newest first. Empty if the store is unavailable.
    pub async fn list(&self) -> Vec<SealedArtifact> {
        match self.blocking(|store| store.get_all()).await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!("Artifact store unavailable, listing nothing: {}", e);
                Vec::new()
            }
        }
    }

    /// Local artifacts belonging to one organization.
    pub async fn list_for_organization(&self, organization_id: &str) -> Vec<SealedArtifact> {
        self.list()
            .await
            .into_iter()
            .filter(|artifact| artifact.organization_id() == organization_id)
            .collect()
    }

    /// Number of artifacts not yet uploaded.
    pub async fn pending_count(&self) -> usize {
        self.list()
            .await
            .iter()
            .filter(|artifact| artifact.upload_state() != UploadState::Uploaded)
            .count()
    }

    /// Look up one artifact. `None` if missing or the store is unavailable.
    pub async fn get(&self, id: &str) -> Option<SealedArtifact> {
        match self.load(id).await {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!("Artifact store unavailable, cannot read {}: {}", id, e);
                None
            }
        }
    }

    /// Whether an upload of `id` is running in this process.
    #[must_use]
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn claim(&self, id: &str) -> Option<InFlightGuard<'_>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        inserted.then(|| InFlightGuard {
            set: &self.in_flight,
            id: id.to_string(),
        })
    }

    /// Send one artifact.
    ///
    /// A transfer failure is not an error: it is persisted as `failed` and
    /// reported as [`UploadOutcome::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArtifactNotFound`] if no such artifact exists, or a
    /// storage error if a state change cannot be persisted.
    ///
    /// State changes only update a record that still exists, so a
    /// concurrent [`OfflineQueue::remove`] is never undone.
    pub async fn upload_one(&self, id: &str) -> Result<UploadOutcome> {
        let Some(_guard) = self.claim(id) else {
            debug!("Upload of {} already in flight, skipping", id);
            return Ok(UploadOutcome::Skipped(SkipReason::InFlight));
        };

        let mut artifact = self
            .load(id)
            .await?
            .ok_or_else(|| Error::ArtifactNotFound { id: id.to_string() })?;

        match artifact.upload_state() {
            UploadState::Uploaded => {
                debug!("Artifact {} already uploaded, skipping", id);
                return Ok(UploadOutcome::Skipped(SkipReason::AlreadyUploaded));
            }
            UploadState::Uploading => {
                // Not in our in-flight set, so the process that marked it died.
                warn!("Artifact {} was left uploading, retrying", id);
                artifact.upload_state = UploadState::Failed;
            }
            UploadState::Pending | UploadState::Failed => {}
        }

        artifact.transition(UploadState::Uploading)?;
        if !self.mark(&artifact).await? {
            info!("Artifact {} was removed before its upload began", id);
            return Ok(UploadOutcome::Removed);
        }

        info!(
            "Uploading artifact {} via {} ({} bytes)",
            id,
            self.transport.name(),
            artifact.media().len()
        );
        let sent = self
            .transport
            .send(artifact.media(), &artifact.manifest())
            .await;

        match sent {
            Ok(()) => {
                artifact.transition(UploadState::Uploaded)?;
                if !self.mark(&artifact).await? {
                    warn!("Artifact {} was removed during its upload", id);
                    return Ok(UploadOutcome::Removed);
                }
                info!("Artifact {} uploaded", id);
                Ok(UploadOutcome::Uploaded)
            }
            Err(e) => {
                artifact.transition(UploadState::Failed)?;
                if !self.mark(&artifact).await? {
                    warn!("Artifact {} was removed during its upload: {}", id, e);
                    return Ok(UploadOutcome::Removed);
                }
                warn!("Upload of artifact {} failed: {}", id, e);
                Ok(UploadOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Send every artifact not yet uploaded, concurrently.
    ///
    /// Each artifact's outcome is persisted as it completes; nothing is rolled
    /// back if others fail.
    pub async fn upload_all(self: &Arc<Self>) -> UploadSummary {
        let ids: Vec<String> = self
            .list()
            .await
            .into_iter()
            .filter(|artifact| artifact.upload_state() != UploadState::Uploaded)
            .map(|artifact| artifact.id().to_string())
            .collect();

        info!("Uploading {} queued artifact(s)", ids.len());

        let mut tasks = JoinSet::new();
        for id in ids {
            let queue = Arc::clone(self);
            tasks.spawn(async move {
                let outcome = queue.upload_one(&id).await;
                (id, outcome)
            });
        }

        let mut summary = UploadSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(UploadOutcome::Uploaded))) => summary.uploaded += 1,
                Ok((_, Ok(UploadOutcome::Skipped(_) | UploadOutcome::Removed))) => {
                    summary.skipped += 1;
                }
                Ok((id, Ok(UploadOutcome::Failed(reason)))) => {
                    summary.failed += 1;
                    summary.errors.push((id, reason));
                }
                Ok((id, Err(e))) => {
                    summary.failed += 1;
                    summary.errors.push((id, e.to_string()));
                }
                Err(e) => {
                    warn!("Upload task panicked: {}", e);
                    summary.failed += 1;
                    summary.errors.push((String::new(), e.to_string()));
                }
            }
        }

        info!(
            "Upload pass finished: {} uploaded, {} failed, {} skipped",
            summary.uploaded, summary.failed, summary.skipped
        );
        summary
    }

    /// Permanently delete an artifact, whatever its state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |store| store.delete(&id)).await
    }

    /// Move artifacts left `uploading` by an interrupted process to `failed`.
    ///
    /// Returns how many were recovered.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let stale: Vec<SealedArtifact> = self
            .blocking(|store| store.get_all())
            .await?
            .into_iter()
            .filter(|artifact| {
                artifact.upload_state() == UploadState::Uploading
                    && !self.is_in_flight(artifact.id())
            })
            .collect();

        let mut count = 0;
        for mut artifact in stale {
            artifact.transition(UploadState::Failed)?;
            if self.mark(&artifact).await? {
                count += 1;
            }
        }
        if count > 0 {
            info!("Recovered {} interrupted upload(s)", count);
        }
        Ok(count)
    }

    async fn load(&self, id: &str) -> Result<Option<SealedArtifact>> {
        let id = id.to_string();
        self.blocking(move |store| store.get(&id)).await
    }

    /// Write `artifact`'s upload state. `false` if the record is gone.
    async fn mark(&self, artifact: &SealedArtifact) -> Result<bool> {
        let id = artifact.id().to_string();
        let state = artifact.upload_state();
        self.blocking(move |store| store.set_upload_state(&id, state)).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ArtifactStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| Error::StoreUnavailable(format!("store task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactManifest, MediaPayload, SessionRecord};
    use crate::compliance::ComplianceFlags;
    use crate::seal::Sealer;
    use crate::session::{Party, SessionContext, TaskRef};
    use crate::storage::SqliteStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTransport {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Transport for CountingTransport {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn send(&self, _payload: &MediaPayload, _manifest: &ArtifactManifest) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::transport("offline"))
            } else {
                Ok(())
            }
        }
    }

    fn artifact(org: &str) -> SealedArtifact {
        let context = SessionContext::new(
            TaskRef::new("T-1", "C-1"),
            Party::new("op-1", "Ana"),
            Party::new(org, "Org"),
            0,
        );
        SealedArtifact::seal(
            &context,
            SessionRecord {
                started_at_ms: 0,
                ended_at_ms: 1_000,
                location_timeline: Vec::new(),
                compliance_flags: ComplianceFlags::default(),
            },
            MediaPayload::webm(vec![1u8, 2, 3]),
            &Sealer,
        )
        .unwrap()
    }

    fn queue(fail: bool) -> (OfflineQueue, Arc<CountingTransport>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            fail,
        });
        (OfflineQueue::new(store, transport.clone()), transport)
    }

    #[tokio::test]
    async fn test_enqueue_sets_pending() {
        let (queue, _) = queue(false);
        let mut a = artifact("org-1");
        a.upload_state = UploadState::Failed;

        let stored = queue.enqueue(a).await.unwrap();
        assert_eq!(stored.upload_state(), UploadState::Pending);
        assert_eq!(
            queue.get(stored.id()).await.unwrap().upload_state(),
            UploadState::Pending
        );
    }

    #[tokio::test]
    async fn test_upload_one_success_keeps_local_copy() {
        let (queue, transport) = queue(false);
        let a = queue.enqueue(artifact("org-1")).await.unwrap();

        assert_eq!(
            queue.upload_one(a.id()).await.unwrap(),
            UploadOutcome::Uploaded
        );
        let stored = queue.get(a.id()).await.unwrap();
        assert_eq!(stored.upload_state(), UploadState::Uploaded);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(!queue.is_in_flight(a.id()));
    }

    #[tokio::test]
    async fn test_upload_one_failure_persists_failed() {
        let (queue, _) = queue(true);
        let a = queue.enqueue(artifact("org-1")).await.unwrap();

        let outcome = queue.upload_one(a.id()).await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Failed(ref reason) if reason.contains("offline")));
        assert_eq!(
            queue.get(a.id()).await.unwrap().upload_state(),
            UploadState::Failed
        );
        assert_eq!(queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_upload_one_missing() {
        let (queue, _) = queue(false);
        let err = queue.upload_one("nope").await.unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound { .. }));
        assert!(!queue.is_in_flight("nope"));
    }

    #[tokio::test]
    async fn test_uploaded_is_skipped() {
        let (queue, transport) = queue(false);
        let a = queue.enqueue(artifact("org-1")).await.unwrap();
        queue.upload_one(a.id()).await.unwrap();

        assert_eq!(
            queue.upload_one(a.id()).await.unwrap(),
            UploadOutcome::Skipped(SkipReason::AlreadyUploaded)
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_in_flight_claim_is_exclusive() {
        let (queue, _) = queue(false);
        let guard = queue.claim("a").unwrap();
        assert!(queue.claim("a").is_none());
        assert_eq!(
            queue.upload_one("a").await.unwrap(),
            UploadOutcome::Skipped(SkipReason::InFlight)
        );
        drop(guard);
        assert!(!queue.is_in_flight("a"));
    }

    #[tokio::test]
    async fn test_list_for_organization() {
        let (queue, _) = queue(false);
        queue.enqueue(artifact("org-1")).await.unwrap();
        queue.enqueue(artifact("org-2")).await.unwrap();
        queue.enqueue(artifact("org-1")).await.unwrap();

        assert_eq!(queue.list().await.len(), 3);
        assert_eq!(queue.list_for_organization("org-1").await.len(), 2);
        assert!(queue.list_for_organization("org-3").await.is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let (queue, _) = queue(false);
        let a = queue.enqueue(artifact("org-1")).await.unwrap();
        assert!(queue.remove(a.id()).await.unwrap());
        assert!(queue.get(a.id()).await.is_none());
        assert!(!queue.remove(a.id()).await.unwrap());
    }

    #[test]
    fn test_summary_attempted() {
        let summary = UploadSummary {
            uploaded: 3,
            failed: 1,
            skipped: 2,
            errors: Vec::new(),
        };
        assert_eq!(summary.attempted(), 6);
    }
}
