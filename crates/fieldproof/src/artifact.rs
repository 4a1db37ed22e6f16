//! Sealed artifacts.
//!
//! A [`SealedArtifact`] is created exactly once, when a session finishes.
//! Everything except its [`UploadState`] is immutable from then on.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::compliance::ComplianceFlags;
use crate::error::{Error, Result};
use crate::location::LocationSample;
use crate::seal::{SealMetadata, Sealer};
use crate::session::SessionContext;

/// Container type produced by the encoder unless it says otherwise.
pub const DEFAULT_MIME_TYPE: &str = "video/webm";

/// Sync state of a local artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Waiting to be sent.
    #[default]
    Pending,
    /// A transfer is in progress.
    Uploading,
    /// The remote store accepted it. Terminal.
    Uploaded,
    /// The last transfer failed. Retryable.
    Failed,
}

impl UploadState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Pending, Self::Uploading, Self::Uploaded, Self::Failed];

    /// Whether moving to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::Failed, Self::Uploading)
                | (Self::Uploading, Self::Uploaded | Self::Failed)
        )
    }

    /// Lowercase name, as stored.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for UploadState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::internal(format!("unknown upload state: {s}")))
    }
}

/// The finalized encoder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    /// Opaque container bytes.
    pub bytes: Bytes,
    /// Container mime type.
    pub mime_type: String,
}

impl MediaPayload {
    /// Wrap encoder output with an explicit mime type.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Wrap encoder output as `video/webm`.
    #[must_use]
    pub fn webm(bytes: impl Into<Bytes>) -> Self {
        Self::new(bytes, DEFAULT_MIME_TYPE)
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// What a finished session hands to sealing.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// Latched when recording began, epoch milliseconds.
    pub started_at_ms: i64,
    /// Latched when stop was requested, epoch milliseconds.
    pub ended_at_ms: i64,
    /// Every fix, in arrival order.
    pub location_timeline: Vec<LocationSample>,
    /// Consumed compliance flags.
    pub compliance_flags: ComplianceFlags,
}

/// A sealed, location-stamped capture.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedArtifact {
    pub(crate) id: String,
    pub(crate) task_id: String,
    pub(crate) organization_id: String,
    pub(crate) operator_id: String,
    pub(crate) counterparty_id: String,
    pub(crate) started_at_ms: i64,
    pub(crate) ended_at_ms: i64,
    pub(crate) location_timeline: Vec<LocationSample>,
    pub(crate) compliance_flags: ComplianceFlags,
    pub(crate) media: MediaPayload,
    pub(crate) media_digest: String,
    pub(crate) metadata_digest: String,
    pub(crate) upload_state: UploadState,
}

impl SealedArtifact {
    /// Seal a finished session into a new artifact with a fresh id.
    ///
    /// # Errors
    ///
    /// Returns an error if `record.ended_at_ms` precedes `record.started_at_ms`
    /// or the metadata cannot be serialized.
    pub fn seal(
        context: &SessionContext,
        record: SessionRecord,
        media: MediaPayload,
        sealer: &Sealer,
    ) -> Result<Self> {
        if record.ended_at_ms < record.started_at_ms {
            return Err(Error::internal(format!(
                "session ended ({}) before it started ({})",
                record.ended_at_ms, record.started_at_ms
            )));
        }

        let seal = sealer.seal(
            &media.bytes,
            &SealMetadata::new(
                record.started_at_ms,
                record.ended_at_ms,
                &record.location_timeline,
                record.compliance_flags,
            ),
        )?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: context.task().id.clone(),
            organization_id: context.organization().id.clone(),
            operator_id: context.operator().id.clone(),
            counterparty_id: context.task().counterparty_id.clone(),
            started_at_ms: record.started_at_ms,
            ended_at_ms: record.ended_at_ms,
            location_timeline: record.location_timeline,
            compliance_flags: record.compliance_flags,
            media,
            media_digest: seal.media_digest,
            metadata_digest: seal.metadata_digest,
            upload_state: UploadState::Pending,
        })
    }

    /// Unique artifact id (UUID v4).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Task identifier.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Organization identifier.
    #[must_use]
    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    /// Operator identifier.
    #[must_use]
    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    /// Counterparty identifier.
    #[must_use]
    pub fn counterparty_id(&self) -> &str {
        &self.counterparty_id
    }

    /// Recording start, epoch milliseconds.
    #[must_use]
    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    /// Recording end, epoch milliseconds.
    #[must_use]
    pub fn ended_at_ms(&self) -> i64 {
        self.ended_at_ms
    }

    /// Recording length in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        self.ended_at_ms - self.started_at_ms
    }

    /// The first fix of the session, if any.
    #[must_use]
    pub fn first_location(&self) -> Option<&LocationSample> {
        self.location_timeline.first()
    }

    /// Every fix, in arrival order.
    #[must_use]
    pub fn location_timeline(&self) -> &[LocationSample] {
        &self.location_timeline
    }

    /// Compliance flags at session end.
    #[must_use]
    pub fn compliance_flags(&self) -> ComplianceFlags {
        self.compliance_flags
    }

    /// The media payload.
    #[must_use]
    pub fn media(&self) -> &MediaPayload {
        &self.media
    }

    /// SHA-256 of the payload, lowercase hex.
    #[must_use]
    pub fn media_digest(&self) -> &str {
        &self.media_digest
    }

    /// SHA-256 of the canonical metadata, lowercase hex.
    #[must_use]
    pub fn metadata_digest(&self) -> &str {
        &self.metadata_digest
    }

    /// Current sync state.
    #[must_use]
    pub fn upload_state(&self) -> UploadState {
        self.upload_state
    }

    /// The metadata the metadata digest covers.
    #[must_use]
    pub fn seal_metadata(&self) -> SealMetadata<'_> {
        SealMetadata::new(
            self.started_at_ms,
            self.ended_at_ms,
            &self.location_timeline,
            self.compliance_flags,
        )
    }

    /// Everything except the payload bytes.
    #[must_use]
    pub fn manifest(&self) -> ArtifactManifest {
        ArtifactManifest {
            id: self.id.clone(),
            task_id: self.task_id.clone(),
            organization_id: self.organization_id.clone(),
            operator_id: self.operator_id.clone(),
            counterparty_id: self.counterparty_id.clone(),
            started_at_ms: self.started_at_ms,
            ended_at_ms: self.ended_at_ms,
            first_location: self.first_location().copied(),
            location_timeline: self.location_timeline.clone(),
            compliance_flags: self.compliance_flags,
            mime_type: self.media.mime_type.clone(),
            media_size: self.media.len(),
            media_digest: self.media_digest.clone(),
            metadata_digest: self.metadata_digest.clone(),
            upload_state: self.upload_state,
        }
    }

    /// Move to `next`, enforcing the upload state machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUploadTransition`] if the move is not allowed.
    pub(crate) fn transition(&mut self, next: UploadState) -> Result<()> {
        if !self.upload_state.can_transition_to(next) {
            return Err(Error::InvalidUploadTransition {
                from: self.upload_state,
                to: next,
            });
        }
        self.upload_state = next;
        Ok(())
    }
}

/// The artifact without its payload, as sent alongside an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Artifact id.
    pub id: String,
    /// Task identifier.
    pub task_id: String,
    /// Organization identifier.
    pub organization_id: String,
    /// Operator identifier.
    pub operator_id: String,
    /// Counterparty identifier.
    pub counterparty_id: String,
    /// Recording start, epoch milliseconds.
    pub started_at_ms: i64,
    /// Recording end, epoch milliseconds.
    pub ended_at_ms: i64,
    /// First fix of the session.
    pub first_location: Option<LocationSample>,
    /// Every fix, in arrival order.
    pub location_timeline: Vec<LocationSample>,
    /// Compliance flags.
    pub compliance_flags: ComplianceFlags,
    /// Payload mime type.
    pub mime_type: String,
    /// Payload size in bytes.
    pub media_size: usize,
    /// Payload digest.
    pub media_digest: String,
    /// Metadata digest.
    pub metadata_digest: String,
    /// Sync state at the time the manifest was taken.
    pub upload_state: UploadState,
}
