//! Content-addressed sealing.
//!
//! Two SHA-256 digests bind an artifact: one over the raw payload bytes and one
//! over the canonical JSON of its metadata. Canonical means the field order of
//! [`SealMetadata`] and `serde_json`'s shortest round-trip float formatting;
//! both are fixed, so the same inputs always produce the same digests.

use std::io::Read;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::artifact::SealedArtifact;
use crate::compliance::ComplianceFlags;
use crate::error::Result;
use crate::location::LocationSample;

/// Read buffer size for streamed payload hashing.
const CHUNK_SIZE: usize = 64 * 1024;

/// The metadata covered by the metadata digest.
///
/// Field order here is the serialization order. Do not reorder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SealMetadata<'a> {
    started_at_ms: i64,
    ended_at_ms: i64,
    location_timeline: &'a [LocationSample],
    compliance_flags: ComplianceFlags,
}

impl<'a> SealMetadata<'a> {
    /// Gather the sealed metadata fields.
    #[must_use]
    pub fn new(
        started_at_ms: i64,
        ended_at_ms: i64,
        location_timeline: &'a [LocationSample],
        compliance_flags: ComplianceFlags,
    ) -> Self {
        Self {
            started_at_ms,
            ended_at_ms,
            location_timeline,
            compliance_flags,
        }
    }

    /// Canonical serialization.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (non-finite coordinates serialize
    /// as `null`, so in practice it does not).
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A pair of digests, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Seal {
    /// SHA-256 of the payload.
    pub media_digest: String,
    /// SHA-256 of the canonical metadata.
    pub metadata_digest: String,
}

/// Result of recomputing an artifact's digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verification {
    /// The payload digest matches.
    pub media_ok: bool,
    /// The metadata digest matches.
    pub metadata_ok: bool,
}

impl Verification {
    /// Both digests match.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.media_ok && self.metadata_ok
    }
}

/// Computes and checks seals. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sealer;

impl Sealer {
    /// Seal an in-memory payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be serialized.
    pub fn seal(&self, media: &[u8], metadata: &SealMetadata<'_>) -> Result<Seal> {
        Ok(Seal {
            media_digest: self.digest_bytes(media),
            metadata_digest: self.digest_bytes(&metadata.canonical_bytes()?),
        })
    }

    /// Seal a payload read from `reader`.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the metadata cannot be serialized.
    pub fn seal_reader<R: Read>(&self, reader: R, metadata: &SealMetadata<'_>) -> Result<Seal> {
        Ok(Seal {
            media_digest: self.digest_reader(reader)?,
            metadata_digest: self.digest_bytes(&metadata.canonical_bytes()?),
        })
    }

    /// SHA-256 of `bytes`, lowercase hex.
    #[must_use]
    pub fn digest_bytes(&self, bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// SHA-256 of everything `reader` yields, lowercase hex.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub fn digest_reader<R: Read>(&self, mut reader: R) -> Result<String> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Recompute both digests of `artifact` and compare.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be serialized.
    pub fn verify(&self, artifact: &SealedArtifact) -> Result<Verification> {
        let seal = self.seal(&artifact.media().bytes, &artifact.seal_metadata())?;
        Ok(Verification {
            media_ok: seal.media_digest == artifact.media_digest(),
            metadata_ok: seal.metadata_digest == artifact.metadata_digest(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{MediaPayload, SessionRecord};
    use crate::session::{Party, SessionContext, TaskRef};

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn timeline() -> Vec<LocationSample> {
        vec![LocationSample::new(1.5, -2.25, 10.0, 1_200)]
    }

    #[test]
    fn test_digest_known_vectors() {
        assert_eq!(Sealer.digest_bytes(b""), EMPTY_SHA256);
        assert_eq!(Sealer.digest_bytes(b"abc"), ABC_SHA256);
    }

    #[test]
    fn test_streamed_digest_matches_in_memory() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let streamed = Sealer.digest_reader(payload.as_slice()).unwrap();
        assert_eq!(streamed, Sealer.digest_bytes(&payload));
    }

    #[test]
    fn test_canonical_metadata_layout() {
        let samples = timeline();
        let metadata = SealMetadata::new(1_000, 6_000, &samples, ComplianceFlags::default());
        let json = String::from_utf8(metadata.canonical_bytes().unwrap()).unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"started_at_ms":1000,"ended_at_ms":6000,"#,
                r#""location_timeline":[{"latitude":1.5,"longitude":-2.25,"accuracy_m":10.0,"captured_at_ms":1200}],"#,
                r#""compliance_flags":{"location_lost":false,"accuracy_exceeded":false,"visibility_changed":false,"backgrounded":false}}"#
            )
        );
    }

    #[test]
    fn test_seal_is_deterministic() {
        let samples = timeline();
        let metadata = SealMetadata::new(1_000, 6_000, &samples, ComplianceFlags::default());
        let first = Sealer.seal(b"payload", &metadata).unwrap();
        let second = Sealer.seal(b"payload", &metadata).unwrap();
        assert_eq!(first, second);

        let streamed = Sealer.seal_reader(&b"payload"[..], &metadata).unwrap();
        assert_eq!(first, streamed);
    }

    #[test]
    fn test_metadata_digest_sensitive_to_flags() {
        let samples = timeline();
        let clean = SealMetadata::new(1_000, 6_000, &samples, ComplianceFlags::default());
        let flagged = SealMetadata::new(
            1_000,
            6_000,
            &samples,
            ComplianceFlags {
                backgrounded: true,
                ..ComplianceFlags::default()
            },
        );
        assert_ne!(
            Sealer.seal(b"x", &clean).unwrap().metadata_digest,
            Sealer.seal(b"x", &flagged).unwrap().metadata_digest
        );
    }

    #[test]
    fn test_verify_detects_tampering() {
        let context = SessionContext::new(
            TaskRef::new("T-1", "C-1"),
            Party::new("op-1", "Ana"),
            Party::new("org-1", "Acme"),
            0,
        );
        let mut artifact = SealedArtifact::seal(
            &context,
            SessionRecord {
                started_at_ms: 1_000,
                ended_at_ms: 2_000,
                location_timeline: timeline(),
                compliance_flags: ComplianceFlags::default(),
            },
            MediaPayload::webm(b"original".to_vec()),
            &Sealer,
        )
        .unwrap();
        assert!(Sealer.verify(&artifact).unwrap().is_intact());

        artifact.media = MediaPayload::webm(b"tampered".to_vec());
        let verification = Sealer.verify(&artifact).unwrap();
        assert!(!verification.media_ok);
        assert!(verification.metadata_ok);

        artifact.ended_at_ms += 1;
        assert!(!Sealer.verify(&artifact).unwrap().metadata_ok);
    }
}
