//! `fieldproof` - Tamper-evident, location-stamped field capture
//!
//! This library drives a capture session (camera, microphone and location
//! feeding a composited, watermarked video stream), seals the finished
//! recording with SHA-256 digests, and keeps sealed artifacts in a durable
//! offline queue until they are uploaded.
//!
//! Hardware and the remote store sit behind traits ([`devices::MediaDevices`],
//! [`devices::EncoderFactory`], [`location::PositionSource`],
//! [`transport::Transport`]) supplied by the host.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod artifact;
pub mod cli;
pub mod compliance;
pub mod compositor;
pub mod config;
pub mod devices;
pub mod error;
pub mod location;
pub mod logging;
pub mod preflight;
pub mod queue;
pub mod seal;
pub mod session;
pub mod storage;
pub mod transport;

pub use artifact::{ArtifactManifest, MediaPayload, SealedArtifact, UploadState};
pub use compliance::ComplianceFlags;
pub use config::Config;
pub use error::{Error, Result};
pub use location::LocationSample;
pub use logging::init_logging;
pub use queue::{OfflineQueue, UploadOutcome, UploadSummary};
pub use seal::{Sealer, Verification};
pub use session::{Recorder, RecorderDeps, SessionContext, SessionState};
pub use storage::{ArtifactStore, SqliteStore, StoreStats};
pub use transport::{HttpTransport, Transport};
