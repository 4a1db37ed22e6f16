//! Error types for fieldproof.
//!
//! This module defines all error types used throughout the fieldproof crate,
//! providing detailed context for debugging and operator-facing messages.

use std::path::PathBuf;
use thiserror::Error;

use crate::artifact::UploadState;
use crate::session::SessionState;

/// The main error type for fieldproof operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// The artifact store could not be reached.
    #[error("artifact store unavailable: {0}")]
    StoreUnavailable(String),

    /// No artifact exists with the given id.
    #[error("artifact not found: {id}")]
    ArtifactNotFound {
        /// The id that was looked up.
        id: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Capture Errors ===
    /// A capture device or sensor could not be acquired.
    #[error("cannot acquire {device}: {message}")]
    DeviceAcquisition {
        /// Which device failed (camera, microphone, location).
        device: &'static str,
        /// Description of what went wrong.
        message: String,
    },

    /// A device failed after it had been acquired.
    #[error("device fault on {device}: {message}")]
    DeviceFault {
        /// Which device failed.
        device: &'static str,
        /// Description of what went wrong.
        message: String,
    },

    /// The encoder could not be created or started.
    #[error("encoder error: {0}")]
    Encoder(String),

    /// The encoder failed to flush and finalize its payload.
    #[error("encoder failed to finalize: {0}")]
    EncoderFinalize(String),

    /// The requested action is not valid in the session's current state.
    #[error("cannot {action} while session is {state}")]
    InvalidTransition {
        /// The state the session was in.
        state: SessionState,
        /// The action that was attempted.
        action: &'static str,
    },

    /// The upload state machine rejected a transition.
    #[error("upload state cannot move from {from} to {to}")]
    InvalidUploadTransition {
        /// Current upload state.
        from: UploadState,
        /// Requested upload state.
        to: UploadState,
    },

    /// The session was stopped before recording began.
    #[error("session cancelled before recording started")]
    Cancelled,

    // === Transport Errors ===
    /// The remote store rejected or failed to receive an artifact.
    #[error("transport error: {0}")]
    Transport(String),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for fieldproof operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a new transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new encoder error.
    #[must_use]
    pub fn encoder(message: impl Into<String>) -> Self {
        Self::Encoder(message.into())
    }

    /// Create a device acquisition error.
    #[must_use]
    pub fn acquisition(device: &'static str, message: impl Into<String>) -> Self {
        Self::DeviceAcquisition {
            device,
            message: message.into(),
        }
    }

    /// Check if this error means a device or sensor was denied or missing.
    #[must_use]
    pub fn is_acquisition_error(&self) -> bool {
        matches!(self, Self::DeviceAcquisition { .. })
    }

    /// Check if this error is the result of a cancelled preparation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
