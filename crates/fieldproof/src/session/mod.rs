//! Capture sessions.
//!
//! A [`SessionContext`] binds one capture to its task, operator and
//! organization. The [`Recorder`] drives the session state machine:
//!
//! ```text
//! Idle ──start──▶ Preparing ──first frame──▶ Recording ──stop──▶ Stopping ──▶ Finished
//!   ▲                │                          │                   │
//!   └──stop──────────┘                          └──fault────────────┴──────▶ Error
//! ```
//!
//! `Error` is terminal for the attempt; only a fresh `start()` leaves it.

mod recorder;

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use recorder::{Recorder, RecorderDeps};

/// A named party (operator or organization).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    /// Stable identifier.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl Party {
    /// Create a party.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// The task a capture is evidence for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    /// Task identifier.
    pub id: String,
    /// The task's counterparty (client) identifier.
    pub counterparty_id: String,
}

impl TaskRef {
    /// Create a task reference.
    #[must_use]
    pub fn new(id: impl Into<String>, counterparty_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            counterparty_id: counterparty_id.into(),
        }
    }
}

/// Immutable per-capture binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    task: TaskRef,
    operator: Party,
    organization: Party,
    server_time_ms: i64,
}

impl SessionContext {
    /// Bind a capture. `server_time_ms` is the server-synchronized epoch time
    /// at the moment the operator began.
    #[must_use]
    pub fn new(task: TaskRef, operator: Party, organization: Party, server_time_ms: i64) -> Self {
        Self {
            task,
            operator,
            organization,
            server_time_ms,
        }
    }

    /// The task.
    #[must_use]
    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    /// The operator.
    #[must_use]
    pub fn operator(&self) -> &Party {
        &self.operator
    }

    /// The organization.
    #[must_use]
    pub fn organization(&self) -> &Party {
        &self.organization
    }

    /// Server-synchronized epoch milliseconds at context creation.
    #[must_use]
    pub fn server_time_ms(&self) -> i64 {
        self.server_time_ms
    }
}

/// Monotonic clock anchored to the server-synchronized epoch.
#[derive(Debug, Clone, Copy)]
pub struct SessionClock {
    server_time_ms: i64,
    anchor: Instant,
}

impl SessionClock {
    /// Anchor `server_time_ms` to now.
    #[must_use]
    pub fn synchronized(server_time_ms: i64) -> Self {
        Self {
            server_time_ms,
            anchor: Instant::now(),
        }
    }

    /// Current epoch milliseconds.
    #[must_use]
    pub fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.server_time_ms.saturating_add(elapsed)
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Nothing acquired.
    #[default]
    Idle,
    /// Acquiring devices and waiting for the first frame.
    Preparing,
    /// Encoding.
    Recording,
    /// Waiting for the encoder to finalize.
    Stopping,
    /// Sealed artifact available.
    Finished,
    /// The attempt failed; no artifact.
    Error,
}

impl SessionState {
    /// Whether devices are held and compliance observers are active.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Preparing | Self::Recording)
    }

    /// Whether the attempt is over.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Recording => "recording",
            Self::Stopping => "stopping",
            Self::Finished => "finished",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}
