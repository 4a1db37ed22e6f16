//! Compliance flag aggregation.
//!
//! The monitor owns no tasks. Location callbacks and the host's visibility
//! callback write into it; the session reads it once, on finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, trace};

use crate::location::LocationSample;

/// Integrity violations observed during a session.
///
/// Every field is monotonic for the life of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComplianceFlags {
    /// The location sensor reported loss or an error.
    pub location_lost: bool,
    /// At least one fix was worse than the accuracy threshold.
    pub accuracy_exceeded: bool,
    /// The application lost foreground focus.
    pub visibility_changed: bool,
    /// The application was sent to the background.
    pub backgrounded: bool,
}

impl ComplianceFlags {
    /// Whether any violation was recorded.
    #[must_use]
    pub fn any(&self) -> bool {
        self.location_lost || self.accuracy_exceeded || self.visibility_changed || self.backgrounded
    }

    /// Names of the recorded violations.
    #[must_use]
    pub fn violations(&self) -> Vec<&'static str> {
        [
            (self.location_lost, "location_lost"),
            (self.accuracy_exceeded, "accuracy_exceeded"),
            (self.visibility_changed, "visibility_changed"),
            (self.backgrounded, "backgrounded"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect()
    }
}

#[derive(Debug, Default)]
struct Flags {
    armed: AtomicBool,
    consumed: AtomicBool,
    location_lost: AtomicBool,
    accuracy_exceeded: AtomicBool,
    visibility_changed: AtomicBool,
    backgrounded: AtomicBool,
}

/// Aggregates sensor and environment signals into [`ComplianceFlags`].
///
/// Cheap to clone; clones share state. Signals are only recorded while armed.
#[derive(Debug, Clone, Default)]
pub struct ComplianceMonitor {
    flags: Arc<Flags>,
    accuracy_threshold_m: f64,
}

impl ComplianceMonitor {
    /// Create a disarmed monitor with the given accuracy threshold.
    #[must_use]
    pub fn new(accuracy_threshold_m: f64) -> Self {
        Self {
            flags: Arc::default(),
            accuracy_threshold_m,
        }
    }

    /// Clear all flags and start observing. Called when a session begins preparing.
    pub fn arm(&self) {
        let flags = &self.flags;
        flags.location_lost.store(false, Ordering::SeqCst);
        flags.accuracy_exceeded.store(false, Ordering::SeqCst);
        flags.visibility_changed.store(false, Ordering::SeqCst);
        flags.backgrounded.store(false, Ordering::SeqCst);
        flags.consumed.store(false, Ordering::SeqCst);
        flags.armed.store(true, Ordering::SeqCst);
    }

    /// Stop observing without consuming the flags.
    pub fn disarm(&self) {
        self.flags.armed.store(false, Ordering::SeqCst);
    }

    /// Whether signals are currently being recorded.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.flags.armed.load(Ordering::SeqCst)
    }

    /// Record a fix, raising `accuracy_exceeded` if it is too coarse.
    pub fn record_fix(&self, sample: &LocationSample) {
        if sample.exceeds(self.accuracy_threshold_m) {
            self.raise(&self.flags.accuracy_exceeded, "accuracy_exceeded");
        }
    }

    /// Record a loss of location signal.
    pub fn record_location_lost(&self) {
        self.raise(&self.flags.location_lost, "location_lost");
    }

    /// Record that the host lost foreground focus.
    pub fn record_hidden(&self) {
        if self.raise(&self.flags.visibility_changed, "visibility_changed") {
            self.raise(&self.flags.backgrounded, "backgrounded");
        }
    }

    /// Current flags without consuming them.
    #[must_use]
    pub fn snapshot(&self) -> ComplianceFlags {
        let flags = &self.flags;
        ComplianceFlags {
            location_lost: flags.location_lost.load(Ordering::SeqCst),
            accuracy_exceeded: flags.accuracy_exceeded.load(Ordering::SeqCst),
            visibility_changed: flags.visibility_changed.load(Ordering::SeqCst),
            backgrounded: flags.backgrounded.load(Ordering::SeqCst),
        }
    }

    /// Disarm and hand over the flags. Returns `None` if already consumed.
    #[must_use]
    pub fn finish(&self) -> Option<ComplianceFlags> {
        self.disarm();
        if self.flags.consumed.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(self.snapshot())
        }
    }

    /// Returns true if the monitor was armed and the signal was accepted.
    fn raise(&self, flag: &AtomicBool, name: &'static str) -> bool {
        if !self.is_armed() {
            trace!("Ignoring {} signal while disarmed", name);
            return false;
        }
        if !flag.swap(true, Ordering::SeqCst) {
            info!("Compliance flag raised: {}", name);
        }
        true
    }
}
