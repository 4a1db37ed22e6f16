//! Location tracking for capture sessions.
//!
//! A [`PositionSource`] is the positioning boundary (GPS or whatever the host
//! platform offers). [`LocationTracker::start`] turns a continuous watch on that
//! source into `on_sample` / `on_loss` callbacks and returns a
//! [`TrackerHandle`] that releases the subscription when stopped or dropped.
//!
//! Two shared containers hang off the tracker:
//!
//! - [`LatestLocation`]: a most-recent-wins slot the render loop reads every
//!   frame without blocking.
//! - [`LocationTimeline`]: the append-only, arrival-ordered list of every fix
//!   received during the session.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Result;

/// A single position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Latitude in degrees (positive = north).
    pub latitude: f64,
    /// Longitude in degrees (positive = east).
    pub longitude: f64,
    /// Radius of the 68% confidence circle, in meters.
    pub accuracy_m: f64,
    /// When the sensor produced the fix, epoch milliseconds.
    pub captured_at_ms: i64,
}

impl LocationSample {
    /// Create a new sample.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, accuracy_m: f64, captured_at_ms: i64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m,
            captured_at_ms,
        }
    }

    /// Whether this fix is worse than `threshold_m`.
    #[must_use]
    pub fn exceeds(&self, threshold_m: f64) -> bool {
        self.accuracy_m > threshold_m
    }

    /// Overlay text: `lat, lng (±accuracy m)`.
    #[must_use]
    pub fn overlay_label(&self) -> String {
        format!(
            "{:.6}, {:.6} (±{:.1} m)",
            self.latitude, self.longitude, self.accuracy_m
        )
    }
}

/// An event delivered by a position watch.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    /// A new fix.
    Fix(LocationSample),
    /// No fix available, or the sensor reported an error.
    Lost(String),
}

/// Options for a position request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionOptions {
    /// Ask for the most accurate fix the hardware can provide.
    pub high_accuracy: bool,
    /// Give up on a fix after this long.
    pub timeout: Option<Duration>,
    /// Accept cached fixes up to this age.
    pub maximum_age: Duration,
}

impl PositionOptions {
    /// Continuous high-accuracy updates with no caching.
    #[must_use]
    pub fn continuous() -> Self {
        Self {
            high_accuracy: true,
            timeout: None,
            maximum_age: Duration::ZERO,
        }
    }

    /// A single fresh high-accuracy fix.
    #[must_use]
    pub fn one_shot(timeout: Duration) -> Self {
        Self {
            high_accuracy: true,
            timeout: Some(timeout),
            maximum_age: Duration::ZERO,
        }
    }
}

/// Identifier of an active watch on a [`PositionSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// The positioning boundary.
#[async_trait::async_trait]
pub trait PositionSource: Send + Sync {
    /// The name of this source (for logging).
    fn name(&self) -> &'static str;

    /// Begin continuous updates, delivered through `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the sensor is denied or unavailable.
    fn watch(
        &self,
        options: PositionOptions,
        events: mpsc::UnboundedSender<PositionEvent>,
    ) -> Result<WatchId>;

    /// End a watch started with [`PositionSource::watch`].
    fn clear_watch(&self, id: WatchId);

    /// Request a single fix.
    ///
    /// # Errors
    ///
    /// Returns an error if no fix could be obtained.
    async fn current_position(&self, options: PositionOptions) -> Result<LocationSample>;
}

/// Starts continuous location tracking.
#[derive(Debug, Clone, Copy)]
pub struct LocationTracker;

impl LocationTracker {
    /// Subscribe to `source` and forward events to the callbacks.
    ///
    /// Must be called from within a tokio runtime. The returned handle holds
    /// the subscription; dropping it releases the sensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the source refuses the watch.
    pub fn start<S, L>(
        source: Arc<dyn PositionSource>,
        mut on_sample: S,
        mut on_loss: L,
    ) -> Result<TrackerHandle>
    where
        S: FnMut(LocationSample) + Send + 'static,
        L: FnMut(&str) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watch_id = source.watch(PositionOptions::continuous(), tx)?;
        debug!("Started location watch {:?} on {}", watch_id, source.name());

        let mut dispatch = move |event: PositionEvent| match event {
            PositionEvent::Fix(sample) => {
                trace!(
                    "Location fix ±{:.1}m at {}",
                    sample.accuracy_m,
                    sample.captured_at_ms
                );
                on_sample(sample);
            }
            PositionEvent::Lost(reason) => {
                warn!("Location signal lost: {}", reason);
                on_loss(&reason);
            }
        };

        let shutdown = CancellationToken::new();
        let draining = shutdown.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Some(event) => dispatch(event),
                        None => break,
                    },
                    () = draining.cancelled() => {
                        // No new events; deliver what is already buffered.
                        rx.close();
                        while let Some(event) = rx.recv().await {
                            dispatch(event);
                        }
                        break;
                    }
                }
            }
        });

        Ok(TrackerHandle {
            source,
            watch_id: Some(watch_id),
            shutdown,
            forwarder: Some(forwarder),
        })
    }
}

/// A live location subscription.
///
/// Released exactly once, by [`TrackerHandle::shutdown`],
/// [`TrackerHandle::stop`] or on drop.
pub struct TrackerHandle {
    source: Arc<dyn PositionSource>,
    watch_id: Option<WatchId>,
    shutdown: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TrackerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerHandle")
            .field("source", &self.source.name())
            .field("watch_id", &self.watch_id)
            .finish_non_exhaustive()
    }
}

impl TrackerHandle {
    /// Whether the subscription is still held.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.watch_id.is_some()
    }

    /// Release the subscription and wait until every event the source had
    /// already delivered has reached the callbacks.
    pub async fn shutdown(mut self) {
        self.clear_watch();
        self.shutdown.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.await {
                warn!("Location forwarder ended abnormally: {}", e);
            }
        }
    }

    /// Release the subscription immediately. Buffered events are discarded.
    pub fn stop(mut self) {
        self.release();
    }

    fn clear_watch(&mut self) {
        if let Some(id) = self.watch_id.take() {
            self.source.clear_watch(id);
            debug!("Cleared location watch {:?} on {}", id, self.source.name());
        }
    }

    fn release(&mut self) {
        self.clear_watch();
        self.shutdown.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    sample: LocationSample,
    received_at: Instant,
}

/// Most-recent-wins location cell.
///
/// One writer (the tracker callbacks), any number of readers. Reads take a
/// snapshot and never wait on the sensor.
#[derive(Debug, Clone)]
pub struct LatestLocation {
    slot: Arc<watch::Sender<Option<Slot>>>,
}

impl Default for LatestLocation {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestLocation {
    /// Create an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: Arc::new(watch::Sender::new(None)),
        }
    }

    /// Replace the current value.
    pub fn publish(&self, sample: LocationSample) {
        self.slot.send_replace(Some(Slot {
            sample,
            received_at: Instant::now(),
        }));
    }

    /// Mark the signal as lost.
    pub fn clear(&self) {
        self.slot.send_replace(None);
    }

    /// The latest fix, unless the signal was lost or the fix is older than
    /// `stale_after`.
    #[must_use]
    pub fn current(&self, stale_after: Option<Duration>) -> Option<LocationSample> {
        let slot = (*self.slot.borrow())?;
        match stale_after {
            Some(limit) if slot.received_at.elapsed() > limit => None,
            _ => Some(slot.sample),
        }
    }
}

/// Append-only, arrival-ordered record of every fix in a session.
#[derive(Debug, Clone, Default)]
pub struct LocationTimeline {
    samples: Arc<Mutex<Vec<LocationSample>>>,
}

impl LocationTimeline {
    /// Create an empty timeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fix.
    pub fn push(&self, sample: LocationSample) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample);
    }

    /// Number of fixes recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no fix has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the timeline as it stands.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LocationSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop every fix. Only used when a fresh session begins.
    pub(crate) fn reset(&self) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
