//! The capture session state machine.
//!
//! A [`Recorder`] owns one session. Its state lives in a `watch` channel so
//! every task (render loop, duration timer, host callbacks) reads the same
//! cell. Resources acquired while preparing are held in a scope guard that
//! releases them on every exit path.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{SessionClock, SessionContext, SessionState};
use crate::artifact::{SealedArtifact, SessionRecord};
use crate::compliance::{ComplianceFlags, ComplianceMonitor};
use crate::compositor::{ComposedFrame, Compositor, FrameInput};
use crate::config::Config;
use crate::devices::{Encoder, EncoderFactory, MediaConstraints, MediaDevices, MediaSource, OutputStream};
use crate::error::{Error, Result};
use crate::location::{LatestLocation, LocationSample, LocationTimeline, LocationTracker, PositionSource, TrackerHandle};
use crate::seal::Sealer;

/// The host-provided boundaries a session drives.
#[derive(Clone)]
pub struct RecorderDeps {
    /// Camera and microphone.
    pub devices: Arc<dyn MediaDevices>,
    /// Encoder construction.
    pub encoders: Arc<dyn EncoderFactory>,
    /// Location sensor.
    pub positioning: Arc<dyn PositionSource>,
}

impl fmt::Debug for RecorderDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecorderDeps")
            .field("devices", &self.devices.name())
            .field("positioning", &self.positioning.name())
            .finish_non_exhaustive()
    }
}

/// Everything a session holds while devices are live.
///
/// Dropping it releases whatever is still held.
#[derive(Default)]
struct Resources {
    media: Option<Arc<dyn MediaSource>>,
    tracker: Option<TrackerHandle>,
    render: Option<(CancellationToken, JoinHandle<()>)>,
    timer: Option<JoinHandle<()>>,
}

impl Resources {
    /// Stop the timer and render loop, waiting for the render loop to exit so
    /// the encoder's frame feed is closed. Then end the location watch once
    /// every fix already reported has reached the timeline.
    async fn quiesce(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some((cancel, handle)) = self.render.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Render loop ended abnormally: {}", e);
                }
            }
        }
        if let Some(tracker) = self.tracker.take() {
            tracker.shutdown().await;
        }
    }

    /// Release every held resource. Each step runs regardless of the others.
    fn release(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if let Some((cancel, handle)) = self.render.take() {
            cancel.cancel();
            handle.abort();
        }
        if let Some(tracker) = self.tracker.take() {
            tracker.stop();
        }
        if let Some(media) = self.media.take() {
            match media.release() {
                Ok(()) => debug!("Released capture devices"),
                Err(e) => warn!("Failed to release capture devices: {}", e),
            }
        }
    }
}

impl Drop for Resources {
    fn drop(&mut self) {
        self.release();
    }
}

struct ActiveCapture {
    resources: Resources,
    encoder: Box<dyn Encoder>,
    started_at_ms: i64,
}

enum Phase {
    Idle,
    Preparing { cancel: CancellationToken },
    Recording(Box<ActiveCapture>),
    Stopping,
}

struct Shared {
    context: SessionContext,
    config: Config,
    deps: RecorderDeps,
    clock: SessionClock,
    compositor: Compositor,
    sealer: Sealer,
    state: watch::Sender<SessionState>,
    preview: watch::Sender<Option<Arc<ComposedFrame>>>,
    compliance: ComplianceMonitor,
    timeline: LocationTimeline,
    latest: LatestLocation,
    elapsed_secs: AtomicU32,
    auto_stops: AtomicU32,
    phase: Mutex<Phase>,
    outcome: Mutex<Option<SealedArtifact>>,
    fault: Mutex<Option<Error>>,
    last_error: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("Session {} -> {}", prev, next);
        }
    }

    fn enter_error(&self, err: &Error) {
        *lock(&self.last_error) = Some(err.to_string());
        self.set_state(SessionState::Error);
    }

    fn reset(&self) {
        self.timeline.reset();
        self.latest.clear();
        self.elapsed_secs.store(0, Ordering::SeqCst);
        self.auto_stops.store(0, Ordering::SeqCst);
        self.preview.send_replace(None);
        *lock(&self.outcome) = None;
        *lock(&self.fault) = None;
        *lock(&self.last_error) = None;
    }
}

/// Drives one capture session.
///
/// Cheap to clone; clones control the same session.
#[derive(Clone)]
pub struct Recorder {
    shared: Arc<Shared>,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("task", &self.shared.context.task().id)
            .field("state", &self.state())
            .field("elapsed_secs", &self.elapsed_secs())
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Create an idle session for `context`.
    #[must_use]
    pub fn new(context: SessionContext, config: Config, deps: RecorderDeps) -> Self {
        let compositor = Compositor::new(
            &context,
            config.capture.width,
            config.capture.height,
            &config.overlay.watermark,
        );
        let shared = Shared {
            clock: SessionClock::synchronized(context.server_time_ms()),
            compliance: ComplianceMonitor::new(config.location.accuracy_threshold_m),
            compositor,
            context,
            config,
            deps,
            sealer: Sealer,
            state: watch::Sender::new(SessionState::Idle),
            preview: watch::Sender::new(None),
            timeline: LocationTimeline::new(),
            latest: LatestLocation::new(),
            elapsed_secs: AtomicU32::new(0),
            auto_stops: AtomicU32::new(0),
            phase: Mutex::new(Phase::Idle),
            outcome: Mutex::new(None),
            fault: Mutex::new(None),
            last_error: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Acquire devices and begin recording.
    ///
    /// Resolves once the session is `Recording`, or with the reason it is not.
    /// Allowed from `Idle` and, as a full restart, from `Error`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] from any other state,
    /// [`Error::Cancelled`] if [`Recorder::stop`] was called while preparing
    /// (the session is back to `Idle`), or the acquisition error that moved
    /// the session to `Error`.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let cancel = CancellationToken::new();
        {
            let mut phase = lock(&shared.phase);
            let state = shared.state();
            if !matches!(state, SessionState::Idle | SessionState::Error) {
                return Err(Error::InvalidTransition {
                    state,
                    action: "start",
                });
            }
            shared.reset();
            shared.compliance.arm();
            *phase = Phase::Preparing {
                cancel: cancel.clone(),
            };
            shared.set_state(SessionState::Preparing);
        }
        info!(
            "Preparing capture for task {} (operator {})",
            shared.context.task().id,
            shared.context.operator().id
        );

        let Err(err) = self.prepare(&cancel).await else {
            return Ok(());
        };

        shared.compliance.disarm();
        let fault = lock(&shared.fault).take();
        *lock(&shared.phase) = Phase::Idle;

        match fault {
            Some(fault) => {
                error!("Capture failed while preparing: {}", fault);
                shared.enter_error(&fault);
                Err(fault)
            }
            None if err.is_cancelled() => {
                info!("Capture cancelled before recording began");
                shared.set_state(SessionState::Idle);
                Err(err)
            }
            None => {
                error!("Capture failed while preparing: {}", err);
                shared.enter_error(&err);
                Err(err)
            }
        }
    }

    async fn prepare(&self, cancel: &CancellationToken) -> Result<()> {
        let shared = &self.shared;
        let config = &shared.config;
        let mut resources = Resources::default();

        let media = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            acquired = shared.deps.devices.acquire(MediaConstraints::from_config(config)) => acquired?,
        };
        resources.media = Some(Arc::clone(&media));
        debug!("Acquired capture devices via {}", shared.deps.devices.name());

        resources.tracker = Some(self.start_tracking()?);

        let capacity = usize::try_from(config.capture.frame_rate)
            .unwrap_or(usize::MAX)
            .saturating_mul(2)
            .max(1);
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        let render_cancel = cancel.child_token();
        let render = tokio::spawn(render_loop(
            Arc::downgrade(shared),
            Arc::clone(&media),
            frames_tx,
            render_cancel.clone(),
        ));
        resources.render = Some((render_cancel, render));

        let timeout = config.first_frame_timeout();
        let ready = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            ready = tokio::time::timeout(timeout, media.wait_ready()) => ready,
        };
        match ready {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::acquisition(
                    "camera",
                    format!("no decodable frame within {} ms", timeout.as_millis()),
                ))
            }
        }
        debug!("First frame ready");

        let encoder = shared.deps.encoders.create(
            OutputStream {
                frames: frames_rx,
                audio: media.audio_track(),
                frame_rate: config.capture.frame_rate,
            },
            &config.capture.codec_hint,
        )?;

        self.commit(resources, encoder, cancel)
    }

    fn start_tracking(&self) -> Result<TrackerHandle> {
        let shared = &self.shared;
        let on_sample = {
            let timeline = shared.timeline.clone();
            let latest = shared.latest.clone();
            let compliance = shared.compliance.clone();
            move |sample: LocationSample| {
                timeline.push(sample);
                latest.publish(sample);
                compliance.record_fix(&sample);
            }
        };
        let on_loss = {
            let latest = shared.latest.clone();
            let compliance = shared.compliance.clone();
            move |_reason: &str| {
                latest.clear();
                compliance.record_location_lost();
            }
        };
        LocationTracker::start(Arc::clone(&shared.deps.positioning), on_sample, on_loss)
    }

    /// Preparing -> Recording. Runs under the phase lock so a concurrent
    /// `stop()` sees either a cancellable preparation or a live recording.
    fn commit(
        &self,
        mut resources: Resources,
        mut encoder: Box<dyn Encoder>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let shared = &self.shared;
        let mut phase = lock(&shared.phase);
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        encoder.start(shared.config.chunk_interval())?;
        let started_at_ms = shared.clock.now_ms();
        resources.timer = Some(tokio::spawn(duration_timer(
            Arc::downgrade(shared),
            shared.config.capture.max_duration_secs,
        )));

        *phase = Phase::Recording(Box::new(ActiveCapture {
            resources,
            encoder,
            started_at_ms,
        }));
        shared.set_state(SessionState::Recording);
        info!("Recording started for task {}", shared.context.task().id);
        Ok(())
    }

    /// Stop the session.
    ///
    /// While recording: flushes the encoder, releases every device and seals
    /// the result, returning the artifact. While preparing: cancels, and the
    /// pending [`Recorder::start`] returns [`Error::Cancelled`]. Otherwise a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncoderFinalize`] if the encoder could not produce a
    /// payload, or the device fault reported while stopping. The session is
    /// then in `Error` and no artifact exists.
    pub async fn stop(&self) -> Result<Option<SealedArtifact>> {
        let shared = &self.shared;
        let capture = {
            let mut phase = lock(&shared.phase);
            match std::mem::replace(&mut *phase, Phase::Stopping) {
                Phase::Recording(capture) => capture,
                Phase::Preparing { cancel } => {
                    debug!("Stop requested while preparing, cancelling");
                    cancel.cancel();
                    *phase = Phase::Preparing { cancel };
                    return Ok(None);
                }
                other => {
                    *phase = other;
                    return Ok(None);
                }
            }
        };

        let ended_at_ms = shared.clock.now_ms();
        shared.set_state(SessionState::Stopping);
        shared.compliance.disarm();
        info!("Stopping capture for task {}", shared.context.task().id);

        let ActiveCapture {
            mut resources,
            encoder,
            started_at_ms,
        } = *capture;
        resources.quiesce().await;
        drop(resources);

        let finalized = encoder.stop().await;
        *lock(&shared.phase) = Phase::Idle;

        let payload = match finalized {
            Ok(payload) => payload,
            Err(e) => {
                let err = match e {
                    Error::EncoderFinalize(_) => e,
                    other => Error::EncoderFinalize(other.to_string()),
                };
                error!("{}", err);
                shared.enter_error(&err);
                return Err(err);
            }
        };

        if let Some(fault) = lock(&shared.fault).take() {
            error!("Discarding capture after device fault: {}", fault);
            shared.enter_error(&fault);
            return Err(fault);
        }

        let flags = shared.compliance.finish().unwrap_or_else(|| {
            warn!("Compliance flags already consumed, sealing current snapshot");
            shared.compliance.snapshot()
        });
        let record = SessionRecord {
            started_at_ms,
            ended_at_ms,
            location_timeline: shared.timeline.snapshot(),
            compliance_flags: flags,
        };

        match SealedArtifact::seal(&shared.context, record, payload, &shared.sealer) {
            Ok(artifact) => {
                *lock(&shared.outcome) = Some(artifact.clone());
                shared.set_state(SessionState::Finished);
                info!(
                    "Capture sealed as {} ({} ms, {} fixes, flags: {:?})",
                    artifact.id(),
                    artifact.duration_ms(),
                    artifact.location_timeline().len(),
                    flags.violations()
                );
                Ok(Some(artifact))
            }
            Err(e) => {
                error!("Failed to seal capture: {}", e);
                shared.enter_error(&e);
                Err(e)
            }
        }
    }

    /// Report a fatal device fault from the host.
    ///
    /// While preparing or recording the session moves to `Error` and every
    /// resource is released; no artifact is produced.
    pub async fn fail(&self, device: &'static str, reason: impl Into<String>) {
        let shared = &self.shared;
        let fault = Error::DeviceFault {
            device,
            message: reason.into(),
        };
        warn!("{}", fault);

        let capture = {
            let mut phase = lock(&shared.phase);
            match std::mem::replace(&mut *phase, Phase::Stopping) {
                Phase::Recording(capture) => capture,
                Phase::Preparing { cancel } => {
                    *lock(&shared.fault) = Some(fault);
                    cancel.cancel();
                    *phase = Phase::Preparing { cancel };
                    return;
                }
                Phase::Stopping => {
                    *lock(&shared.fault) = Some(fault);
                    return;
                }
                Phase::Idle => {
                    *phase = Phase::Idle;
                    debug!("Ignoring device fault while idle");
                    return;
                }
            }
        };

        shared.compliance.disarm();
        let ActiveCapture {
            mut resources,
            encoder,
            ..
        } = *capture;
        resources.quiesce().await;
        drop(resources);
        drop(encoder);

        *lock(&shared.phase) = Phase::Idle;
        shared.enter_error(&fault);
    }

    /// Host callback: the application lost foreground focus.
    pub fn visibility_lost(&self) {
        self.shared.compliance.record_hidden();
    }

    /// The session's task, operator and organization.
    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.shared.context
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Observe state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the session is `Finished` or `Error`.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.subscribe_state();
        let result = rx.wait_for(|state| state.is_terminal()).await;
        result.map_or_else(|_| self.state(), |state| *state)
    }

    /// Whole seconds recorded so far.
    #[must_use]
    pub fn elapsed_secs(&self) -> u32 {
        self.shared.elapsed_secs.load(Ordering::SeqCst)
    }

    /// How many times the duration cap stopped this session.
    #[must_use]
    pub fn auto_stop_count(&self) -> u32 {
        self.shared.auto_stops.load(Ordering::SeqCst)
    }

    /// The most recent composed frame.
    #[must_use]
    pub fn preview(&self) -> Option<Arc<ComposedFrame>> {
        self.shared.preview.borrow().clone()
    }

    /// Observe composed frames.
    #[must_use]
    pub fn subscribe_preview(&self) -> watch::Receiver<Option<Arc<ComposedFrame>>> {
        self.shared.preview.subscribe()
    }

    /// The sealed artifact, once `Finished`.
    #[must_use]
    pub fn outcome(&self) -> Option<SealedArtifact> {
        lock(&self.shared.outcome).clone()
    }

    /// Why the session is in `Error`.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Compliance flags as they stand.
    #[must_use]
    pub fn compliance_flags(&self) -> ComplianceFlags {
        self.shared.compliance.snapshot()
    }

    /// Fixes received so far, in arrival order.
    #[must_use]
    pub fn location_timeline(&self) -> Vec<LocationSample> {
        self.shared.timeline.snapshot()
    }
}

/// Compose one frame per tick while the session is preparing or recording.
async fn render_loop(
    shared: Weak<Shared>,
    media: Arc<dyn MediaSource>,
    frames: mpsc::Sender<Arc<ComposedFrame>>,
    cancel: CancellationToken,
) {
    let Some(period) = shared.upgrade().map(|s| s.config.frame_interval()) else {
        return;
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut dropped: u64 = 0;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let state = shared.state();
        if !state.is_active() {
            break;
        }

        let raw = media.current_frame();
        let frame = Arc::new(shared.compositor.compose(&FrameInput {
            raw: raw.as_ref(),
            location: shared.latest.current(shared.config.location_stale_after()),
            now_ms: shared.clock.now_ms(),
            recording: state == SessionState::Recording,
        }));
        shared.preview.send_replace(Some(Arc::clone(&frame)));

        if state == SessionState::Recording {
            match frames.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    trace!("Encoder behind, dropped frame");
                }
                Err(TrySendError::Closed(_)) => trace!("Encoder feed closed"),
            }
        }
    }

    if dropped > 0 {
        debug!("Render loop dropped {} frame(s) under backpressure", dropped);
    }
}

/// Count recorded seconds and stop the session at the cap.
async fn duration_timer(shared: Weak<Shared>, max_secs: u32) {
    let period = Duration::from_secs(1);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.state() != SessionState::Recording {
            break;
        }

        let elapsed = shared.elapsed_secs.fetch_add(1, Ordering::SeqCst) + 1;
        if elapsed >= max_secs {
            shared.auto_stops.fetch_add(1, Ordering::SeqCst);
            info!("Reached {} s recording limit, stopping", max_secs);
            let recorder = Recorder { shared };
            tokio::spawn(async move {
                if let Err(e) = recorder.stop().await {
                    warn!("Automatic stop failed: {}", e);
                }
            });
            break;
        }
    }
}
