//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use fieldproof::artifact::SessionRecord;
use fieldproof::config::Config;
use fieldproof::devices::{
    AudioTrack, Encoder, EncoderFactory, MediaConstraints, MediaDevices, MediaSource,
    OutputStream, VideoFrame,
};
use fieldproof::location::{PositionEvent, PositionOptions, PositionSource, WatchId};
use fieldproof::session::{Party, TaskRef};
use fieldproof::{
    ArtifactManifest, ComplianceFlags, Error, LocationSample, MediaPayload, RecorderDeps, Result,
    SealedArtifact, Sealer, SessionContext, Transport,
};

/// 2024-03-01 12:00:00 UTC.
pub const SERVER_TIME_MS: i64 = 1_709_294_400_000;

pub fn context() -> SessionContext {
    SessionContext::new(
        TaskRef::new("TASK-1001", "CP-88"),
        Party::new("op-17", "Dana Ruiz"),
        Party::new("org-3", "Northwind Facilities"),
        SERVER_TIME_MS,
    )
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.capture.frame_rate = 10;
    config
}

pub fn sample(accuracy_m: f64, captured_at_ms: i64) -> LocationSample {
    LocationSample::new(47.5, -122.25, accuracy_m, captured_at_ms)
}

pub fn deps(
    devices: &Arc<MockDevices>,
    encoders: &Arc<MockEncoders>,
    positioning: &Arc<MockPositioning>,
) -> RecorderDeps {
    RecorderDeps {
        devices: Arc::clone(devices) as Arc<dyn MediaDevices>,
        encoders: Arc::clone(encoders) as Arc<dyn EncoderFactory>,
        positioning: Arc::clone(positioning) as Arc<dyn PositionSource>,
    }
}

// === Devices ===

#[derive(Debug)]
pub struct MockSource {
    frame: Mutex<Option<VideoFrame>>,
    ready: watch::Sender<bool>,
    released: Arc<AtomicUsize>,
    with_audio: bool,
}

impl MockSource {
    pub fn deliver_frame(&self) {
        *self.frame.lock().unwrap() = Some(VideoFrame::new(4, 4, vec![128u8; 64]));
        self.ready.send_replace(true);
    }
}

#[async_trait::async_trait]
impl MediaSource for MockSource {
    fn current_frame(&self) -> Option<VideoFrame> {
        self.frame.lock().unwrap().clone()
    }

    fn audio_track(&self) -> Option<AudioTrack> {
        self.with_audio.then(|| AudioTrack {
            id: "mic-0".to_string(),
            sample_rate: 48_000,
            channels: 1,
        })
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.ready.subscribe();
        rx.wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| Error::acquisition("camera", "source closed"))
    }

    fn release(&self) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockDevices {
    denied: AtomicBool,
    delivers_frames: bool,
    with_audio: bool,
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
    last: Mutex<Option<Arc<MockSource>>>,
}

impl MockDevices {
    fn build(denied: bool, delivers_frames: bool, with_audio: bool) -> Arc<Self> {
        Arc::new(Self {
            denied: AtomicBool::new(denied),
            delivers_frames,
            with_audio,
            acquired: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
            last: Mutex::new(None),
        })
    }

    /// Camera and microphone granted; frames flow immediately.
    pub fn ready() -> Arc<Self> {
        Self::build(false, true, true)
    }

    /// Granted, but the camera never produces a decodable frame.
    pub fn never_ready() -> Arc<Self> {
        Self::build(false, false, true)
    }

    /// Permission denied.
    pub fn denied() -> Arc<Self> {
        Self::build(true, true, true)
    }

    /// Camera granted without a microphone track.
    pub fn without_audio() -> Arc<Self> {
        Self::build(false, true, false)
    }

    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Sources acquired and not yet released.
    pub fn live(&self) -> usize {
        self.acquired() - self.released()
    }

    pub fn last_source(&self) -> Option<Arc<MockSource>> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl MediaDevices for MockDevices {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<dyn MediaSource>> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(Error::acquisition("camera", "permission denied"));
        }
        assert!(constraints.audio);

        let source = Arc::new(MockSource {
            frame: Mutex::new(None),
            ready: watch::Sender::new(false),
            released: Arc::clone(&self.released),
            with_audio: self.with_audio,
        });
        if self.delivers_frames {
            source.deliver_frame();
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(Arc::clone(&source));
        Ok(source)
    }
}

// === Encoders ===

#[derive(Debug, Default)]
pub struct MockEncoders {
    fail_finalize: bool,
    created: AtomicUsize,
    started: Arc<AtomicUsize>,
    frames: Arc<AtomicUsize>,
}

impl MockEncoders {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_finalize() -> Arc<Self> {
        Arc::new(Self {
            fail_finalize: true,
            ..Self::default()
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Composed frames consumed across all encoders.
    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

impl EncoderFactory for MockEncoders {
    fn create(&self, output: OutputStream, codec_hint: &str) -> Result<Box<dyn Encoder>> {
        assert!(codec_hint.contains("webm"));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockEncoder {
            output: Some(output),
            drain: None,
            fail_finalize: self.fail_finalize,
            started: Arc::clone(&self.started),
            frames: Arc::clone(&self.frames),
        }))
    }
}

struct MockEncoder {
    output: Option<OutputStream>,
    drain: Option<JoinHandle<usize>>,
    fail_finalize: bool,
    started: Arc<AtomicUsize>,
    frames: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Encoder for MockEncoder {
    fn start(&mut self, chunk_interval: Duration) -> Result<()> {
        assert!(!chunk_interval.is_zero());
        let Some(OutputStream { mut frames, .. }) = self.output.take() else {
            return Err(Error::encoder("already started"));
        };
        self.started.fetch_add(1, Ordering::SeqCst);
        let counter = Arc::clone(&self.frames);
        self.drain = Some(tokio::spawn(async move {
            let mut count = 0;
            while frames.recv().await.is_some() {
                count += 1;
                counter.fetch_add(1, Ordering::SeqCst);
            }
            count
        }));
        Ok(())
    }

    async fn stop(self: Box<Self>) -> Result<MediaPayload> {
        let count = match self.drain {
            Some(drain) => drain.await.map_err(|e| Error::encoder(e.to_string()))?,
            None => 0,
        };
        if self.fail_finalize {
            return Err(Error::encoder("muxer crashed"));
        }
        Ok(MediaPayload::webm(format!("webm:{count}").into_bytes()))
    }
}

// === Positioning ===

#[derive(Debug, Default)]
pub struct MockPositioning {
    denied: bool,
    one_shot: Option<LocationSample>,
    next_id: AtomicU64,
    watches: Mutex<HashMap<u64, mpsc::UnboundedSender<PositionEvent>>>,
}

impl MockPositioning {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            denied: true,
            ..Self::default()
        })
    }

    /// Answers one-shot requests with `fix`.
    pub fn with_fix(fix: LocationSample) -> Arc<Self> {
        Arc::new(Self {
            one_shot: Some(fix),
            ..Self::default()
        })
    }

    pub fn active_watches(&self) -> usize {
        self.watches.lock().unwrap().len()
    }

    pub fn emit_fix(&self, sample: LocationSample) {
        self.emit(&PositionEvent::Fix(sample));
    }

    pub fn emit_lost(&self, reason: &str) {
        self.emit(&PositionEvent::Lost(reason.to_string()));
    }

    fn emit(&self, event: &PositionEvent) {
        for tx in self.watches.lock().unwrap().values() {
            let _ = tx.send(event.clone());
        }
    }
}

#[async_trait::async_trait]
impl PositionSource for MockPositioning {
    fn name(&self) -> &'static str {
        "mock-gps"
    }

    fn watch(
        &self,
        _options: PositionOptions,
        events: mpsc::UnboundedSender<PositionEvent>,
    ) -> Result<WatchId> {
        if self.denied {
            return Err(Error::acquisition("location", "permission denied"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.watches.lock().unwrap().insert(id, events);
        Ok(WatchId(id))
    }

    fn clear_watch(&self, id: WatchId) {
        self.watches.lock().unwrap().remove(&id.0);
    }

    async fn current_position(&self, options: PositionOptions) -> Result<LocationSample> {
        if self.denied {
            return Err(Error::acquisition("location", "permission denied"));
        }
        match self.one_shot {
            Some(fix) => Ok(fix),
            None => {
                tokio::time::sleep(options.timeout.unwrap_or(Duration::from_secs(3600)) * 2)
                    .await;
                Err(Error::acquisition("location", "no fix"))
            }
        }
    }
}

// === Transports ===

/// Fails every `fail_every`-th call (1-based) and records what it accepted.
#[derive(Debug)]
pub struct FlakyTransport {
    fail_every: usize,
    calls: AtomicUsize,
    accepted: Mutex<Vec<String>>,
}

impl FlakyTransport {
    pub fn new(fail_every: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_every,
            calls: AtomicUsize::new(0),
            accepted: Mutex::new(Vec::new()),
        })
    }

    /// Never fails.
    pub fn reliable() -> Arc<Self> {
        Self::new(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> Vec<String> {
        self.accepted.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport for FlakyTransport {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn send(&self, _payload: &MediaPayload, manifest: &ArtifactManifest) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::task::yield_now().await;
        if call % self.fail_every == 0 {
            return Err(Error::transport(format!("call {call} dropped")));
        }
        self.accepted.lock().unwrap().push(manifest.id.clone());
        Ok(())
    }
}

/// Holds every send until [`GatedTransport::open`] is called.
#[derive(Debug)]
pub struct GatedTransport {
    gate: Semaphore,
    calls: AtomicUsize,
}

impl GatedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for GatedTransport {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn send(&self, _payload: &MediaPayload, _manifest: &ArtifactManifest) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        Ok(())
    }
}

// === Artifacts ===

pub fn sealed_artifact(organization: &str, started_at_ms: i64) -> SealedArtifact {
    let context = SessionContext::new(
        TaskRef::new("TASK-2002", "CP-1"),
        Party::new("op-1", "Lee Park"),
        Party::new(organization, "Field Org"),
        SERVER_TIME_MS,
    );
    SealedArtifact::seal(
        &context,
        SessionRecord {
            started_at_ms,
            ended_at_ms: started_at_ms + 4_000,
            location_timeline: vec![sample(12.0, started_at_ms + 500)],
            compliance_flags: ComplianceFlags::default(),
        },
        MediaPayload::webm(format!("webm-{started_at_ms}").into_bytes()),
        &Sealer,
    )
    .unwrap()
}
