//! Device and encoder boundaries.
//!
//! The capture pipeline never talks to hardware directly. The host supplies
//! implementations of these traits: a [`MediaDevices`] that hands out live
//! camera/microphone sources, and an [`EncoderFactory`] that turns the
//! compositor's frame feed plus the microphone track into a finished payload.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::artifact::MediaPayload;
use crate::compositor::ComposedFrame;
use crate::config::Config;
use crate::error::Result;

/// What to ask the capture hardware for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    /// Ideal frame width.
    pub width: u32,
    /// Ideal frame height.
    pub height: u32,
    /// Ideal frame rate.
    pub frame_rate: u32,
    /// Whether a microphone track is required.
    pub audio: bool,
}

impl MediaConstraints {
    /// Constraints matching the configured canvas, with audio.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            width: config.capture.width,
            height: config.capture.height,
            frame_rate: config.capture.frame_rate,
            audio: true,
        }
    }
}

/// A decoded camera frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Pixel data, RGBA8, row-major.
    pub pixels: Bytes,
}

impl VideoFrame {
    /// Wrap an RGBA8 buffer.
    #[must_use]
    pub fn new(width: u32, height: u32, pixels: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            pixels: pixels.into(),
        }
    }

    /// Whether the frame carries any picture data.
    #[must_use]
    pub fn is_decodable(&self) -> bool {
        self.width > 0 && self.height > 0 && !self.pixels.is_empty()
    }
}

/// Opaque handle to a live microphone track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTrack {
    /// Host-assigned track identifier.
    pub id: String,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
}

/// The device capture boundary.
#[async_trait::async_trait]
pub trait MediaDevices: Send + Sync {
    /// The name of this device provider (for logging).
    fn name(&self) -> &'static str;

    /// Acquire a live camera (and microphone, if requested) source.
    ///
    /// # Errors
    ///
    /// Returns an error if access is denied or the hardware is unsupported.
    async fn acquire(&self, constraints: MediaConstraints) -> Result<Arc<dyn MediaSource>>;
}

/// A live camera/microphone source.
///
/// Must be released with [`MediaSource::release`]; the session guarantees
/// this on every exit path.
#[async_trait::async_trait]
pub trait MediaSource: Send + Sync {
    /// The most recent decodable frame, or `None` while the camera warms up.
    fn current_frame(&self) -> Option<VideoFrame>;

    /// The microphone track, if one was acquired.
    fn audio_track(&self) -> Option<AudioTrack>;

    /// Resolve once the first frame is decodable.
    ///
    /// # Errors
    ///
    /// Returns an error if the source fails before producing a frame.
    async fn wait_ready(&self) -> Result<()>;

    /// Release the hardware.
    ///
    /// # Errors
    ///
    /// Returns an error if the host could not release a device cleanly.
    fn release(&self) -> Result<()>;
}

/// What an encoder consumes: composed frames plus the raw microphone track.
#[derive(Debug)]
pub struct OutputStream {
    /// Composed frames, one per render tick. Closed when rendering stops.
    pub frames: mpsc::Receiver<Arc<ComposedFrame>>,
    /// Microphone track to mux alongside the video.
    pub audio: Option<AudioTrack>,
    /// Nominal frame rate of `frames`.
    pub frame_rate: u32,
}

/// The encoder boundary: creates encoders bound to an output stream.
pub trait EncoderFactory: Send + Sync {
    /// Create an encoder for `output`. The encoder must not start until
    /// [`Encoder::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the codec is unsupported.
    fn create(&self, output: OutputStream, codec_hint: &str) -> Result<Box<dyn Encoder>>;
}

/// A running encoder.
#[async_trait::async_trait]
pub trait Encoder: Send {
    /// Begin encoding, emitting a chunk every `chunk_interval`.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder cannot start.
    fn start(&mut self, chunk_interval: Duration) -> Result<()>;

    /// Flush, finalize and return the complete payload.
    ///
    /// # Errors
    ///
    /// Returns an error if finalization fails; no partial payload is returned.
    async fn stop(self: Box<Self>) -> Result<MediaPayload>;
}
