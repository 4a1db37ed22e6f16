//! Frame composition.
//!
//! The compositor turns one raw camera frame plus the current overlay data into
//! a [`ComposedFrame`]: an ordered display list of [`Layer`]s. Rasterization
//! belongs to the encoder side of the boundary; this module only decides what
//! goes where, so it is pure and cheap enough to run on every render tick.

use chrono::DateTime;

use crate::devices::VideoFrame;
use crate::location::LocationSample;
use crate::session::SessionContext;

/// Height of the translucent header band.
pub const TOP_BAND_HEIGHT: u32 = 120;

/// Height of the translucent footer band.
pub const BOTTOM_BAND_HEIGHT: u32 = 60;

/// Text shown in place of a location when no recent fix exists.
pub const SIGNAL_LOST_LABEL: &str = "SIGNAL LOST";

/// Text shown on the fallback frame while the camera warms up.
pub const INITIALIZING_LABEL: &str = "Initializing…";

const MARGIN: i32 = 20;

/// An 8-bit RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgba {
    /// Red.
    pub r: u8,
    /// Green.
    pub g: u8,
    /// Blue.
    pub b: u8,
    /// Alpha, 255 = opaque.
    pub a: u8,
}

impl Rgba {
    /// Opaque black.
    pub const BLACK: Self = Self::rgb(0, 0, 0);
    /// Opaque white.
    pub const WHITE: Self = Self::rgb(255, 255, 255);
    /// Alert red.
    pub const RED: Self = Self::rgb(255, 0, 0);

    /// An opaque color.
    #[must_use]
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// The same color with a different alpha.
    #[must_use]
    pub const fn with_alpha(self, a: u8) -> Self {
        Self { a, ..self }
    }
}

/// An axis-aligned rectangle in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Create a rectangle.
    #[must_use]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Font family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontFamily {
    /// Proportional sans-serif.
    Sans,
    /// Fixed-width.
    Monospace,
}

/// Font selection for a text layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Font {
    /// Family.
    pub family: FontFamily,
    /// Pixel size.
    pub size_px: u32,
    /// Bold weight.
    pub bold: bool,
    /// Italic style.
    pub italic: bool,
}

impl Font {
    const fn plain(family: FontFamily, size_px: u32) -> Self {
        Self {
            family,
            size_px,
            bold: false,
            italic: false,
        }
    }
}

/// Horizontal anchor of a text layer relative to its `x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    /// `x` is the left edge.
    Left,
    /// `x` is the center.
    Center,
    /// `x` is the right edge.
    Right,
}

/// One drawing operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    /// A camera frame scaled into `dest`.
    Video {
        /// The source frame.
        frame: VideoFrame,
        /// Destination rectangle.
        dest: Rect,
    },
    /// A solid (possibly translucent) rectangle.
    Fill {
        /// Area to fill.
        rect: Rect,
        /// Fill color.
        color: Rgba,
    },
    /// A single line of text with its baseline at `y`.
    Text {
        /// The text.
        text: String,
        /// Anchor x.
        x: i32,
        /// Baseline y.
        y: i32,
        /// Font.
        font: Font,
        /// Text color.
        color: Rgba,
        /// Horizontal alignment.
        align: Align,
    },
    /// A filled circle.
    Disc {
        /// Center x.
        cx: i32,
        /// Center y.
        cy: i32,
        /// Radius in pixels.
        radius: u32,
        /// Fill color.
        color: Rgba,
    },
}

/// A composed output frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedFrame {
    /// Canvas width.
    pub width: u32,
    /// Canvas height.
    pub height: u32,
    /// Session clock time the frame was composed, epoch milliseconds.
    pub composed_at_ms: i64,
    /// Layers, bottom to top.
    pub layers: Vec<Layer>,
}

impl ComposedFrame {
    /// All text drawn on the frame, in layer order.
    #[must_use]
    pub fn texts(&self) -> Vec<&str> {
        self.layers
            .iter()
            .filter_map(|layer| match layer {
                Layer::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Whether this is the warm-up placeholder rather than a camera frame.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        !self
            .layers
            .iter()
            .any(|layer| matches!(layer, Layer::Video { .. }))
    }

    /// Whether the recording indicator is drawn.
    #[must_use]
    pub fn shows_recording_indicator(&self) -> bool {
        self.layers
            .iter()
            .any(|layer| matches!(layer, Layer::Disc { .. }))
    }
}

/// Per-tick inputs to [`Compositor::compose`].
#[derive(Debug, Clone, Copy)]
pub struct FrameInput<'a> {
    /// The current camera frame, if any.
    pub raw: Option<&'a VideoFrame>,
    /// The latest location fix, or `None` if the signal is lost.
    pub location: Option<LocationSample>,
    /// Session clock time, epoch milliseconds.
    pub now_ms: i64,
    /// Whether the session is recording (draws the indicator).
    pub recording: bool,
}

/// Builds overlay frames for one session.
#[derive(Debug, Clone)]
pub struct Compositor {
    width: u32,
    height: u32,
    header: String,
    operator_line: String,
    watermark: String,
}

impl Compositor {
    /// Create a compositor for `context` on a `width`×`height` canvas.
    #[must_use]
    pub fn new(context: &SessionContext, width: u32, height: u32, watermark: &str) -> Self {
        Self {
            width,
            height,
            header: format!(
                "{} | Task: {}",
                context.organization().name,
                context.task().id
            ),
            operator_line: format!(
                "Operator: {} ({})",
                context.operator().name,
                context.operator().id
            ),
            watermark: watermark.to_string(),
        }
    }

    /// Compose one frame.
    #[must_use]
    pub fn compose(&self, input: &FrameInput<'_>) -> ComposedFrame {
        let layers = match input.raw.filter(|frame| frame.is_decodable()) {
            Some(frame) => self.overlay(frame, input),
            None => self.fallback(),
        };
        ComposedFrame {
            width: self.width,
            height: self.height,
            composed_at_ms: input.now_ms,
            layers,
        }
    }

    fn overlay(&self, frame: &VideoFrame, input: &FrameInput<'_>) -> Vec<Layer> {
        let w = to_coord(self.width);
        let h = to_coord(self.height);
        let band = Rgba::BLACK.with_alpha(128);
        let body = Font::plain(FontFamily::Sans, 24);
        let mono = Font {
            bold: true,
            ..Font::plain(FontFamily::Monospace, 24)
        };

        let mut layers = Vec::with_capacity(9);
        layers.push(Layer::Video {
            frame: frame.clone(),
            dest: Rect::new(0, 0, self.width, self.height),
        });
        layers.push(Layer::Fill {
            rect: Rect::new(0, 0, self.width, TOP_BAND_HEIGHT),
            color: band,
        });
        layers.push(Layer::Fill {
            rect: Rect::new(
                0,
                h - to_coord(BOTTOM_BAND_HEIGHT),
                self.width,
                BOTTOM_BAND_HEIGHT,
            ),
            color: band,
        });
        layers.push(text(&self.header, MARGIN, 40, body, Rgba::WHITE, Align::Left));
        layers.push(text(
            &self.operator_line,
            MARGIN,
            75,
            body,
            Rgba::WHITE,
            Align::Left,
        ));
        layers.push(text(
            &format_timestamp(input.now_ms),
            w - MARGIN,
            40,
            mono,
            Rgba::WHITE,
            Align::Right,
        ));
        layers.push(match input.location {
            Some(sample) => text(
                &sample.overlay_label(),
                MARGIN,
                h - MARGIN,
                mono,
                Rgba::WHITE,
                Align::Left,
            ),
            None => text(
                SIGNAL_LOST_LABEL,
                MARGIN,
                h - MARGIN,
                mono,
                Rgba::RED,
                Align::Left,
            ),
        });
        layers.push(text(
            &self.watermark,
            w - MARGIN,
            h - MARGIN,
            Font {
                italic: true,
                ..Font::plain(FontFamily::Sans, 18)
            },
            Rgba::WHITE.with_alpha(153),
            Align::Right,
        ));
        if input.recording {
            layers.push(Layer::Disc {
                cx: w - 40,
                cy: 75,
                radius: 10,
                color: Rgba::RED.with_alpha(pulse_alpha(input.now_ms)),
            });
        }
        layers
    }

    fn fallback(&self) -> Vec<Layer> {
        vec![
            Layer::Fill {
                rect: Rect::new(0, 0, self.width, self.height),
                color: Rgba::BLACK,
            },
            text(
                INITIALIZING_LABEL,
                to_coord(self.width) / 2,
                to_coord(self.height) / 2,
                Font::plain(FontFamily::Sans, 24),
                Rgba::WHITE,
                Align::Center,
            ),
        ]
    }
}

fn text(s: &str, x: i32, y: i32, font: Font, color: Rgba, align: Align) -> Layer {
    Layer::Text {
        text: s.to_string(),
        x,
        y,
        font,
        color,
        align,
    }
}

fn to_coord(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

/// UTC wall clock at second resolution.
fn format_timestamp(epoch_ms: i64) -> String {
    DateTime::from_timestamp_millis(epoch_ms).map_or_else(
        || "--------- --:--:--".to_string(),
        |dt| dt.format("%Y-%m-%d %H:%M:%S").to_string(),
    )
}

/// Triangle wave over one second, between 55 and 255.
fn pulse_alpha(epoch_ms: i64) -> u8 {
    let phase = epoch_ms.rem_euclid(1000);
    let ramp = if phase < 500 { phase } else { 1000 - phase };
    u8::try_from(55 + ramp * 200 / 500).unwrap_or(u8::MAX)
}
