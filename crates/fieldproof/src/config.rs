//! Configuration management for fieldproof.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "fieldproof";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "artifacts.db";

/// Hard ceiling on a single capture, in seconds.
pub const MAX_RECORDING_SECS: u32 = 180;

/// Accuracy above which a location fix is flagged, in meters.
pub const ACCURACY_THRESHOLD_M: f64 = 50.0;

/// Output canvas width in pixels.
pub const CANVAS_WIDTH: u32 = 1280;

/// Output canvas height in pixels.
pub const CANVAS_HEIGHT: u32 = 720;

/// Watermark burned into the bottom-right of every frame.
pub const WATERMARK_TEXT: &str = "Verified by FieldProof";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `FIELDPROOF_`, sections split on `__`,
///    e.g. `FIELDPROOF_CAPTURE__MAX_DURATION_SECS`)
/// 2. TOML config file at `~/.config/fieldproof/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture session configuration.
    pub capture: CaptureConfig,
    /// Location tracking configuration.
    pub location: LocationConfig,
    /// Overlay configuration.
    pub overlay: OverlayConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Upload configuration.
    pub upload: UploadConfig,
}

/// Capture-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Maximum recording length in seconds.
    pub max_duration_secs: u32,
    /// Target frame rate for both the camera request and the render loop.
    pub frame_rate: u32,
    /// Output canvas width.
    pub width: u32,
    /// Output canvas height.
    pub height: u32,
    /// How often the encoder should emit a chunk, in milliseconds.
    pub chunk_interval_ms: u64,
    /// Codec hint passed to the encoder.
    pub codec_hint: String,
    /// How long to wait for the first decodable frame, in milliseconds.
    pub first_frame_timeout_ms: u64,
}

/// Location-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Accuracy threshold in meters; worse fixes raise `accuracy_exceeded`.
    pub accuracy_threshold_m: f64,
    /// Treat the latest fix as lost for display once it is this old.
    /// Set to 0 to disable.
    pub stale_after_ms: u64,
    /// Timeout for one-shot fixes, in milliseconds.
    pub fix_timeout_ms: u64,
}

/// Overlay-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Watermark text.
    pub watermark: String,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/fieldproof/artifacts.db`
    pub database_path: Option<PathBuf>,
}

/// Upload-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Base URL of the remote artifact store.
    pub endpoint: Option<String>,
    /// Per-transfer timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: MAX_RECORDING_SECS,
            frame_rate: 30,
            width: CANVAS_WIDTH,
            height: CANVAS_HEIGHT,
            chunk_interval_ms: 1000,
            codec_hint: "video/webm;codecs=vp8,opus".to_string(),
            first_frame_timeout_ms: 10_000,
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold_m: ACCURACY_THRESHOLD_M,
            stale_after_ms: 0,
            fix_timeout_ms: 10_000,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            watermark: WATERMARK_TEXT.to_string(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("FIELDPROOF_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.max_duration_secs == 0 {
            return Err(invalid("max_duration_secs must be greater than 0"));
        }
        if capture.frame_rate == 0 || capture.frame_rate > 240 {
            return Err(invalid(format!(
                "frame_rate must be between 1 and 240, got {}",
                capture.frame_rate
            )));
        }
        if capture.width == 0 || capture.height == 0 {
            return Err(invalid("canvas width and height must be non-zero"));
        }
        if capture.chunk_interval_ms == 0 {
            return Err(invalid("chunk_interval_ms must be greater than 0"));
        }
        if capture.first_frame_timeout_ms == 0 {
            return Err(invalid("first_frame_timeout_ms must be greater than 0"));
        }

        let threshold = self.location.accuracy_threshold_m;
        if threshold.is_nan() || threshold <= 0.0 {
            return Err(invalid(format!(
                "accuracy_threshold_m must be positive, got {threshold}"
            )));
        }

        if let Some(endpoint) = &self.upload.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(invalid(format!(
                    "upload endpoint must be an http(s) URL: {endpoint}"
                )));
            }
        }
        if self.upload.timeout_secs == 0 {
            return Err(invalid("upload timeout_secs must be greater than 0"));
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the render loop period.
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.capture.frame_rate.max(1)
    }

    /// Get the encoder chunk interval.
    #[must_use]
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.capture.chunk_interval_ms)
    }

    /// Get the first-frame timeout.
    #[must_use]
    pub fn first_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.capture.first_frame_timeout_ms)
    }

    /// Get the staleness window for the overlay location, if enabled.
    #[must_use]
    pub fn location_stale_after(&self) -> Option<Duration> {
        if self.location.stale_after_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.location.stale_after_ms))
        }
    }

    /// Get the one-shot fix timeout.
    #[must_use]
    pub fn fix_timeout(&self) -> Duration {
        Duration::from_millis(self.location.fix_timeout_ms)
    }

    /// Get the upload timeout.
    #[must_use]
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.timeout_secs)
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_capture_config() {
        let capture = CaptureConfig::default();

        assert_eq!(capture.max_duration_secs, 180);
        assert_eq!(capture.frame_rate, 30);
        assert_eq!((capture.width, capture.height), (1280, 720));
        assert_eq!(capture.chunk_interval_ms, 1000);
        assert!(capture.codec_hint.starts_with("video/webm"));
    }

    #[test]
    fn test_default_location_config() {
        let location = LocationConfig::default();

        assert!((location.accuracy_threshold_m - 50.0).abs() < f64::EPSILON);
        assert_eq!(location.stale_after_ms, 0);
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_duration() {
        let mut config = Config::default();
        config.capture.max_duration_secs = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_duration_secs"));
    }

    #[test]
    fn test_validate_frame_rate_bounds() {
        let mut config = Config::default();
        config.capture.frame_rate = 0;
        assert!(config.validate().is_err());

        config.capture.frame_rate = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accuracy_threshold() {
        let mut config = Config::default();
        config.location.accuracy_threshold_m = 0.0;
        assert!(config.validate().is_err());

        config.location.accuracy_threshold_m = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_endpoint_scheme() {
        let mut config = Config::default();
        config.upload.endpoint = Some("ftp://example.com".to_string());

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("endpoint"));

        config.upload.endpoint = Some("https://vault.example.com".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_database_path_default() {
        let path = Config::default().database_path();
        assert!(path.to_string_lossy().contains("artifacts.db"));
    }

    #[test]
    fn test_database_path_custom() {
        let mut config = Config::default();
        config.storage.database_path = Some(PathBuf::from("/custom/path/db.sqlite"));

        assert_eq!(
            config.database_path(),
            PathBuf::from("/custom/path/db.sqlite")
        );
    }

    #[test]
    fn test_frame_interval() {
        let config = Config::default();
        assert_eq!(config.frame_interval(), Duration::from_nanos(33_333_333));
    }

    #[test]
    fn test_stale_after_disabled_by_default() {
        let mut config = Config::default();
        assert!(config.location_stale_after().is_none());

        config.location.stale_after_ms = 5000;
        assert_eq!(config.location_stale_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.chunk_interval(), Duration::from_secs(1));
        assert_eq!(config.upload_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("fieldproof"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        let config = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[capture]\nmax_duration_secs = 60\n\n[overlay]\nwatermark = \"ACME\"\n",
        )
        .unwrap();

        let config = Config::load_from(Some(path)).unwrap();
        assert_eq!(config.capture.max_duration_secs, 60);
        assert_eq!(config.overlay.watermark, "ACME");
        assert_eq!(config.capture.frame_rate, 30);
    }

    #[test]
    fn test_capture_config_deserialize() {
        let json = r#"{"max_duration_secs": 90, "frame_rate": 24}"#;
        let capture: CaptureConfig = serde_json::from_str(json).unwrap();
        assert_eq!(capture.max_duration_secs, 90);
        assert_eq!(capture.frame_rate, 24);
        assert_eq!(capture.width, 1280);
    }
}
