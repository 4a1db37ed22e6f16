//! Preflight readiness check.
//!
//! Run before a capture is offered: touch the camera, microphone and location
//! sensor once each so permission prompts happen up front, then release them.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::devices::{MediaConstraints, MediaDevices};
use crate::location::{LocationSample, PositionOptions, PositionSource};

/// Which devices are usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreflightReport {
    /// A camera source could be acquired.
    pub camera: bool,
    /// A microphone track came with it.
    pub microphone: bool,
    /// A one-shot location fix succeeded.
    pub location: bool,
    /// The fix obtained, if any.
    pub fix: Option<LocationSample>,
    /// Human-readable reasons for every `false` above.
    pub problems: Vec<String>,
}

impl PreflightReport {
    /// All three checks passed.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.camera && self.microphone && self.location
    }
}

/// Probe devices and positioning. Never fails; denial is reported as `false`.
pub async fn run(
    devices: &dyn MediaDevices,
    positioning: Arc<dyn PositionSource>,
    config: &Config,
) -> PreflightReport {
    let mut report = PreflightReport::default();

    match devices.acquire(MediaConstraints::from_config(config)).await {
        Ok(source) => {
            report.camera = true;
            report.microphone = source.audio_track().is_some();
            if !report.microphone {
                report.problems.push("microphone: no audio track".to_string());
            }
            if let Err(e) = source.release() {
                warn!("Preflight release failed: {}", e);
            }
        }
        Err(e) => {
            debug!("Preflight acquisition via {} failed: {}", devices.name(), e);
            report.problems.push(e.to_string());
        }
    }

    let timeout = config.fix_timeout();
    let fix = tokio::time::timeout(
        timeout,
        positioning.current_position(PositionOptions::one_shot(timeout)),
    )
    .await;
    match fix {
        Ok(Ok(sample)) => {
            report.location = true;
            report.fix = Some(sample);
        }
        Ok(Err(e)) => report.problems.push(e.to_string()),
        Err(_) => report.problems.push(format!(
            "location: no fix within {} ms",
            timeout.as_millis()
        )),
    }

    info!(
        "Preflight: camera={} microphone={} location={}",
        report.camera, report.microphone, report.location
    );
    report
}
