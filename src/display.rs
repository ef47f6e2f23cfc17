// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::path::Path;

use canonical_error::{failed_precondition_error, CanonicalError};
use image::RgbImage;
use log::debug;

/// Raw state of the seven-button pad, true while pressed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ButtonSnapshot {
    pub a: bool,
    pub b: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
    pub center: bool,
}

/// The physical display/button bonnet. One hardware implementation per
/// supported panel, plus a stub for development hosts.
pub trait ScreenDriver: Send {
    fn draw(&mut self, raster: &RgbImage);
    fn set_brightness(&mut self, level: f64);
    fn read_buttons(&mut self) -> ButtonSnapshot;
}

/// In-memory display for development and tests: remembers the last raster,
/// replays queued button snapshots.
pub struct StubScreen {
    latest: Option<RgbImage>,
    brightness: f64,
    queued_buttons: VecDeque<ButtonSnapshot>,
}

impl Default for StubScreen {
    fn default() -> Self {
        Self::new()
    }
}

impl StubScreen {
    pub fn new() -> Self {
        StubScreen {
            latest: None,
            brightness: 1.0,
            queued_buttons: VecDeque::new(),
        }
    }

    pub fn latest(&self) -> Option<&RgbImage> {
        self.latest.as_ref()
    }

    pub fn brightness(&self) -> f64 {
        self.brightness
    }

    /// Enqueues a snapshot to be returned by the next read_buttons() call.
    pub fn push_buttons(&mut self, snapshot: ButtonSnapshot) {
        self.queued_buttons.push_back(snapshot);
    }

    /// Writes the most recent raster to `path` (the --ui debugging mode).
    pub fn save_latest(&self, path: &Path) -> Result<(), CanonicalError> {
        let raster = self.latest.as_ref().ok_or_else(|| {
            failed_precondition_error("nothing has been drawn yet")
        })?;
        raster.save(path).map_err(|e| {
            failed_precondition_error(
                format!("cannot save {}: {}", path.display(), e).as_str(),
            )
        })
    }
}

impl ScreenDriver for StubScreen {
    fn draw(&mut self, raster: &RgbImage) {
        self.latest = Some(raster.clone());
    }

    fn set_brightness(&mut self, level: f64) {
        self.brightness = level.clamp(0.0, 1.0);
        debug!("stub screen brightness {}", self.brightness);
    }

    fn read_buttons(&mut self) -> ButtonSnapshot {
        self.queued_buttons.pop_front().unwrap_or_default()
    }
}

/// Hardware drivers are only wired up on the device itself; everything else
/// gets the stub.
pub fn is_device_host() -> bool {
    std::fs::read_to_string("/etc/hostname")
        .map(|hostname| hostname.trim() == "rpi")
        .unwrap_or(false)
}
