// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use image::GrayImage;
use nalgebra::Matrix3;

use crate::astro_util::{self, ObserverLocation};

/// Exposure bounds enforced on every CameraState update, microseconds.
pub const MIN_EXPOSURE_US: i64 = 100_000;
pub const MAX_EXPOSURE_US: i64 = 5_000_000;

/// A raw frame from the camera. Frames are shared by Arc between the solve
/// and analysis paths and dropped when both have seen them.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: GrayImage,
    pub readout_time: SystemTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Star,
    Dso,
    Planet,
    Asteroid,
}

/// A sky object as surfaced to the renderer and target screens.
#[derive(Clone, Debug)]
pub struct CelestialObject {
    pub name: String,
    pub ra: f64,
    pub dec: f64,
    pub magnitude: f64,
    pub kind: ObjectKind,
    pub catalog_id: Option<String>,
}

impl CelestialObject {
    pub fn is_solar_system(&self) -> bool {
        matches!(self.kind, ObjectKind::Planet | ObjectKind::Asteroid)
    }
}

/// Which catalog the target screens are browsing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CatalogFilter {
    #[default]
    Stars,
    Dsos,
    SolarSystem,
}

/// Observing time and place. The observer location never changes after
/// startup; time advances on each main-loop tick.
#[derive(Clone, Debug)]
pub struct Environment {
    pub time: SystemTime,
    pub location: ObserverLocation,
    pub min_visible_altitude: f64,
}

impl Environment {
    pub fn new(location: ObserverLocation) -> Self {
        Environment {
            time: SystemTime::now(),
            location,
            min_visible_altitude: 20.0,
        }
    }

    pub fn is_target_visible(&self, ra: f64, dec: f64) -> bool {
        let (alt, _az) =
            astro_util::radec_to_altaz(ra, dec, &self.time, &self.location);
        alt > self.min_visible_altitude
    }
}

/// Camera knobs plus the most recently captured frame. The frame is
/// published as an Arc handle swap; readers clone the Arc and never hold
/// the lock across their use of the pixels.
#[derive(Clone, Debug)]
pub struct CameraState {
    pub enabled: bool,
    exposure_us: i64,
    pub gain: f64,
    latest_image: Option<Arc<Frame>>,
}

impl CameraState {
    pub fn new() -> Self {
        CameraState {
            enabled: false,
            exposure_us: 1_000_000,
            gain: 8.0,
            latest_image: None,
        }
    }

    pub fn exposure_us(&self) -> i64 {
        self.exposure_us
    }

    /// Clamped to [MIN_EXPOSURE_US, MAX_EXPOSURE_US].
    pub fn set_exposure_us(&mut self, exposure_us: i64) {
        self.exposure_us = exposure_us.clamp(MIN_EXPOSURE_US, MAX_EXPOSURE_US);
    }

    pub fn publish_image(&mut self, frame: Arc<Frame>) {
        self.latest_image = Some(frame);
    }

    pub fn latest_image(&self) -> Option<Arc<Frame>> {
        self.latest_image.clone()
    }
}

/// Where the telescope is pointing, per the most recent applied solution.
/// `position` is the corrected pointing; `mount_position` is the raw solver
/// output before rotation/offset correction.
#[derive(Clone, Debug, Default)]
pub struct TelescopeState {
    pub position: Option<(f64, f64)>,
    pub last_position: Option<(f64, f64)>,
    pub mount_position: Option<(f64, f64)>,
    pub roll: f64,
    /// Great-circle separation (degrees) between the two most recent
    /// distinct positions.
    pub speed: f64,
    pub logging: bool,
}

impl TelescopeState {
    pub fn is_solved(&self) -> bool {
        self.position.is_some()
    }

    /// Sidereal drift applied between solves so the rendered field keeps
    /// moving with the sky.
    pub fn drift(&mut self, dt_seconds: f64) {
        if let Some((ra, dec)) = self.position {
            self.position = Some(astro_util::sky_drift(ra, dec, dt_seconds));
        }
    }
}

/// Optical train and view configuration, persisted in settings.txt.
#[derive(Clone, Debug, PartialEq)]
pub struct TelescopeOptics {
    pub focal_length: f64, // mm
    pub aperture: f64,     // mm
    pub eyepiece: f64,     // mm
    pub eyepiece_fov: f64, // Apparent FOV of the eyepiece, degrees.
    pub zoom: f64,         // Zoom eyepiece or Barlow factor.
    /// Fixed camera-to-eyepiece misalignment, applied in horizon
    /// coordinates: (azimuth offset, altitude offset) degrees.
    pub camera_offset: (f64, f64),
    pub view_angle: f64, // 0..360
}

impl Default for TelescopeOptics {
    fn default() -> Self {
        TelescopeOptics {
            focal_length: 1200.0,
            aperture: 200.0,
            eyepiece: 25.0,
            eyepiece_fov: 40.0,
            zoom: 1.0,
            camera_offset: (0.0, 0.0),
            view_angle: 0.0,
        }
    }
}

impl TelescopeOptics {
    pub fn magnification(&self) -> f64 {
        self.focal_length / self.eyepiece
    }

    pub fn true_fov(&self) -> f64 {
        self.eyepiece_fov / self.magnification()
    }

    pub fn field_radius(&self) -> f64 {
        (self.true_fov() / 2.0) * self.zoom
    }

    /// Faintest magnitude worth drawing. The fixed pollution offset is
    /// generous for suburban skies.
    pub fn limiting_magnitude(&self) -> f64 {
        let light_pollution_offset = 1.0;
        2.0 + 5.0 * self.aperture.log10()
            - light_pollution_offset
            - self.zoom / 3.0
    }

    pub fn has_camera_offset(&self) -> bool {
        self.camera_offset != (0.0, 0.0)
    }
}

/// Plate-solver configuration and calibration outputs.
#[derive(Clone, Debug)]
pub struct SolverState {
    /// Estimated horizontal field of view handed to the solver, degrees.
    pub fov_estimate: f64,
    /// Pixel whose sky coordinate the solver reports, (col=x, row=y).
    /// None means report the frame center.
    pub target_pixel: Option<(f64, f64)>,
    pub last_solved: Option<SystemTime>,
    /// Camera-to-telescope alignment from the calibration procedure.
    pub rotation_matrix: Option<Matrix3<f64>>,
}

impl Default for SolverState {
    fn default() -> Self {
        SolverState {
            fov_estimate: 21.0,
            target_pixel: None,
            last_solved: None,
            rotation_matrix: None,
        }
    }
}

/// The object being navigated to, if any.
#[derive(Clone, Debug, Default)]
pub struct TargetState {
    pub name: String,
    position: Option<(f64, f64)>,
    pub catalog_filter: CatalogFilter,
}

impl TargetState {
    pub fn has_target(&self) -> bool {
        self.position.is_some()
    }

    pub fn set_target(&mut self, ra: f64, dec: f64, name: &str) {
        if !ra.is_finite() || !dec.is_finite() {
            return;
        }
        self.position = Some((ra, dec));
        self.name = name.to_string();
    }

    pub fn clear(&mut self) {
        self.position = None;
        self.name.clear();
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        self.position
    }
}

/// The canonical shared model. Created once at startup; every field has its
/// own mutex and critical sections are bounded copy-outs.
pub struct ObservationContext {
    pub environment: Mutex<Environment>,
    pub camera: Mutex<CameraState>,
    pub telescope: Mutex<TelescopeState>,
    pub optics: Mutex<TelescopeOptics>,
    pub solver: Mutex<SolverState>,
    pub target: Mutex<TargetState>,
}

impl ObservationContext {
    pub fn new(location: ObserverLocation) -> Self {
        ObservationContext {
            environment: Mutex::new(Environment::new(location)),
            camera: Mutex::new(CameraState::new()),
            telescope: Mutex::new(TelescopeState::default()),
            optics: Mutex::new(TelescopeOptics::default()),
            solver: Mutex::new(SolverState::default()),
            target: Mutex::new(TargetState::default()),
        }
    }

    /// Snapshot of (ra, dec, roll) for renderers. None before the first
    /// applied solution.
    pub fn pointing(&self) -> Option<(f64, f64, f64)> {
        let telescope = self.telescope.lock().unwrap();
        telescope.position.map(|(ra, dec)| (ra, dec, telescope.roll))
    }

    /// Seconds since the most recent applied solution.
    pub fn seconds_since_solve(&self) -> Option<f64> {
        let last_solved = self.solver.lock().unwrap().last_solved?;
        SystemTime::now()
            .duration_since(last_solved)
            .ok()
            .map(|d| d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_exposure_clamped() {
        let mut camera = CameraState::new();
        camera.set_exposure_us(50_000);
        assert_eq!(camera.exposure_us(), MIN_EXPOSURE_US);
        camera.set_exposure_us(10_000_000);
        assert_eq!(camera.exposure_us(), MAX_EXPOSURE_US);
        camera.set_exposure_us(600_000);
        assert_eq!(camera.exposure_us(), 600_000);
    }

    #[test]
    fn test_optics_derived_values() {
        let optics = TelescopeOptics::default();
        assert_abs_diff_eq!(optics.magnification(), 48.0, epsilon = 1e-9);
        assert_abs_diff_eq!(optics.true_fov(), 40.0 / 48.0, epsilon = 1e-9);
        assert_abs_diff_eq!(
            optics.field_radius(),
            40.0 / 48.0 / 2.0,
            epsilon = 1e-9
        );
        // 2 + 5*log10(200) - 1 - 1/3.
        assert_abs_diff_eq!(
            optics.limiting_magnitude(),
            2.0 + 5.0 * 200_f64.log10() - 1.0 - 1.0 / 3.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_field_radius_scales_with_zoom() {
        let mut optics = TelescopeOptics::default();
        let base = optics.field_radius();
        optics.zoom = 2.0;
        assert_abs_diff_eq!(optics.field_radius(), base * 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_target_requires_finite_coordinates() {
        let mut target = TargetState::default();
        target.set_target(f64::NAN, 10.0, "bogus");
        assert!(!target.has_target());
        target.set_target(279.2437, 38.7861, "Vega");
        assert!(target.has_target());
        assert_eq!(target.name, "Vega");
        target.clear();
        assert!(!target.has_target());
    }

    #[test]
    fn test_telescope_drift_moves_position() {
        let mut telescope = TelescopeState::default();
        telescope.drift(3600.0); // No position yet: no-op.
        assert!(telescope.position.is_none());

        telescope.position = Some((100.0, 0.0));
        telescope.drift(3600.0);
        let (ra, dec) = telescope.position.unwrap();
        assert_abs_diff_eq!(ra, 115.0, epsilon = 1e-9);
        assert_eq!(dec, 0.0);
    }
}
