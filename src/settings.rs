// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use canonical_error::{invalid_argument_error, CanonicalError};
use chrono::{DateTime, Utc};
use log::{info, warn};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::context::TelescopeOptics;

const SETTINGS_FILE: &str = "settings.txt";
const CALIBRATION_FILE: &str = "offset.json";
const COORD_LOG_FILE: &str = "coord_log.txt";

/// Alignment outputs that survive restarts: the camera-to-telescope
/// rotation and the solver's target pixel. JSON keeps the floats exact.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub rotation_matrix: Option<[[f64; 3]; 3]>,
    pub target_pixel: Option<(f64, f64)>,
}

impl Calibration {
    pub fn rotation(&self) -> Option<Matrix3<f64>> {
        self.rotation_matrix.map(|rows| {
            Matrix3::from_row_slice(&[
                rows[0][0], rows[0][1], rows[0][2],
                rows[1][0], rows[1][1], rows[1][2],
                rows[2][0], rows[2][1], rows[2][2],
            ])
        })
    }

    pub fn set_rotation(&mut self, matrix: &Matrix3<f64>) {
        let mut rows = [[0.0; 3]; 3];
        for r in 0..3 {
            for c in 0..3 {
                rows[r][c] = matrix[(r, c)];
            }
        }
        self.rotation_matrix = Some(rows);
    }
}

/// On-disk state under one data directory: user settings, alignment
/// calibration, and the optional coordinate log. Persistence failures after
/// startup are logged and swallowed; memory stays authoritative.
pub struct SettingsStore {
    data_dir: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &Path) -> Result<Self, CanonicalError> {
        fs::create_dir_all(data_dir).map_err(|e| {
            invalid_argument_error(
                format!("cannot create {}: {}", data_dir.display(), e)
                    .as_str(),
            )
        })?;
        Ok(SettingsStore { data_dir: data_dir.to_path_buf() })
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    fn calibration_path(&self) -> PathBuf {
        self.data_dir.join(CALIBRATION_FILE)
    }

    fn coord_log_path(&self) -> PathBuf {
        self.data_dir.join(COORD_LOG_FILE)
    }

    fn render_settings(optics: &TelescopeOptics) -> String {
        let mut out = String::new();
        out.push_str(&format!("aperture: {}\n", optics.aperture));
        out.push_str(&format!("focal_length: {}\n", optics.focal_length));
        out.push_str(&format!("eyepiece: {}\n", optics.eyepiece));
        out.push_str(&format!("eyepiece_fov: {}\n", optics.eyepiece_fov));
        out.push_str(&format!("x_offset: {:.1}\n", optics.camera_offset.0));
        out.push_str(&format!("y_offset: {:.1}\n", optics.camera_offset.1));
        out.push_str(&format!("view_angle: {}\n", optics.view_angle));
        out
    }

    /// Writes settings.txt. Skips the write when the rendered content
    /// matches what is already on disk, so repeated saves of identical
    /// state leave the file byte-for-byte untouched.
    pub fn save_settings(&self, optics: &TelescopeOptics) {
        let rendered = Self::render_settings(optics);
        let path = self.settings_path();
        if let Ok(existing) = fs::read_to_string(&path) {
            if existing == rendered {
                return;
            }
        }
        if let Err(e) = fs::write(&path, rendered) {
            warn!("cannot save {}: {}", path.display(), e);
        }
    }

    /// Loads settings.txt into `optics`. A missing file is seeded with the
    /// current values; malformed lines are skipped with a warning.
    pub fn load_settings(&self, optics: &mut TelescopeOptics) {
        let path = self.settings_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => {
                self.save_settings(optics);
                return;
            }
        };
        let mut values = HashMap::new();
        for line in content.lines() {
            match line.split_once(':') {
                Some((key, value)) => {
                    if let Ok(parsed) = value.trim().parse::<f64>() {
                        values.insert(key.trim().to_string(), parsed);
                    } else {
                        warn!("bad settings value: {}", line);
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!("bad settings line: {}", line),
            }
        }
        if let Some(&v) = values.get("aperture") {
            optics.aperture = v;
        }
        if let Some(&v) = values.get("focal_length") {
            optics.focal_length = v;
        }
        if let Some(&v) = values.get("eyepiece") {
            optics.eyepiece = v;
        }
        if let Some(&v) = values.get("eyepiece_fov") {
            optics.eyepiece_fov = v;
        }
        if let Some(&x) = values.get("x_offset") {
            optics.camera_offset.0 = x;
        }
        if let Some(&y) = values.get("y_offset") {
            optics.camera_offset.1 = y;
        }
        if let Some(&v) = values.get("view_angle") {
            optics.view_angle = v;
        }
        info!("settings loaded from {}", path.display());
    }

    pub fn save_calibration(&self, calibration: &Calibration) {
        let path = self.calibration_path();
        match serde_json::to_string_pretty(calibration) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json) {
                    warn!("cannot save {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("cannot encode calibration: {}", e),
        }
    }

    pub fn load_calibration(&self) -> Calibration {
        let path = self.calibration_path();
        match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("bad calibration file {}: {}", path.display(), e);
                Calibration::default()
            }),
            Err(_) => Calibration::default(),
        }
    }

    /// Appends one position fix to the coordinate log.
    pub fn append_coord(&self, time: SystemTime, ra: f64, dec: f64) {
        let stamp =
            DateTime::<Utc>::from(time).format("%Y-%m-%d %H:%M:%S");
        let line = format!("{} - ({}, {})\n", stamp, ra, dec);
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.coord_log_path())
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!("cannot append coordinate log: {}", e);
        }
    }
}
