// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::f64::consts::PI;
use std::time::SystemTime;

use astro::{
    angle::limit_to_two_PI,
    coords::{alt_frm_eq, az_frm_eq, hr_angl_frm_hz},
    time::{julian_day, mn_sidr, CalType, Date},
};
use chrono::{DateTime, Datelike, Timelike, Utc};
use nalgebra::{Matrix3, Vector3};

/// Geographic position of the observer. Degrees and meters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObserverLocation {
    pub latitude: f64,
    pub longitude: f64, // Positive east.
    pub elevation: f64,
}

/// Convert ra/dec (degrees) to a unit vector on the celestial sphere.
pub fn radec_to_vector(ra_deg: f64, dec_deg: f64) -> Vector3<f64> {
    let ra = ra_deg.to_radians();
    let dec = dec_deg.to_radians();
    Vector3::new(dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin())
}

/// Convert a unit vector back to (ra, dec) in degrees, ra in 0..360.
pub fn vector_to_radec(v: &Vector3<f64>) -> (f64, f64) {
    let dec = v.z.clamp(-1.0, 1.0).asin().to_degrees();
    let mut ra = v.y.atan2(v.x).to_degrees();
    if ra < 0.0 {
        ra += 360.0;
    }
    (ra, dec)
}

// Rodrigues' cross-product matrix for a unit axis.
fn skew(axis: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -axis.z, axis.y,
        axis.z, 0.0, -axis.x,
        -axis.y, axis.x, 0.0,
    )
}

/// Rotation taking unit vector `v1` onto unit vector `v2` (Rodrigues).
/// Parallel inputs yield the identity; anti-parallel inputs yield a 180
/// degree rotation about an arbitrary perpendicular axis.
pub fn rotation_between_vectors(
    v1: &Vector3<f64>,
    v2: &Vector3<f64>,
) -> Matrix3<f64> {
    let v1 = v1.normalize();
    let v2 = v2.normalize();
    let dot = v1.dot(&v2).clamp(-1.0, 1.0);

    if dot < -0.99999 {
        // Pick any vector not parallel to v1 to derive a perpendicular axis.
        let perp = if v1.x.abs() < 0.9 {
            Vector3::new(1.0, 0.0, 0.0)
        } else {
            Vector3::new(0.0, 1.0, 0.0)
        };
        let axis = v1.cross(&perp).normalize();
        return 2.0 * axis * axis.transpose() - Matrix3::identity();
    }

    let axis = v1.cross(&v2);
    if axis.norm() < 1e-8 {
        return Matrix3::identity();
    }
    let angle = dot.acos();
    let k = skew(&axis.normalize());
    Matrix3::identity() + angle.sin() * k + (1.0 - angle.cos()) * k * k
}

/// Rotation by `angle_deg` about the (not necessarily unit) vector `v`.
pub fn rotate_about_vector(v: &Vector3<f64>, angle_deg: f64) -> Matrix3<f64> {
    let angle = angle_deg.to_radians();
    let k = skew(&v.normalize());
    Matrix3::identity() + angle.sin() * k + (1.0 - angle.cos()) * k * k
}

/// Rotation mapping the camera's sky position onto the telescope's, composed
/// with the camera roll about the telescope axis. Output of the alignment
/// procedure; persisted and applied to every subsequent solve.
pub fn solve_rotation(
    camera: (f64, f64),
    telescope: (f64, f64),
    camera_roll: f64,
) -> Matrix3<f64> {
    let cam_vec = radec_to_vector(camera.0, camera.1);
    let tel_vec = radec_to_vector(telescope.0, telescope.1);
    let align = rotation_between_vectors(&cam_vec, &tel_vec);
    let roll = rotate_about_vector(&tel_vec, camera_roll);
    align * roll
}

/// Apply a calibration rotation to a solved (ra, dec), then correct for roll
/// about the rotated axis. Returns (ra mod 360, dec) in degrees.
pub fn apply_rotation(
    rotation: &Matrix3<f64>,
    ra: f64,
    dec: f64,
    roll: f64,
) -> (f64, f64) {
    let rotated = rotation * radec_to_vector(ra, dec);
    let roll_correct = rotate_about_vector(&rotated, roll);
    vector_to_radec(&(roll_correct * rotated))
}

/// Great-circle separation between two ra/dec pairs, in degrees.
pub fn haversine_dist(
    current_ra: f64,
    current_dec: f64,
    target_ra: f64,
    target_dec: f64,
) -> f64 {
    let dec1 = current_dec.to_radians();
    let dec2 = target_dec.to_radians();
    let mut delta_ra = (target_ra - current_ra).to_radians();
    delta_ra = delta_ra.sin().atan2(delta_ra.cos()); // Wrap to -pi..pi.
    let delta_dec = dec2 - dec1;

    let a = (delta_dec / 2.0).sin().powi(2)
        + dec1.cos() * dec2.cos() * (delta_ra / 2.0).sin().powi(2);
    (2.0 * a.sqrt().clamp(0.0, 1.0).asin()).to_degrees()
}

/// Offsets to the target as seen in the rolled camera frame: how far north
/// and how far east (degrees), with the east term scaled by cos(dec) for
/// meridian convergence. `roll` is the current image roll; the deltas are
/// rotated by its opposite so they line up with the eyepiece view.
pub fn distance_north_east(
    current: (f64, f64),
    target: (f64, f64),
    roll: f64,
) -> (f64, f64) {
    let mut delta_ra = (target.0 - current.0).to_radians();
    delta_ra = delta_ra.sin().atan2(delta_ra.cos());

    let north_raw = (target.1 - current.1).to_radians();
    let east_raw = delta_ra * current.1.to_radians().cos();

    let roll_rad = (-roll).to_radians();
    let (sin_roll, cos_roll) = roll_rad.sin_cos();
    let north = cos_roll * north_raw - sin_roll * east_raw;
    let east = sin_roll * north_raw + cos_roll * east_raw;
    (north.to_degrees(), east.to_degrees())
}

/// Coarse verbal bucket for an angular offset, used by the Directions screen.
pub fn distance_descriptor(dist: f64) -> &'static str {
    let dist = dist.abs();
    if dist < 1.0 {
        "nearby"
    } else if dist < 20.0 {
        "close"
    } else if dist < 80.0 {
        "far"
    } else {
        "distant"
    }
}

/// Advance (ra, dec) by sidereal drift over `dt_seconds`. Declination is
/// unchanged; ra stays in 0..360. At the poles cos(dec)=0 and the position
/// is fixed.
pub fn sky_drift(ra: f64, dec: f64, dt_seconds: f64) -> (f64, f64) {
    let ra_offset = 15.0 * dec.to_radians().cos() * dt_seconds / 3600.0;
    ((ra + ra_offset).rem_euclid(360.0), dec)
}

fn greenwich_mean_sidereal_time(time: &SystemTime) -> f64 {
    let dt_utc = DateTime::<Utc>::from(*time);
    let date = Date {
        year: dt_utc.date_naive().year() as i16,
        month: dt_utc.date_naive().month() as u8,
        decimal_day: dt_utc.date_naive().day() as f64,
        cal_type: CalType::Gregorian,
    };
    let jd = julian_day(&date);
    let utc_hours = dt_utc.time().num_seconds_from_midnight() as f64 / 3600.0;
    let gmst_hours = mn_sidr(jd).to_degrees() / 15.0 + utc_hours * 1.00273790935;
    limit_to_two_PI((gmst_hours * 15.0).to_radians())
}

/// ICRS (ra, dec) to local (alt, az), all in degrees. Azimuth is clockwise
/// from north.
pub fn radec_to_altaz(
    ra: f64,
    dec: f64,
    time: &SystemTime,
    location: &ObserverLocation,
) -> (f64, f64) {
    let lat = location.latitude.to_radians();
    let long = location.longitude.to_radians();
    let gmst = greenwich_mean_sidereal_time(time);
    // astro::coords::hr_angl_frm_observer_long() has a bug; the correct
    // relation is trivial.
    let hour_angle = gmst + long - ra.to_radians();

    let dec_rad = dec.to_radians();
    // Meeus azimuth is measured from south; shift to clockwise-from-north.
    let az = limit_to_two_PI(az_frm_eq(hour_angle, dec_rad, lat) + PI);
    let alt = alt_frm_eq(hour_angle, dec_rad, lat);
    (alt.to_degrees(), az.to_degrees())
}

/// Local (alt, az) back to ICRS (ra, dec), all in degrees.
pub fn altaz_to_radec(
    alt: f64,
    az: f64,
    time: &SystemTime,
    location: &ObserverLocation,
) -> (f64, f64) {
    let lat = location.latitude.to_radians();
    let long = location.longitude.to_radians();
    let alt_rad = alt.to_radians();
    let meeus_az = limit_to_two_PI(az.to_radians() - PI);
    let gmst = greenwich_mean_sidereal_time(time);

    // astro::coords::dec_frm_hz() is incorrect.
    let dec = (lat.sin() * alt_rad.sin()
        - lat.cos() * alt_rad.cos() * meeus_az.cos())
    .asin();
    let hour_angle = hr_angl_frm_hz(meeus_az, alt_rad, lat);
    let ra = limit_to_two_PI(gmst + long - hour_angle);
    (ra.to_degrees(), dec.to_degrees())
}

/// Rotate 2-d plane coordinates by `angle_deg` counter-clockwise.
pub fn rotate_xy(x: f64, y: f64, angle_deg: f64) -> (f64, f64) {
    let (sin_a, cos_a) = angle_deg.to_radians().sin_cos();
    (x * cos_a - y * sin_a, x * sin_a + y * cos_a)
}

/// An object projected onto the unit view disk.
#[derive(Clone, Copy, Debug)]
pub struct ProjectedPoint {
    /// Normalized view-plane position; on the disk, x^2 + y^2 <= 1.
    pub x: f64,
    pub y: f64,
    /// Angular distance from the view center, degrees.
    pub separation: f64,
}

/// Gnomonic projection of (ra, dec) into the unit disk centered at
/// (center_ra, center_dec) with angular radius `radius_deg` and view rotation
/// `rotation` degrees. Returns None for objects behind the tangent plane,
/// beyond the radius, outside the disk, or yielding a non-finite result.
pub fn project_to_view(
    ra: f64,
    dec: f64,
    center_ra: f64,
    center_dec: f64,
    radius_deg: f64,
    rotation: f64,
) -> Option<ProjectedPoint> {
    let point = project_point(ra, dec, center_ra, center_dec, radius_deg, rotation)?;
    if point.separation > radius_deg {
        return None;
    }
    if point.x * point.x + point.y * point.y > 1.0 {
        return None;
    }
    Some(point)
}

/// As project_to_view() but without the field-radius and disk culls. The
/// navigation overlay uses this to aim its direction arrow at targets well
/// outside the field.
pub fn project_point(
    ra: f64,
    dec: f64,
    center_ra: f64,
    center_dec: f64,
    radius_deg: f64,
    rotation: f64,
) -> Option<ProjectedPoint> {
    let ra0 = center_ra.to_radians();
    let dec0 = center_dec.to_radians();
    let ra = ra.to_radians();
    let dec = dec.to_radians();

    // Wrap to -pi..pi so fields straddling ra=0 project correctly.
    let mut delta_ra = ra - ra0;
    delta_ra = delta_ra.sin().atan2(delta_ra.cos());

    let cos_c =
        dec0.sin() * dec.sin() + dec0.cos() * dec.cos() * delta_ra.cos();
    if cos_c <= 0.0 {
        return None; // Behind the tangent plane.
    }
    let separation = cos_c.clamp(-1.0, 1.0).acos().to_degrees();

    let denom = cos_c.clamp(1e-12, 1.0);
    let x = -dec.cos() * delta_ra.sin() / denom;
    let y = (dec0.cos() * dec.sin() - dec0.sin() * dec.cos() * delta_ra.cos())
        / denom;
    let (x, y) = rotate_xy(x, y, rotation);

    let radius_rad = radius_deg.to_radians();
    let x_norm = x / radius_rad;
    let y_norm = y / radius_rad;
    if !x_norm.is_finite() || !y_norm.is_finite() {
        return None;
    }
    Some(ProjectedPoint { x: x_norm, y: y_norm, separation })
}
