// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use astro::coords::{asc_frm_ecl, dec_frm_ecl};
use astro::ecliptic::mn_oblq_IAU;
use astro::planet::{self, Planet};
use astro::time::{julian_day, CalType, Date};
use chrono::{DateTime, Datelike, Timelike, Utc};
use canonical_error::{not_found_error, CanonicalError};
use log::warn;

use crate::astro_util::{haversine_dist, ObserverLocation};
use crate::context::{CelestialObject, ObjectKind};

/// Positions are cached for this long; a clock warp larger than this in
/// either direction also discards the cache.
pub const EPHEMERIS_CACHE_TTL: Duration = Duration::from_secs(3);

/// Solar-system position oracle. Returns geocentric apparent (ra, dec) in
/// degrees for a named body.
pub trait Ephemeris: Send + Sync {
    fn position(
        &self,
        body: &str,
        time: SystemTime,
        location: &ObserverLocation,
    ) -> Result<(f64, f64), CanonicalError>;

    /// Bodies this provider can answer for.
    fn body_names(&self) -> Vec<&'static str>;
}

/// Fixed visual magnitudes, adequate for marker sizing on a finder display.
pub fn body_magnitude(body: &str) -> f64 {
    match body.to_uppercase().as_str() {
        "MERCURY" => 0.0,
        "VENUS" => -4.0,
        "MARS" => 0.5,
        "JUPITER" => -2.5,
        "SATURN" => 0.5,
        "URANUS" => 5.5,
        "NEPTUNE" => 8.0,
        "SUN" => -26.8,
        "MOON" => -12.6,
        _ => 7.0,
    }
}

const BODY_NAMES: [&str; 9] = [
    "MERCURY", "VENUS", "MARS", "JUPITER", "SATURN", "URANUS", "NEPTUNE",
    "SUN", "MOON",
];

/// Ephemeris over the `astro` crate: VSOP87 heliocentric planet positions
/// differenced against Earth's, plus the solar and lunar geocentric series.
pub struct AstroEphemeris;

impl AstroEphemeris {
    pub fn new() -> Self {
        AstroEphemeris
    }

    fn planet_for_name(body: &str) -> Option<Planet> {
        match body {
            "MERCURY" => Some(Planet::Mercury),
            "VENUS" => Some(Planet::Venus),
            "MARS" => Some(Planet::Mars),
            "JUPITER" => Some(Planet::Jupiter),
            "SATURN" => Some(Planet::Saturn),
            "URANUS" => Some(Planet::Uranus),
            "NEPTUNE" => Some(Planet::Neptune),
            _ => None,
        }
    }

    // Geocentric ecliptic (long, lat) radians of a planet: heliocentric
    // rectangular coordinates of planet minus Earth.
    fn planet_geocent_ecl(planet: &Planet, jd: f64) -> (f64, f64) {
        let (earth_l, earth_b, earth_r) =
            planet::heliocent_coords(&Planet::Earth, jd);
        let (l, b, r) = planet::heliocent_coords(planet, jd);

        let (ex, ey, ez) = ecl_to_rect(earth_l, earth_b, earth_r);
        let (px, py, pz) = ecl_to_rect(l, b, r);
        let (x, y, z) = (px - ex, py - ey, pz - ez);

        let long = y.atan2(x);
        let lat = z.atan2(x.hypot(y));
        (long, lat)
    }
}

impl Default for AstroEphemeris {
    fn default() -> Self {
        Self::new()
    }
}

fn ecl_to_rect(long: f64, lat: f64, r: f64) -> (f64, f64, f64) {
    (
        r * lat.cos() * long.cos(),
        r * lat.cos() * long.sin(),
        r * lat.sin(),
    )
}

fn julian_day_from_system_time(time: &SystemTime) -> f64 {
    let dt_utc = DateTime::<Utc>::from(*time);
    let day_fraction =
        dt_utc.time().num_seconds_from_midnight() as f64 / 86400.0;
    let date = Date {
        year: dt_utc.date_naive().year() as i16,
        month: dt_utc.date_naive().month() as u8,
        decimal_day: dt_utc.date_naive().day() as f64 + day_fraction,
        cal_type: CalType::Gregorian,
    };
    julian_day(&date)
}

fn ecl_to_radec(long: f64, lat: f64, jd: f64) -> (f64, f64) {
    let oblq = mn_oblq_IAU(jd);
    let ra = asc_frm_ecl(long, lat, oblq).to_degrees().rem_euclid(360.0);
    let dec = dec_frm_ecl(long, lat, oblq).to_degrees();
    (ra, dec)
}

impl Ephemeris for AstroEphemeris {
    fn position(
        &self,
        body: &str,
        time: SystemTime,
        _location: &ObserverLocation,
    ) -> Result<(f64, f64), CanonicalError> {
        let jd = julian_day_from_system_time(&time);
        let body = body.trim().to_uppercase();
        let (long, lat) = match body.as_str() {
            "SUN" => {
                let (point, _rad_vec) = astro::sun::geocent_ecl_pos(jd);
                (point.long, point.lat)
            }
            "MOON" => {
                let (point, _rad_vec) = astro::lunar::geocent_ecl_pos(jd);
                (point.long, point.lat)
            }
            name => match Self::planet_for_name(name) {
                Some(planet) => Self::planet_geocent_ecl(&planet, jd),
                None => {
                    return Err(not_found_error(
                        format!("no ephemeris for body '{}'", name).as_str(),
                    ));
                }
            },
        };
        Ok(ecl_to_radec(long, lat, jd))
    }

    fn body_names(&self) -> Vec<&'static str> {
        BODY_NAMES.to_vec()
    }
}

struct CacheEntry {
    positions: Vec<CelestialObject>,
    time: SystemTime,
}

/// TTL cache in front of an Ephemeris. The pipeline and renderer query at
/// frame rate; positions move far slower than that.
pub struct CachedEphemeris {
    inner: Arc<dyn Ephemeris>,
    cache: Mutex<Option<CacheEntry>>,
}

impl CachedEphemeris {
    pub fn new(inner: Arc<dyn Ephemeris>) -> Self {
        CachedEphemeris { inner, cache: Mutex::new(None) }
    }

    pub fn position(
        &self,
        body: &str,
        time: SystemTime,
        location: &ObserverLocation,
    ) -> Result<(f64, f64), CanonicalError> {
        self.inner.position(body, time, location)
    }

    pub fn body_names(&self) -> Vec<&'static str> {
        self.inner.body_names()
    }

    /// All bodies' current positions, served from cache while fresh.
    pub fn current_positions(
        &self,
        time: SystemTime,
        location: &ObserverLocation,
    ) -> Vec<CelestialObject> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.as_ref() {
                if time_delta(entry.time, time) <= EPHEMERIS_CACHE_TTL {
                    return entry.positions.clone();
                }
            }
        }

        let mut positions = Vec::new();
        for body in self.inner.body_names() {
            match self.inner.position(body, time, location) {
                Ok((ra, dec)) => positions.push(CelestialObject {
                    name: body.to_string(),
                    ra,
                    dec,
                    magnitude: body_magnitude(body),
                    kind: ObjectKind::Planet,
                    catalog_id: None,
                }),
                Err(e) => {
                    warn!("ephemeris lookup for {} failed: {:?}", body, e);
                }
            }
        }
        *self.cache.lock().unwrap() =
            Some(CacheEntry { positions: positions.clone(), time });
        positions
    }

    /// Bodies within `radius_deg` of (ra, dec).
    pub fn bodies_in_fov(
        &self,
        ra: f64,
        dec: f64,
        radius_deg: f64,
        time: SystemTime,
        location: &ObserverLocation,
    ) -> Vec<CelestialObject> {
        self.current_positions(time, location)
            .into_iter()
            .filter(|body| {
                haversine_dist(ra, dec, body.ra, body.dec) <= radius_deg
            })
            .collect()
    }
}

// Absolute difference between two timestamps; handles warps backwards.
fn time_delta(a: SystemTime, b: SystemTime) -> Duration {
    b.duration_since(a)
        .unwrap_or_else(|_| a.duration_since(b).unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn rochester() -> ObserverLocation {
        ObserverLocation {
            latitude: 43.1566,
            longitude: -77.6088,
            elevation: 150.0,
        }
    }

    // 2025-03-20 12:00 UTC, a few hours after the March equinox.
    fn equinox_time() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_742_472_000)
    }

    #[test]
    fn test_positions_are_in_domain() {
        let ephemeris = AstroEphemeris::new();
        for body in ephemeris.body_names() {
            let (ra, dec) = ephemeris
                .position(body, equinox_time(), &rochester())
                .unwrap();
            assert!((0.0..360.0).contains(&ra), "{}: ra {}", body, ra);
            assert!((-90.0..=90.0).contains(&dec), "{}: dec {}", body, dec);
        }
    }

    #[test]
    fn test_sun_near_equinox_point() {
        let ephemeris = AstroEphemeris::new();
        let (_ra, dec) = ephemeris
            .position("sun", equinox_time(), &rochester())
            .unwrap();
        // The sun crosses the celestial equator at the equinox.
        assert!(dec.abs() < 1.5, "sun dec = {}", dec);
    }

    #[test]
    fn test_unknown_body_is_not_found() {
        let ephemeris = AstroEphemeris::new();
        assert!(ephemeris
            .position("PLANET X", equinox_time(), &rochester())
            .is_err());
    }

    struct CountingEphemeris {
        calls: AtomicU32,
    }
    impl Ephemeris for CountingEphemeris {
        fn position(
            &self,
            _body: &str,
            _time: SystemTime,
            _location: &ObserverLocation,
        ) -> Result<(f64, f64), CanonicalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((180.0, 0.0))
        }
        fn body_names(&self) -> Vec<&'static str> {
            vec!["MARS"]
        }
    }

    #[test]
    fn test_cache_serves_within_ttl() {
        let inner = Arc::new(CountingEphemeris { calls: AtomicU32::new(0) });
        let cached = CachedEphemeris::new(inner.clone());
        let t0 = equinox_time();

        cached.current_positions(t0, &rochester());
        cached.current_positions(t0 + Duration::from_secs(1), &rochester());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        // Past the TTL: refreshed.
        cached.current_positions(t0 + Duration::from_secs(5), &rochester());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_invalidated_by_backwards_time_jump() {
        let inner = Arc::new(CountingEphemeris { calls: AtomicU32::new(0) });
        let cached = CachedEphemeris::new(inner.clone());
        let t0 = equinox_time();

        cached.current_positions(t0, &rochester());
        cached.current_positions(t0 - Duration::from_secs(60), &rochester());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_bodies_in_fov_filters_by_radius() {
        let inner = Arc::new(CountingEphemeris { calls: AtomicU32::new(0) });
        let cached = CachedEphemeris::new(inner);
        let t0 = equinox_time();
        assert_eq!(
            cached.bodies_in_fov(180.0, 0.5, 1.0, t0, &rochester()).len(),
            1
        );
        assert!(cached
            .bodies_in_fov(90.0, 0.0, 1.0, t0, &rochester())
            .is_empty());
    }
}
