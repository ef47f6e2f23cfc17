// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashSet;
use std::sync::Arc;

use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_hollow_circle_mut, draw_line_segment_mut,
};

use crate::astro_util::{
    distance_north_east, haversine_dist, project_point, project_to_view,
};
use crate::catalog::Catalog;
use crate::context::{CelestialObject, ObservationContext};
use crate::ephemeris::CachedEphemeris;
use crate::render::{ScreenPainter, COLOR_WHITE, SCREEN_SIZE};

const FIELD_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const STAR_LABEL_COLOR: Rgb<u8> = Rgb([255, 165, 0]);
const PLANET_COLOR: Rgb<u8> = Rgb([0, 255, 255]);
const SUN_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const PLANET_LABEL_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TARGET_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const ARROW_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// How the navigation target is drawn relative to the field of view.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TargetOverlay {
    /// Target inside the field: crosshair at its normalized position.
    Crosshair { x: f64, y: f64 },
    /// Target outside the field: unit direction from center toward it.
    Arrow { dx: f64, dy: f64 },
}

/// Decides the overlay for a target given the current pointing. Returns the
/// overlay and the target's angular separation in degrees. A target sitting
/// exactly on the field boundary counts as inside.
pub fn target_overlay(
    current: (f64, f64),
    roll: f64,
    target: (f64, f64),
    field_radius: f64,
) -> (TargetOverlay, f64) {
    if let Some(point) = project_point(
        target.0,
        target.1,
        current.0,
        current.1,
        field_radius,
        roll,
    ) {
        if point.separation <= field_radius {
            return (
                TargetOverlay::Crosshair { x: point.x, y: point.y },
                point.separation,
            );
        }
        let length = point.x.hypot(point.y);
        if length > 0.0 {
            return (
                TargetOverlay::Arrow {
                    dx: point.x / length,
                    dy: point.y / length,
                },
                point.separation,
            );
        }
    }
    // Behind the tangent plane; aim the arrow from the on-sky offsets.
    let separation =
        haversine_dist(current.0, current.1, target.0, target.1);
    let (north, east) = distance_north_east(current, target, roll);
    let length = north.hypot(east).max(1e-12);
    ((TargetOverlay::Arrow { dx: -east / length, dy: north / length }),
     separation)
}

fn to_pixel(x_norm: f64, y_norm: f64) -> (f64, f64) {
    let half = SCREEN_SIZE as f64 / 2.0;
    // The raster's y axis grows downward.
    (half + x_norm * half, half - y_norm * half)
}

// Matplotlib-era marker sizing carried over: bright stars get big disks,
// zooming in shrinks them.
fn star_marker_radius(magnitude: f64, zoom: f64) -> i32 {
    let size = (25.0 - magnitude * 2.0).clamp(1.0, 15.0);
    let zoom_scale = if zoom == 1.0 {
        1.0
    } else if zoom < 1.0 {
        zoom * 2.0
    } else {
        zoom / 2.0
    };
    ((size / zoom_scale) / 2.0).round().max(1.0) as i32
}

/// Renders the visible sky around the current pointing into a square raster
/// with the navigation overlay on top.
pub struct StarfieldRenderer {
    catalog: Arc<Catalog>,
    ephemeris: Arc<CachedEphemeris>,
    context: Arc<ObservationContext>,
    painter: Arc<ScreenPainter>,
}

impl StarfieldRenderer {
    pub fn new(
        catalog: Arc<Catalog>,
        ephemeris: Arc<CachedEphemeris>,
        context: Arc<ObservationContext>,
        painter: Arc<ScreenPainter>,
    ) -> Self {
        StarfieldRenderer { catalog, ephemeris, context, painter }
    }

    /// Renders the field. Returns the raster plus the target's angular
    /// separation in degrees (0 when no target is set). None until the
    /// first solve.
    pub fn render(&self) -> Option<(RgbImage, f64)> {
        let (ra, dec, roll) = self.context.pointing()?;
        let (radius, mag_limit, zoom) = {
            let optics = self.context.optics.lock().unwrap();
            (optics.field_radius(), optics.limiting_magnitude(), optics.zoom)
        };
        let (time, location) = {
            let environment = self.context.environment.lock().unwrap();
            (environment.time, environment.location)
        };
        let target = self.context.target.lock().unwrap().position();

        let mut nearby =
            self.catalog.search_by_coordinate(ra, dec, radius, mag_limit);
        nearby.extend(self.ephemeris.bodies_in_fov(
            ra, dec, radius, time, &location,
        ));

        let mut image = self.render_view(&nearby, ra, dec, roll, radius, zoom);

        let mut separation = 0.0;
        if let Some(target) = target {
            let (overlay, sep) =
                target_overlay((ra, dec), roll, target, radius);
            separation = sep;
            self.draw_overlay(&mut image, overlay);
        }
        Some((image, separation))
    }

    fn render_view(
        &self,
        objects: &[CelestialObject],
        center_ra: f64,
        center_dec: f64,
        roll: f64,
        radius: f64,
        zoom: f64,
    ) -> RgbImage {
        let mut image = self.painter.blank();
        let half = SCREEN_SIZE as i32 / 2;
        draw_hollow_circle_mut(
            &mut image,
            (half, half),
            half - 1,
            FIELD_COLOR,
        );
        // Cardinal marks; the gnomonic x axis runs east-to-west.
        self.painter.text(&mut image, 2, half - 8, 14.0, COLOR_WHITE, "E");
        self.painter.text(
            &mut image,
            SCREEN_SIZE as i32 - 12,
            half - 8,
            14.0,
            COLOR_WHITE,
            "W",
        );

        let mut labeled_cells: HashSet<(i64, i64)> = HashSet::new();
        for object in objects {
            let Some(point) = project_to_view(
                object.ra, object.dec, center_ra, center_dec, radius, roll,
            ) else {
                continue; // Out of field or projection out of domain.
            };
            let (px, py) = to_pixel(point.x, point.y);
            let (px_i, py_i) = (px.round() as i32, py.round() as i32);

            let label_cell =
                (((point.x + 0.03) * 10.0).round() as i64,
                 (point.y * 10.0).round() as i64);
            if object.is_solar_system() {
                let color = if object.name.eq_ignore_ascii_case("sun") {
                    SUN_COLOR
                } else {
                    PLANET_COLOR
                };
                let radius_px =
                    ((20.0 - object.magnitude).max(8.0) / 2.0) as i32;
                draw_filled_circle_mut(
                    &mut image,
                    (px_i, py_i),
                    radius_px,
                    color,
                );
                draw_hollow_circle_mut(
                    &mut image,
                    (px_i, py_i),
                    radius_px + 1,
                    COLOR_WHITE,
                );
                // Planets are always labeled.
                if labeled_cells.insert(label_cell) {
                    self.painter.text(
                        &mut image,
                        px_i + radius_px + 4,
                        py_i - 6,
                        12.0,
                        PLANET_LABEL_COLOR,
                        &object.name,
                    );
                }
            } else {
                let radius_px = star_marker_radius(object.magnitude, zoom);
                draw_filled_circle_mut(
                    &mut image,
                    (px_i, py_i),
                    radius_px,
                    COLOR_WHITE,
                );
                // One label per grid cell keeps dense fields readable.
                if object.magnitude < 6.0
                    && !object.name.is_empty()
                    && labeled_cells.insert(label_cell)
                {
                    self.painter.text(
                        &mut image,
                        px_i + radius_px + 4,
                        py_i - 6,
                        12.0,
                        STAR_LABEL_COLOR,
                        &object.name,
                    );
                }
            }
        }
        image
    }

    fn draw_overlay(&self, image: &mut RgbImage, overlay: TargetOverlay) {
        let half = SCREEN_SIZE as f64 / 2.0;
        match overlay {
            TargetOverlay::Crosshair { x, y } => {
                let (px, py) = to_pixel(x, y);
                let (px_i, py_i) = (px.round() as i32, py.round() as i32);
                draw_hollow_circle_mut(image, (px_i, py_i), 8, TARGET_COLOR);
                draw_line_segment_mut(
                    image,
                    (px as f32 - 15.0, py as f32),
                    (px as f32 + 15.0, py as f32),
                    TARGET_COLOR,
                );
                draw_line_segment_mut(
                    image,
                    (px as f32, py as f32 - 15.0),
                    (px as f32, py as f32 + 15.0),
                    TARGET_COLOR,
                );
            }
            TargetOverlay::Arrow { dx, dy } => {
                let arrow_len = half - 10.0;
                let end_x = half + dx * arrow_len;
                let end_y = half - dy * arrow_len;
                draw_line_segment_mut(
                    image,
                    (half as f32, half as f32),
                    (end_x as f32, end_y as f32),
                    ARROW_COLOR,
                );
                draw_filled_circle_mut(
                    image,
                    (end_x.round() as i32, end_y.round() as i32),
                    5,
                    ARROW_COLOR,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use std::io::Write;

    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::astro_util::ObserverLocation;
    use crate::ephemeris::Ephemeris;
    use crate::render::load_font;

    #[test]
    fn test_target_on_boundary_is_inside() {
        let current = (200.0, 55.0);
        // One field radius due north of center.
        let radius = 0.5;
        let (overlay, separation) =
            target_overlay(current, 0.0, (200.0, 55.0 + radius), radius);
        assert_abs_diff_eq!(separation, radius, epsilon = 1e-9);
        assert!(matches!(overlay, TargetOverlay::Crosshair { .. }));
    }

    #[test]
    fn test_target_outside_field_is_arrow() {
        // Ten degrees of ra at dec 55: well past a half-degree field.
        let (overlay, separation) =
            target_overlay((200.0, 55.0), 0.0, (210.0, 55.0), 0.5);
        assert_abs_diff_eq!(separation, 5.73, epsilon = 0.05);
        match overlay {
            TargetOverlay::Arrow { dx, dy } => {
                // Toward +ra means east, which is the view's -x side.
                assert!(dx < 0.0, "dx = {}", dx);
                assert!(dy.abs() < 0.5);
            }
            other => panic!("expected arrow, got {:?}", other),
        }
    }

    #[test]
    fn test_target_behind_tangent_plane_still_gets_arrow() {
        let (overlay, separation) =
            target_overlay((200.0, 10.0), 0.0, (20.0, -10.0), 0.5);
        assert!(separation > 90.0);
        assert!(matches!(overlay, TargetOverlay::Arrow { .. }));
    }

    struct EmptyEphemeris;
    impl Ephemeris for EmptyEphemeris {
        fn position(
            &self,
            _body: &str,
            _time: std::time::SystemTime,
            _location: &ObserverLocation,
        ) -> Result<(f64, f64), canonical_error::CanonicalError> {
            Err(canonical_error::not_found_error("none"))
        }
        fn body_names(&self) -> Vec<&'static str> {
            vec![]
        }
    }

    fn test_renderer() -> (StarfieldRenderer, Arc<ObservationContext>) {
        static NEXT_ID: std::sync::atomic::AtomicU32 =
            std::sync::atomic::AtomicU32::new(0);
        let unique = NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "astroflo_starfield_{}_{}.csv",
            std::process::id(),
            unique
        ));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "id,name,ra_deg,dec_deg,v_mag,kind").unwrap();
            writeln!(file, "HIP91262,Vega,279.2437,38.7861,0.03,star")
                .unwrap();
        }
        let catalog = Arc::new(Catalog::load(&path).unwrap());
        std::fs::remove_file(&path).unwrap();

        let context = Arc::new(ObservationContext::new(ObserverLocation {
            latitude: 43.1566,
            longitude: -77.6088,
            elevation: 150.0,
        }));
        let renderer = StarfieldRenderer::new(
            catalog,
            Arc::new(CachedEphemeris::new(Arc::new(EmptyEphemeris))),
            context.clone(),
            Arc::new(ScreenPainter::new(load_font())),
        );
        (renderer, context)
    }

    #[test]
    fn test_render_requires_a_solve() {
        let (renderer, _context) = test_renderer();
        assert!(renderer.render().is_none());
    }

    #[test]
    fn test_render_draws_centered_star() {
        let (renderer, context) = test_renderer();
        context.telescope.lock().unwrap().position =
            Some((279.2437, 38.7861));
        let (image, separation) = renderer.render().unwrap();
        assert_eq!(separation, 0.0);
        assert_eq!(image.dimensions(), (SCREEN_SIZE, SCREEN_SIZE));
        // Vega sits at the view center as a white disk.
        let center = SCREEN_SIZE / 2;
        assert_eq!(*image.get_pixel(center, center), COLOR_WHITE);
    }

    #[test]
    fn test_render_reports_target_separation() {
        let (renderer, context) = test_renderer();
        context.telescope.lock().unwrap().position = Some((200.0, 55.0));
        context.target.lock().unwrap().set_target(210.0, 55.0, "far off");
        let (_image, separation) = renderer.render().unwrap();
        assert_abs_diff_eq!(separation, 5.73, epsilon = 0.05);
    }

    #[test]
    fn test_star_marker_radius() {
        // Brighter stars draw bigger, faint stars bottom out at one pixel.
        assert!(star_marker_radius(0.0, 1.0) > star_marker_radius(4.0, 1.0));
        assert_eq!(star_marker_radius(12.0, 1.0), 1);
        // Zooming in shrinks markers.
        assert!(star_marker_radius(0.0, 4.0) < star_marker_radius(0.0, 1.0));
    }

    #[test]
    fn test_overlay_pixels() {
        let (renderer, context) = test_renderer();
        context.telescope.lock().unwrap().position = Some((200.0, 55.0));
        // Target just north of center, well inside the field radius.
        context
            .target
            .lock()
            .unwrap()
            .set_target(200.0, 55.05, "nearby");
        let (image, _sep) = renderer.render().unwrap();
        // The crosshair's horizontal bar crosses the target's pixel row.
        let found_green = image
            .pixels()
            .any(|pixel| *pixel == TARGET_COLOR);
        assert!(found_green);
    }
}
