// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use image::imageops::{crop_imm, resize, FilterType};
use image::{GrayImage, RgbImage};
use imageproc::drawing::draw_hollow_circle_mut;
use log::info;

use crate::analyzer::{find_brightest, Analyzer};
use crate::astro_util::{distance_descriptor, radec_to_altaz};
use crate::catalog::{filter_visible, Catalog};
use crate::context::{CatalogFilter, CelestialObject, ObservationContext};
use crate::ephemeris::CachedEphemeris;
use crate::pipeline::PipelineCounters;
use crate::render::{ScreenPainter, SCREEN_SIZE};
use crate::settings::SettingsStore;
use crate::starfield::StarfieldRenderer;
use crate::ui::{Button, ButtonEvent, ButtonPhase, Screen, ScreenState, UiState};

const AWAITING_SOLVE: &str = "Awaiting first solve...";
const AWAITING_IMAGE: &str = "Waiting for first image...";

/// Everything a screen might need. Each screen clones out only the handles
/// it actually uses.
pub struct UiDeps {
    pub context: Arc<ObservationContext>,
    pub catalog: Arc<Catalog>,
    pub ephemeris: Arc<CachedEphemeris>,
    pub starfield: Arc<StarfieldRenderer>,
    pub analyzer: Arc<Mutex<Analyzer>>,
    pub counters: Arc<PipelineCounters>,
    pub store: Arc<SettingsStore>,
    pub painter: Arc<ScreenPainter>,
}

/// Builds the full screen set with MainMenu current.
pub fn build_screens(deps: &UiDeps) -> UiState {
    let mut screens: HashMap<ScreenState, Box<dyn Screen>> = HashMap::new();
    screens.insert(
        ScreenState::MainMenu,
        Box::new(MainMenuScreen::new(deps.painter.clone())),
    );
    screens.insert(
        ScreenState::Focus,
        Box::new(FocusScreen::new(
            deps.painter.clone(),
            deps.context.clone(),
            deps.analyzer.clone(),
        )),
    );
    screens.insert(
        ScreenState::Alignment,
        Box::new(AlignmentScreen::new(
            deps.painter.clone(),
            deps.context.clone(),
            deps.store.clone(),
        )),
    );
    screens.insert(
        ScreenState::TargetList,
        Box::new(TargetListScreen::new(
            deps.painter.clone(),
            deps.context.clone(),
        )),
    );
    screens.insert(
        ScreenState::TargetSelect,
        Box::new(TargetSelectScreen::new(
            deps.painter.clone(),
            deps.context.clone(),
            deps.catalog.clone(),
            deps.ephemeris.clone(),
        )),
    );
    screens.insert(
        ScreenState::Navigation,
        Box::new(NavigationScreen::new(
            deps.painter.clone(),
            deps.context.clone(),
            deps.starfield.clone(),
        )),
    );
    screens.insert(
        ScreenState::Directions,
        Box::new(DirectionsScreen::new(
            deps.painter.clone(),
            deps.context.clone(),
        )),
    );
    screens.insert(
        ScreenState::Info,
        Box::new(InfoScreen::new(
            deps.painter.clone(),
            deps.context.clone(),
            deps.analyzer.clone(),
            deps.counters.clone(),
        )),
    );
    UiState::new(screens, ScreenState::MainMenu)
}

// Selection cursor with wraparound, shared by the menu-style screens.
fn step_selection(selected: usize, count: usize, forward: bool) -> usize {
    if count == 0 {
        return 0;
    }
    if forward {
        (selected + 1) % count
    } else {
        (selected + count - 1) % count
    }
}

fn gray_to_rgb(image: &GrayImage) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let v = image.get_pixel(x, y).0[0];
        image::Rgb([v, v, v])
    })
}

// Square crop centered near (x, y), clamped to the image bounds.
fn crop_around(image: &GrayImage, x: u32, y: u32, half: u32) -> GrayImage {
    let x0 = x.saturating_sub(half);
    let y0 = y.saturating_sub(half);
    let width = (2 * half).min(image.width() - x0.min(image.width() - 1));
    let height = (2 * half).min(image.height() - y0.min(image.height() - 1));
    crop_imm(image, x0, y0, width.max(1), height.max(1)).to_image()
}

struct MainMenuScreen {
    painter: Arc<ScreenPainter>,
    options: Vec<String>,
    selected: usize,
}

impl MainMenuScreen {
    fn new(painter: Arc<ScreenPainter>) -> Self {
        MainMenuScreen {
            painter,
            options: ["Focus", "Alignment", "Targets", "Navigate"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            selected: 0,
        }
    }
}

impl Screen for MainMenuScreen {
    fn handle(&mut self, event: ButtonEvent) -> Option<ScreenState> {
        if event.phase != ButtonPhase::Press {
            return None;
        }
        match event.button {
            Button::Up | Button::Right => {
                self.selected =
                    step_selection(self.selected, self.options.len(), false);
                None
            }
            Button::Down | Button::Left => {
                self.selected =
                    step_selection(self.selected, self.options.len(), true);
                None
            }
            Button::A => match self.selected {
                0 => Some(ScreenState::Focus),
                1 => Some(ScreenState::Alignment),
                2 => Some(ScreenState::TargetList),
                _ => Some(ScreenState::Navigation),
            },
            Button::B => Some(ScreenState::Info),
            _ => None,
        }
    }

    fn render(&mut self) -> RgbImage {
        self.painter.render_menu("~astroflo", &self.options, self.selected)
    }
}

struct FocusScreen {
    painter: Arc<ScreenPainter>,
    context: Arc<ObservationContext>,
    analyzer: Arc<Mutex<Analyzer>>,
}

impl FocusScreen {
    fn new(
        painter: Arc<ScreenPainter>,
        context: Arc<ObservationContext>,
        analyzer: Arc<Mutex<Analyzer>>,
    ) -> Self {
        FocusScreen { painter, context, analyzer }
    }
}

impl Screen for FocusScreen {
    fn handle(&mut self, event: ButtonEvent) -> Option<ScreenState> {
        if event.phase != ButtonPhase::Press {
            return None;
        }
        match event.button {
            Button::A => Some(ScreenState::Navigation),
            Button::B => Some(ScreenState::MainMenu),
            _ => None,
        }
    }

    fn render(&mut self) -> RgbImage {
        let Some(frame) = self.context.camera.lock().unwrap().latest_image()
        else {
            return self
                .painter
                .render_many_text(&[AWAITING_IMAGE.to_string()]);
        };
        let ((x, y), _value) = find_brightest(&frame.image);
        let crop = crop_around(&frame.image, x, y, 40);
        let zoomed = resize(
            &gray_to_rgb(&crop),
            SCREEN_SIZE,
            SCREEN_SIZE,
            FilterType::Nearest,
        );
        let (fwhm, best) = {
            let analyzer = self.analyzer.lock().unwrap();
            (analyzer.fwhm.latest(), analyzer.best_fwhm())
        };
        let top = match fwhm {
            Some(fwhm) => format!("FWHM: {:.2}", fwhm),
            None => "FWHM: --".to_string(),
        };
        let bottom = match best {
            Some(best) => format!("Best FWHM: {:.2}", best),
            None => String::new(),
        };
        self.painter.render_image_with_caption(&zoomed, &top, &bottom)
    }
}

struct AlignmentScreen {
    painter: Arc<ScreenPainter>,
    context: Arc<ObservationContext>,
    store: Arc<SettingsStore>,
    // Working copy of the solver's target pixel, (col=x, row=y).
    current_target: Option<(f64, f64)>,
}

impl AlignmentScreen {
    fn new(
        painter: Arc<ScreenPainter>,
        context: Arc<ObservationContext>,
        store: Arc<SettingsStore>,
    ) -> Self {
        AlignmentScreen { painter, context, store, current_target: None }
    }

    fn nudge(&mut self, dx: f64, dy: f64) {
        if let Some((x, y)) = self.current_target {
            self.current_target = Some((x + dx, y + dy));
        }
    }

    fn save(&mut self) {
        let Some(target) = self.current_target else {
            return;
        };
        self.context.solver.lock().unwrap().target_pixel = Some(target);
        let mut calibration = self.store.load_calibration();
        calibration.target_pixel = Some(target);
        self.store.save_calibration(&calibration);
        info!("target pixel set to ({:.0}, {:.0})", target.0, target.1);
    }
}

impl Screen for AlignmentScreen {
    fn enter(&mut self) {
        self.current_target =
            self.context.solver.lock().unwrap().target_pixel;
    }

    fn handle(&mut self, event: ButtonEvent) -> Option<ScreenState> {
        match (event.button, event.phase) {
            // Nudges repeat while the button is held.
            (Button::Up, ButtonPhase::Press | ButtonPhase::Hold) => {
                self.nudge(0.0, -1.0);
                None
            }
            (Button::Down, ButtonPhase::Press | ButtonPhase::Hold) => {
                self.nudge(0.0, 1.0);
                None
            }
            (Button::Left, ButtonPhase::Press | ButtonPhase::Hold) => {
                self.nudge(-1.0, 0.0);
                None
            }
            (Button::Right, ButtonPhase::Press | ButtonPhase::Hold) => {
                self.nudge(1.0, 0.0);
                None
            }
            (Button::A, ButtonPhase::Press) => {
                self.save();
                Some(ScreenState::Navigation)
            }
            (Button::B, ButtonPhase::Press) => Some(ScreenState::MainMenu),
            _ => None,
        }
    }

    fn render(&mut self) -> RgbImage {
        let Some(frame) = self.context.camera.lock().unwrap().latest_image()
        else {
            return self
                .painter
                .render_many_text(&[AWAITING_IMAGE.to_string()]);
        };
        let image = &frame.image;
        if self.current_target.is_none() {
            // Seed the marker on the brightest star in view.
            let ((x, y), _value) = find_brightest(image);
            self.current_target = Some((x as f64, y as f64));
        }
        let (x, y) = self.current_target.unwrap();
        let x = x.clamp(0.0, (image.width() - 1) as f64);
        let y = y.clamp(0.0, (image.height() - 1) as f64);
        self.current_target = Some((x, y));

        let mut marked = gray_to_rgb(image);
        draw_hollow_circle_mut(
            &mut marked,
            (x as i32, y as i32),
            10,
            image::Rgb([0, 100, 255]),
        );
        let scaled =
            resize(&marked, SCREEN_SIZE, SCREEN_SIZE, FilterType::Nearest);
        self.painter.render_image_with_caption(
            &scaled,
            "Alignment",
            &format!("target ({:.0}, {:.0})", x, y),
        )
    }
}

struct TargetListScreen {
    painter: Arc<ScreenPainter>,
    context: Arc<ObservationContext>,
    options: Vec<String>,
    selected: usize,
}

impl TargetListScreen {
    fn new(
        painter: Arc<ScreenPainter>,
        context: Arc<ObservationContext>,
    ) -> Self {
        TargetListScreen {
            painter,
            context,
            options: ["Bright Stars", "Messier", "Solar System"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            selected: 0,
        }
    }
}

impl Screen for TargetListScreen {
    fn handle(&mut self, event: ButtonEvent) -> Option<ScreenState> {
        if event.phase != ButtonPhase::Press {
            return None;
        }
        match event.button {
            Button::Up | Button::Right => {
                self.selected =
                    step_selection(self.selected, self.options.len(), false);
                None
            }
            Button::Down | Button::Left => {
                self.selected =
                    step_selection(self.selected, self.options.len(), true);
                None
            }
            Button::A => {
                let filter = match self.selected {
                    0 => CatalogFilter::Stars,
                    1 => CatalogFilter::Dsos,
                    _ => CatalogFilter::SolarSystem,
                };
                self.context.target.lock().unwrap().catalog_filter = filter;
                Some(ScreenState::TargetSelect)
            }
            Button::B => Some(ScreenState::MainMenu),
            _ => None,
        }
    }

    fn render(&mut self) -> RgbImage {
        self.painter.render_menu("Catalog?", &self.options, self.selected)
    }
}

struct TargetSelectScreen {
    painter: Arc<ScreenPainter>,
    context: Arc<ObservationContext>,
    catalog: Arc<Catalog>,
    ephemeris: Arc<CachedEphemeris>,
    options: Vec<CelestialObject>,
    selected: usize,
    mag_limit: f64,
}

impl TargetSelectScreen {
    fn new(
        painter: Arc<ScreenPainter>,
        context: Arc<ObservationContext>,
        catalog: Arc<Catalog>,
        ephemeris: Arc<CachedEphemeris>,
    ) -> Self {
        TargetSelectScreen {
            painter,
            context,
            catalog,
            ephemeris,
            options: Vec::new(),
            selected: 0,
            mag_limit: 4.0,
        }
    }

    fn build_options(&mut self) {
        let filter = self.context.target.lock().unwrap().catalog_filter;
        let environment =
            self.context.environment.lock().unwrap().clone();
        let candidates = match filter {
            CatalogFilter::Stars => self.catalog.bright_stars(self.mag_limit),
            CatalogFilter::Dsos => self.catalog.dsos(self.mag_limit),
            CatalogFilter::SolarSystem => self.ephemeris.current_positions(
                environment.time,
                &environment.location,
            ),
        };
        self.options = filter_visible(candidates, &environment);
        if self.selected >= self.options.len() {
            self.selected = 0;
        }
    }
}

impl Screen for TargetSelectScreen {
    fn enter(&mut self) {
        self.build_options();
    }

    fn handle(&mut self, event: ButtonEvent) -> Option<ScreenState> {
        if event.phase != ButtonPhase::Press {
            return None;
        }
        match event.button {
            Button::Right => {
                self.selected =
                    step_selection(self.selected, self.options.len(), false);
                None
            }
            Button::Left => {
                self.selected =
                    step_selection(self.selected, self.options.len(), true);
                None
            }
            Button::Up => {
                self.mag_limit = (self.mag_limit - 0.5).max(0.0);
                self.build_options();
                None
            }
            Button::Down => {
                self.mag_limit = (self.mag_limit + 0.5).min(10.0);
                self.build_options();
                None
            }
            Button::A => {
                let object = self.options.get(self.selected)?;
                self.context.target.lock().unwrap().set_target(
                    object.ra,
                    object.dec,
                    &object.name,
                );
                info!(
                    "target set to {} at ({:.4}, {:.4})",
                    object.name, object.ra, object.dec
                );
                Some(ScreenState::Navigation)
            }
            Button::B => Some(ScreenState::MainMenu),
            _ => None,
        }
    }

    fn render(&mut self) -> RgbImage {
        let filter = self.context.target.lock().unwrap().catalog_filter;
        let title = if filter == CatalogFilter::SolarSystem {
            "Target?".to_string()
        } else {
            format!("<{} Target?", self.mag_limit)
        };
        let names: Vec<String> =
            self.options.iter().map(|o| o.name.clone()).collect();
        if names.is_empty() {
            return self
                .painter
                .render_many_text(&["Nothing visible.".to_string()]);
        }
        self.painter.render_menu(&title, &names, self.selected)
    }
}

struct NavigationScreen {
    painter: Arc<ScreenPainter>,
    context: Arc<ObservationContext>,
    starfield: Arc<StarfieldRenderer>,
}

impl NavigationScreen {
    fn new(
        painter: Arc<ScreenPainter>,
        context: Arc<ObservationContext>,
        starfield: Arc<StarfieldRenderer>,
    ) -> Self {
        NavigationScreen { painter, context, starfield }
    }

    fn zoom_in(&self) {
        let mut optics = self.context.optics.lock().unwrap();
        optics.zoom = if optics.zoom < 1.0 {
            1.0
        } else if optics.zoom == 1.0 {
            2.0
        } else if optics.zoom < 20.0 {
            (optics.zoom + 2.0).min(20.0)
        } else {
            20.0
        };
    }

    fn zoom_out(&self) {
        let mut optics = self.context.optics.lock().unwrap();
        optics.zoom =
            if optics.zoom > 1.0 { optics.zoom - 1.0 } else { 0.5 };
    }
}

impl Screen for NavigationScreen {
    fn handle(&mut self, event: ButtonEvent) -> Option<ScreenState> {
        if event.phase != ButtonPhase::Press {
            return None;
        }
        match event.button {
            Button::Up => {
                self.zoom_in();
                None
            }
            Button::Down => {
                self.zoom_out();
                None
            }
            Button::A => Some(ScreenState::Directions),
            Button::B => Some(ScreenState::MainMenu),
            _ => None,
        }
    }

    fn render(&mut self) -> RgbImage {
        let Some((field, target_separation)) = self.starfield.render() else {
            return self
                .painter
                .render_many_text(&[AWAITING_SOLVE.to_string()]);
        };
        let (ra, dec, roll) = self.context.pointing().unwrap_or_default();
        let zoom = self.context.optics.lock().unwrap().zoom;
        let age = self.context.seconds_since_solve().unwrap_or(0.0);

        let top = format!("RA:{:.3}|DEC:{:.3} ({:.1}s)", ra, dec, age);
        let has_target =
            self.context.target.lock().unwrap().has_target();
        let target_part = if has_target {
            format!("|{:.2}deg to target", target_separation)
        } else {
            String::new()
        };
        let bottom = format!("{:.1}deg|{}X{}", roll, zoom, target_part);
        self.painter.render_image_with_caption(&field, &top, &bottom)
    }
}

struct DirectionsScreen {
    painter: Arc<ScreenPainter>,
    context: Arc<ObservationContext>,
}

impl DirectionsScreen {
    fn new(
        painter: Arc<ScreenPainter>,
        context: Arc<ObservationContext>,
    ) -> Self {
        DirectionsScreen { painter, context }
    }
}

impl Screen for DirectionsScreen {
    fn handle(&mut self, event: ButtonEvent) -> Option<ScreenState> {
        if event.phase != ButtonPhase::Press {
            return None;
        }
        match event.button {
            Button::A | Button::B => Some(ScreenState::Navigation),
            _ => None,
        }
    }

    fn render(&mut self) -> RgbImage {
        let Some((ra, dec, _roll)) = self.context.pointing() else {
            return self
                .painter
                .render_many_text(&[AWAITING_SOLVE.to_string()]);
        };
        let target = self.context.target.lock().unwrap().clone();
        let Some((target_ra, target_dec)) = target.position() else {
            return self
                .painter
                .render_many_text(&["No target set.".to_string()]);
        };
        let (time, location) = {
            let environment = self.context.environment.lock().unwrap();
            (environment.time, environment.location)
        };

        let (alt, az) = radec_to_altaz(ra, dec, &time, &location);
        let (target_alt, target_az) =
            radec_to_altaz(target_ra, target_dec, &time, &location);
        let delta_up = target_alt - alt;
        let mut delta_clockwise = target_az - az;
        // Shortest way around the horizon.
        if delta_clockwise > 180.0 {
            delta_clockwise -= 360.0;
        } else if delta_clockwise < -180.0 {
            delta_clockwise += 360.0;
        }

        let age = self.context.seconds_since_solve().unwrap_or(0.0);
        let lines = vec![
            String::new(),
            "CURRENT TARGET:".to_string(),
            target.name.clone(),
            String::new(),
            format!(
                "Up: {} ({:+.2}deg)",
                distance_descriptor(delta_up),
                delta_up
            ),
            format!(
                "Clockwise: {} ({:+.2}deg)",
                distance_descriptor(delta_clockwise),
                delta_clockwise
            ),
            String::new(),
            format!("Last solve {:.1}s ago", age),
        ];
        self.painter.render_many_text(&lines)
    }
}

struct InfoScreen {
    painter: Arc<ScreenPainter>,
    context: Arc<ObservationContext>,
    analyzer: Arc<Mutex<Analyzer>>,
    counters: Arc<PipelineCounters>,
}

impl InfoScreen {
    fn new(
        painter: Arc<ScreenPainter>,
        context: Arc<ObservationContext>,
        analyzer: Arc<Mutex<Analyzer>>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        InfoScreen { painter, context, analyzer, counters }
    }
}

impl Screen for InfoScreen {
    fn handle(&mut self, event: ButtonEvent) -> Option<ScreenState> {
        if event.phase != ButtonPhase::Press {
            return None;
        }
        match event.button {
            Button::A => Some(ScreenState::Navigation),
            Button::B => Some(ScreenState::MainMenu),
            _ => None,
        }
    }

    fn render(&mut self) -> RgbImage {
        let position_line = match self.context.pointing() {
            Some((ra, dec, _roll)) => {
                format!("RA:{:.4} | DEC:{:.4}", ra, dec)
            }
            None => "Unsolved".to_string(),
        };
        let (time, location) = {
            let environment = self.context.environment.lock().unwrap();
            (environment.time, environment.location)
        };
        let optics = self.context.optics.lock().unwrap().clone();
        let (fwhm, background, noise, feedback) = {
            let mut analyzer = self.analyzer.lock().unwrap();
            (
                analyzer.fwhm.latest(),
                analyzer.background.latest(),
                analyzer.noise.latest(),
                analyzer.feedback(),
            )
        };

        let mut lines = vec![
            position_line,
            format!(
                "UTC: {}",
                DateTime::<Utc>::from(time).format("%Y-%m-%d %H:%M:%S")
            ),
            format!(
                "{:.4}N, {:.4}E",
                location.latitude, location.longitude
            ),
            format!(
                "Lens: {}mm ({}deg AFOV)",
                optics.eyepiece, optics.eyepiece_fov
            ),
            format!(
                "APT: {}mm FL: {}mm",
                optics.aperture, optics.focal_length
            ),
            format!(
                "FWHM: {}",
                fwhm.map_or("--".to_string(), |v| format!("{:.2}", v))
            ),
            format!(
                "BG+NOISE: {}+{}",
                background.map_or("--".into(), |v: f64| format!("{:.3}", v)),
                noise.map_or("--".to_string(), |v| format!("{:.3}", v))
            ),
            format!(
                "frames {} (bad {})",
                self.counters.frames_captured.load(Ordering::Relaxed),
                self.counters.capture_failures.load(Ordering::Relaxed)
            ),
            format!(
                "solves {} (fail {})",
                self.counters.solve_successes.load(Ordering::Relaxed),
                self.counters.solve_failures.load(Ordering::Relaxed)
            ),
        ];
        if let Some(feedback) = feedback {
            lines.push(format!("! {}", feedback));
        }
        self.painter.render_many_text(&lines)
    }
}
