// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use clap::Parser;
use image::GrayImage;
use log::{error, info, warn};

use astroflo::analyzer::Analyzer;
use astroflo::astro_util::ObserverLocation;
use astroflo::camera::{AbstractCamera, FakeCamera};
use astroflo::catalog::Catalog;
use astroflo::context::ObservationContext;
use astroflo::display::{is_device_host, ScreenDriver, StubScreen};
use astroflo::ephemeris::{AstroEphemeris, CachedEphemeris};
use astroflo::pipeline::{Pipeline, RuntimeOptions};
use astroflo::render::{load_font, ScreenPainter};
use astroflo::screens::{build_screens, UiDeps};
use astroflo::settings::SettingsStore;
use astroflo::solver::{FakeSolver, Solver};
use astroflo::starfield::StarfieldRenderer;
use astroflo::stellarium::{self, CelestialPosition};

const CATALOG_FILE: &str = "catalog.csv";
const REFERENCE_FRAME_FILE: &str = "reference_frame.png";
const UI_PREVIEW_FILE: &str = "ui_preview.png";

#[derive(Parser, Debug)]
#[command(
    name = "astroflo-server",
    about = "Plate-solving telescope assistant"
)]
struct Args {
    /// Render a single UI frame to a PNG for debugging, then exit.
    #[arg(long)]
    ui: bool,

    /// Run the capture/solve pipeline and the planetarium broadcast only,
    /// without the on-device UI.
    #[arg(long)]
    stel: bool,

    /// Directory holding the star catalog, settings, and logs.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Planetarium broadcast port.
    #[arg(long, default_value_t = stellarium::DEFAULT_PORT)]
    port: u16,

    /// Observer latitude, degrees north.
    #[arg(long, default_value_t = 43.1566)]
    latitude: f64,

    /// Observer longitude, degrees east.
    #[arg(long, default_value_t = -77.6088)]
    longitude: f64,

    /// Observer elevation, meters.
    #[arg(long, default_value_t = 150.0)]
    elevation: f64,

    /// Append each applied position to coord_log.txt.
    #[arg(long)]
    log_coords: bool,
}

fn build_camera(data_dir: &PathBuf) -> Box<dyn AbstractCamera + Send> {
    // The hardware camera module only exists on the device image; dev hosts
    // and bare device images fall back to the canned-frame camera.
    if is_device_host() {
        info!("device host detected; hardware camera module not present, using fake camera");
    }
    let reference = data_dir.join(REFERENCE_FRAME_FILE);
    let feed: Vec<GrayImage> = match image::open(&reference) {
        Ok(image) => {
            info!("fake camera serving {}", reference.display());
            vec![image.to_luma8()]
        }
        Err(_) => {
            info!("no reference frame; fake camera serving synthetic noise");
            Vec::new()
        }
    };
    Box::new(FakeCamera::new(feed))
}

fn build_solver() -> Arc<dyn Solver + Send + Sync> {
    // The production plate solver runs out-of-process and is attached by
    // the device image; the scripted solver keeps every other subsystem
    // exercisable without it. Vega, roll zero.
    Arc::new(FakeSolver::fixed(279.2437, 38.7861, 0.0))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();
    let args = Args::parse();
    std::process::exit(run(args).await);
}

async fn run(args: Args) -> i32 {
    let store = match SettingsStore::new(&args.data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("cannot use data dir {}: {:?}", args.data_dir.display(), e);
            return 2; // Fatal I/O on persistent storage.
        }
    };
    let catalog = match Catalog::load(&args.data_dir.join(CATALOG_FILE)) {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            error!("cannot load star catalog: {:?}", e);
            return 1; // Initialization failure.
        }
    };

    let location = ObserverLocation {
        latitude: args.latitude,
        longitude: args.longitude,
        elevation: args.elevation,
    };
    let context = Arc::new(ObservationContext::new(location));
    {
        let mut optics = context.optics.lock().unwrap();
        store.load_settings(&mut optics);
    }
    {
        let calibration = store.load_calibration();
        let mut solver_state = context.solver.lock().unwrap();
        solver_state.rotation_matrix = calibration.rotation();
        solver_state.target_pixel = calibration.target_pixel;
    }
    context.telescope.lock().unwrap().logging = args.log_coords;

    let options = RuntimeOptions {
        log_coordinates: args.log_coords,
        ..RuntimeOptions::default()
    };
    let ephemeris =
        Arc::new(CachedEphemeris::new(Arc::new(AstroEphemeris::new())));
    let analyzer = Arc::new(Mutex::new(Analyzer::new()));
    let position = Arc::new(Mutex::new(CelestialPosition::new()));
    let painter = Arc::new(ScreenPainter::new(load_font()));
    let starfield = Arc::new(StarfieldRenderer::new(
        catalog.clone(),
        ephemeris.clone(),
        context.clone(),
        painter.clone(),
    ));

    let camera: Arc<tokio::sync::Mutex<Box<dyn AbstractCamera + Send>>> =
        Arc::new(tokio::sync::Mutex::new(build_camera(&args.data_dir)));
    let mut pipeline = Pipeline::new(
        context.clone(),
        camera,
        build_solver(),
        analyzer.clone(),
        position.clone(),
        options,
        Some(store.clone()),
    );

    let deps = UiDeps {
        context: context.clone(),
        catalog,
        ephemeris,
        starfield,
        analyzer,
        counters: pipeline.counters(),
        store: store.clone(),
        painter,
    };

    if args.ui {
        // One-shot render for debugging, no pipeline.
        let mut ui = build_screens(&deps);
        let mut screen = StubScreen::new();
        if let Some(raster) = ui.render() {
            screen.draw(&raster);
        }
        let preview = args.data_dir.join(UI_PREVIEW_FILE);
        return match screen.save_latest(&preview) {
            Ok(()) => {
                info!("wrote {}", preview.display());
                0
            }
            Err(e) => {
                error!("cannot write preview: {:?}", e);
                2
            }
        };
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("stop requested");
            running.store(false, Ordering::Release);
        }) {
            warn!("cannot install signal handler: {}", e);
        }
    }

    if let Err(e) = pipeline.start().await {
        error!("pipeline failed to start: {:?}", e);
        return 1;
    }

    let mut broadcast_task = None;
    if options.broadcast {
        broadcast_task = Some(tokio::task::spawn(stellarium::run_broadcast(
            position.clone(),
            args.port,
            running.clone(),
        )));
    }

    let mut ui_tasks = Vec::new();
    if !args.stel {
        let ui = Arc::new(Mutex::new(build_screens(&deps)));
        let screen: Arc<Mutex<Box<dyn ScreenDriver>>> =
            Arc::new(Mutex::new(Box::new(StubScreen::new())));
        screen.lock().unwrap().set_brightness(0.8);

        // Render loop.
        {
            let ui = ui.clone();
            let screen = screen.clone();
            let running = running.clone();
            ui_tasks.push(tokio::task::spawn(async move {
                while running.load(Ordering::Acquire) {
                    let raster = ui.lock().unwrap().render();
                    if let Some(raster) = raster {
                        screen.lock().unwrap().draw(&raster);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }));
        }
        // Input poll loop.
        {
            let running = running.clone();
            ui_tasks.push(tokio::task::spawn(async move {
                while running.load(Ordering::Acquire) {
                    let snapshot = screen.lock().unwrap().read_buttons();
                    ui.lock().unwrap().handle_buttons(&snapshot);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }));
        }
    }

    // Main loop: advance the clock and drift the rendered sky between
    // solves.
    let mut last_tick = SystemTime::now();
    while running.load(Ordering::Acquire) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let now = SystemTime::now();
        let elapsed = now
            .duration_since(last_tick)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        last_tick = now;
        context.environment.lock().unwrap().time = now;
        if options.drift {
            context.telescope.lock().unwrap().drift(elapsed);
        }
    }

    pipeline.stop().await;
    for task in ui_tasks {
        let _ = task.await;
    }
    if let Some(task) = broadcast_task {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
    {
        let optics = context.optics.lock().unwrap();
        store.save_settings(&optics);
    }
    info!("clean stop");
    0
}
