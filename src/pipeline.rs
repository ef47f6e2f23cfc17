// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use canonical_error::CanonicalError;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::adjuster::Adjuster;
use crate::analyzer::Analyzer;
use crate::astro_util::{
    altaz_to_radec, apply_rotation, haversine_dist, radec_to_altaz,
};
use crate::camera::AbstractCamera;
use crate::context::{Frame, ObservationContext};
use crate::settings::SettingsStore;
use crate::solver::{SolveOutcome, Solver};
use crate::stellarium::CelestialPosition;

const LOOP_SLEEP: Duration = Duration::from_millis(10);
const STOP_GRACE: Duration = Duration::from_millis(200);

/// Feature flags fixed at startup and threaded by reference.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeOptions {
    /// Mirror solved frames into the analyzer.
    pub perform_analysis: bool,
    /// Let solve streaks drive camera exposure.
    pub dynamic_adjust: bool,
    /// Run the planetarium broadcast endpoint.
    pub broadcast: bool,
    /// Append applied positions to the coordinate log.
    pub log_coordinates: bool,
    /// Apply sidereal drift between solves.
    pub drift: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            perform_analysis: true,
            dynamic_adjust: true,
            broadcast: true,
            log_coordinates: false,
            drift: true,
        }
    }
}

/// Failure/throughput counters surfaced on the Info screen.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub frames_captured: AtomicU64,
    pub capture_failures: AtomicU64,
    pub solve_successes: AtomicU64,
    pub solve_failures: AtomicU64,
}

/// Single-frame handoff between workers. Holding capacity one and replacing
/// the pending frame bounds in-flight memory and favors freshness when the
/// consumer falls behind.
pub struct FrameSlot {
    slot: Mutex<Option<Arc<Frame>>>,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        FrameSlot { slot: Mutex::new(None) }
    }

    /// Non-blocking push. Returns true if an undelivered frame was dropped.
    pub fn offer(&self, frame: Arc<Frame>) -> bool {
        self.slot.lock().unwrap().replace(frame).is_some()
    }

    pub fn take(&self) -> Option<Arc<Frame>> {
        self.slot.lock().unwrap().take()
    }
}

/// Applies a solver result to the shared state. Stale results (at or before
/// the last applied solve) are discarded. Returns whether the result was
/// applied.
pub fn apply_solve_result(
    context: &ObservationContext,
    position: &Mutex<CelestialPosition>,
    store: Option<&SettingsStore>,
    outcome: &SolveOutcome,
    timestamp: SystemTime,
) -> bool {
    // Stale check and calibration fetch share one solver critical section.
    let rotation_matrix = {
        let mut solver_state = context.solver.lock().unwrap();
        if let Some(last_solved) = solver_state.last_solved {
            if timestamp <= last_solved {
                debug!("discarding stale solve result");
                return false;
            }
        }
        solver_state.last_solved = Some(timestamp);
        solver_state.rotation_matrix
    };
    let (time, location) = {
        let environment = context.environment.lock().unwrap();
        (environment.time, environment.location)
    };
    let camera_offset = {
        let optics = context.optics.lock().unwrap();
        optics.has_camera_offset().then_some(optics.camera_offset)
    };

    let roll = outcome.roll.rem_euclid(360.0);
    let (mut ra, mut dec) = (outcome.ra, outcome.dec);
    if let Some(rotation) = rotation_matrix {
        (ra, dec) = apply_rotation(&rotation, ra, dec, roll);
    }
    if let Some((az_offset, alt_offset)) = camera_offset {
        let (alt, az) = radec_to_altaz(ra, dec, &time, &location);
        (ra, dec) =
            altaz_to_radec(alt + alt_offset, az + az_offset, &time, &location);
    }

    let logging = {
        let mut telescope = context.telescope.lock().unwrap();
        telescope.mount_position = Some((outcome.ra, outcome.dec));
        telescope.roll = roll;
        if let Some(previous) = telescope.position {
            telescope.speed =
                haversine_dist(previous.0, previous.1, ra, dec);
            telescope.last_position = Some(previous);
        }
        telescope.position = Some((ra, dec));
        telescope.logging
    };

    position.lock().unwrap().update(ra, dec);
    if logging {
        if let Some(store) = store {
            store.append_coord(time, ra, dec);
        }
    }
    true
}

struct PipelineShared {
    context: Arc<ObservationContext>,
    camera: Arc<tokio::sync::Mutex<Box<dyn AbstractCamera + Send>>>,
    solver: Arc<dyn Solver + Send + Sync>,
    analyzer: Arc<Mutex<Analyzer>>,
    position: Arc<Mutex<CelestialPosition>>,
    options: RuntimeOptions,
    counters: Arc<PipelineCounters>,
    store: Option<Arc<SettingsStore>>,
    running: AtomicBool,
    capture_slot: FrameSlot,
    analyzer_slot: FrameSlot,
}

/// The capture -> solve -> analyze worker trio. Workers communicate through
/// the frame slots and the shared context; recoverable failures never leave
/// their worker.
pub struct Pipeline {
    shared: Arc<PipelineShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(
        context: Arc<ObservationContext>,
        camera: Arc<tokio::sync::Mutex<Box<dyn AbstractCamera + Send>>>,
        solver: Arc<dyn Solver + Send + Sync>,
        analyzer: Arc<Mutex<Analyzer>>,
        position: Arc<Mutex<CelestialPosition>>,
        options: RuntimeOptions,
        store: Option<Arc<SettingsStore>>,
    ) -> Self {
        Pipeline {
            shared: Arc::new(PipelineShared {
                context,
                camera,
                solver,
                analyzer,
                position,
                options,
                counters: Arc::new(PipelineCounters::default()),
                store,
                running: AtomicBool::new(false),
                capture_slot: FrameSlot::new(),
                analyzer_slot: FrameSlot::new(),
            }),
            workers: Vec::new(),
        }
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        self.shared.counters.clone()
    }

    /// Starts the camera and the worker tasks. Idempotent.
    pub async fn start(&mut self) -> Result<(), CanonicalError> {
        if self.shared.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let (exposure_us, gain) = {
            let camera_state = self.shared.context.camera.lock().unwrap();
            (camera_state.exposure_us(), camera_state.gain)
        };
        {
            let mut camera = self.shared.camera.lock().await;
            camera.start().await?;
            camera.configure(exposure_us, gain).await?;
        }
        self.shared.context.camera.lock().unwrap().enabled = true;
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        self.workers.push(tokio::task::spawn(async move {
            Self::capture_worker(shared).await;
        }));
        let shared = self.shared.clone();
        self.workers.push(tokio::task::spawn(async move {
            Self::solve_worker(shared).await;
        }));
        let shared = self.shared.clone();
        self.workers.push(tokio::task::spawn(async move {
            Self::analyze_worker(shared).await;
        }));
        info!("pipeline started");
        Ok(())
    }

    /// Clears the running flag and reaps the workers. Workers that fail to
    /// observe the flag within the grace period (e.g. blocked in a long
    /// exposure) are aborted.
    pub async fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        for mut worker in self.workers.drain(..) {
            if tokio::time::timeout(STOP_GRACE, &mut worker).await.is_err() {
                worker.abort();
                let _ = worker.await;
            }
        }
        self.shared.camera.lock().await.stop().await;
        self.shared.context.camera.lock().unwrap().enabled = false;
        info!("pipeline stopped");
    }

    async fn capture_worker(shared: Arc<PipelineShared>) {
        debug!("capture worker starting");
        while shared.running.load(Ordering::Acquire) {
            let captured = shared.camera.lock().await.capture().await;
            match captured {
                Ok(frame) => {
                    let frame = Arc::new(frame);
                    shared
                        .counters
                        .frames_captured
                        .fetch_add(1, Ordering::Relaxed);
                    shared
                        .context
                        .camera
                        .lock()
                        .unwrap()
                        .publish_image(frame.clone());
                    if shared.capture_slot.offer(frame) {
                        debug!("solver behind; dropped oldest frame");
                    }
                }
                Err(e) => {
                    shared
                        .counters
                        .capture_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!("capture failed: {:?}", e);
                }
            }
            tokio::time::sleep(LOOP_SLEEP).await;
        }
        debug!("capture worker stopped");
    }

    async fn solve_worker(shared: Arc<PipelineShared>) {
        debug!("solve worker starting");
        let initial_exposure =
            shared.context.camera.lock().unwrap().exposure_us();
        let mut adjuster = Adjuster::new(initial_exposure);
        while shared.running.load(Ordering::Acquire) {
            let Some(frame) = shared.capture_slot.take() else {
                tokio::time::sleep(LOOP_SLEEP).await;
                continue;
            };
            let (fov_estimate, target_pixel) = {
                let solver_state = shared.context.solver.lock().unwrap();
                (solver_state.fov_estimate, solver_state.target_pixel)
            };
            match shared.solver.solve(&frame, fov_estimate, target_pixel).await
            {
                Ok(Some(outcome)) => {
                    shared
                        .counters
                        .solve_successes
                        .fetch_add(1, Ordering::Relaxed);
                    apply_solve_result(
                        &shared.context,
                        &shared.position,
                        shared.store.as_deref(),
                        &outcome,
                        frame.readout_time,
                    );
                    if shared.options.perform_analysis {
                        shared.analyzer_slot.offer(frame);
                    }
                    if shared.options.dynamic_adjust
                        && adjuster.success().is_some()
                    {
                        Self::apply_exposure(&shared, adjuster.exposure_us())
                            .await;
                    }
                }
                Ok(None) => {
                    shared
                        .counters
                        .solve_failures
                        .fetch_add(1, Ordering::Relaxed);
                    if shared.options.dynamic_adjust
                        && adjuster.fail().is_some()
                    {
                        Self::apply_exposure(&shared, adjuster.exposure_us())
                            .await;
                    }
                }
                Err(e) => {
                    // Solver infrastructure hiccup; recovered locally.
                    shared
                        .counters
                        .solve_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!("solver error: {:?}", e);
                }
            }
        }
        debug!("solve worker stopped");
    }

    async fn apply_exposure(shared: &PipelineShared, exposure_us: i64) {
        let gain = shared.context.camera.lock().unwrap().gain;
        if let Err(e) =
            shared.camera.lock().await.configure(exposure_us, gain).await
        {
            warn!("exposure adjustment failed: {:?}", e);
            return;
        }
        shared.context.camera.lock().unwrap().set_exposure_us(exposure_us);
        info!("exposure adjusted to {}us", exposure_us);
    }

    async fn analyze_worker(shared: Arc<PipelineShared>) {
        debug!("analyze worker starting");
        while shared.running.load(Ordering::Acquire) {
            match shared.analyzer_slot.take() {
                Some(frame) => {
                    shared.analyzer.lock().unwrap().process_frame(&frame);
                }
                None => tokio::time::sleep(LOOP_SLEEP).await,
            }
        }
        debug!("analyze worker stopped");
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use image::GrayImage;

    use super::*;
    use crate::astro_util::{solve_rotation, ObserverLocation};
    use crate::camera::FakeCamera;
    use crate::context::MIN_EXPOSURE_US;
    use crate::solver::FakeSolver;

    fn rochester() -> ObserverLocation {
        ObserverLocation {
            latitude: 43.1566,
            longitude: -77.6088,
            elevation: 150.0,
        }
    }

    fn outcome(ra: f64, dec: f64, roll: f64) -> SolveOutcome {
        SolveOutcome { ra, dec, roll, probability: 1.0, fov_measured: 21.0 }
    }

    fn at(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_750_000_000 + seconds)
    }

    #[test]
    fn test_frame_slot_drops_oldest() {
        let slot = FrameSlot::new();
        let frame = |v: u8| {
            Arc::new(Frame {
                image: GrayImage::from_pixel(2, 2, image::Luma([v])),
                readout_time: SystemTime::now(),
            })
        };
        assert!(slot.take().is_none());
        assert!(!slot.offer(frame(1)));
        assert!(slot.offer(frame(2))); // Oldest dropped.
        let delivered = slot.take().unwrap();
        assert_eq!(delivered.image.get_pixel(0, 0).0[0], 2);
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_stale_result_discarded() {
        let context = ObservationContext::new(rochester());
        let position = Mutex::new(CelestialPosition::new());

        assert!(apply_solve_result(
            &context,
            &position,
            None,
            &outcome(279.2437, 38.7861, 0.0),
            at(100),
        ));
        assert!(!apply_solve_result(
            &context,
            &position,
            None,
            &outcome(0.0, 0.0, 0.0),
            at(99),
        ));

        let telescope = context.telescope.lock().unwrap();
        assert_eq!(telescope.position, Some((279.2437, 38.7861)));
        assert_eq!(telescope.last_position, None);
    }

    #[test]
    fn test_equal_timestamp_is_stale() {
        let context = ObservationContext::new(rochester());
        let position = Mutex::new(CelestialPosition::new());
        assert!(apply_solve_result(
            &context,
            &position,
            None,
            &outcome(10.0, 10.0, 0.0),
            at(100),
        ));
        assert!(!apply_solve_result(
            &context,
            &position,
            None,
            &outcome(20.0, 20.0, 0.0),
            at(100),
        ));
    }

    #[test]
    fn test_speed_is_great_circle_delta() {
        let context = ObservationContext::new(rochester());
        let position = Mutex::new(CelestialPosition::new());
        apply_solve_result(
            &context,
            &position,
            None,
            &outcome(100.0, 10.0, 0.0),
            at(1),
        );
        assert_eq!(context.telescope.lock().unwrap().speed, 0.0);
        apply_solve_result(
            &context,
            &position,
            None,
            &outcome(100.0, 12.0, 0.0),
            at(2),
        );
        let telescope = context.telescope.lock().unwrap();
        assert_abs_diff_eq!(telescope.speed, 2.0, epsilon = 1e-9);
        assert_eq!(telescope.last_position, Some((100.0, 10.0)));
    }

    #[test]
    fn test_rotation_matrix_corrects_position() {
        let context = ObservationContext::new(rochester());
        let position = Mutex::new(CelestialPosition::new());
        let camera_pointing = (23.44546, 89.01);
        let telescope_pointing = (37.80326, 89.2592);
        context.solver.lock().unwrap().rotation_matrix = Some(
            solve_rotation(camera_pointing, telescope_pointing, 0.0),
        );

        apply_solve_result(
            &context,
            &position,
            None,
            &outcome(camera_pointing.0, camera_pointing.1, 0.0),
            at(1),
        );
        let telescope = context.telescope.lock().unwrap();
        let (ra, dec) = telescope.position.unwrap();
        assert_abs_diff_eq!(ra, telescope_pointing.0, epsilon = 1e-6);
        assert_abs_diff_eq!(dec, telescope_pointing.1, epsilon = 1e-6);
        // Raw solver output is retained alongside.
        assert_eq!(telescope.mount_position, Some(camera_pointing));
    }

    #[test]
    fn test_camera_offset_applies_in_horizon_frame() {
        let context = ObservationContext::new(rochester());
        let position = Mutex::new(CelestialPosition::new());
        context.optics.lock().unwrap().camera_offset = (0.0, 1.0);

        apply_solve_result(
            &context,
            &position,
            None,
            &outcome(279.2437, 38.7861, 0.0),
            at(1),
        );
        let (ra, dec) = context.telescope.lock().unwrap().position.unwrap();
        // A one-degree altitude offset moves the pointing one degree along
        // a great circle.
        let moved = haversine_dist(279.2437, 38.7861, ra, dec);
        assert_abs_diff_eq!(moved, 1.0, epsilon = 0.01);
    }

    #[test]
    fn test_roll_wraps_to_zero() {
        let context = ObservationContext::new(rochester());
        let position = Mutex::new(CelestialPosition::new());
        apply_solve_result(
            &context,
            &position,
            None,
            &outcome(100.0, 10.0, 360.0),
            at(1),
        );
        assert_eq!(context.telescope.lock().unwrap().roll, 0.0);
    }

    #[test]
    fn test_broadcast_only_on_rounded_change() {
        let context = ObservationContext::new(rochester());
        let position = Mutex::new(CelestialPosition::new());

        apply_solve_result(
            &context,
            &position,
            None,
            &outcome(10.0, 10.0, 0.0),
            at(1),
        );
        assert!(position.lock().unwrap().has_update);
        position.lock().unwrap().has_update = false;

        // Sub-centidegree motion: applied, but no new packet.
        apply_solve_result(
            &context,
            &position,
            None,
            &outcome(10.001, 10.001, 0.0),
            at(2),
        );
        assert!(!position.lock().unwrap().has_update);
        assert_eq!(
            context.telescope.lock().unwrap().position,
            Some((10.001, 10.001))
        );

        apply_solve_result(
            &context,
            &position,
            None,
            &outcome(10.02, 10.0, 0.0),
            at(3),
        );
        assert!(position.lock().unwrap().has_update);
    }

    fn test_pipeline(
        solver: FakeSolver,
    ) -> (Pipeline, Arc<ObservationContext>, Arc<Mutex<CelestialPosition>>)
    {
        let context = Arc::new(ObservationContext::new(rochester()));
        context.camera.lock().unwrap().set_exposure_us(MIN_EXPOSURE_US);
        let camera: Arc<tokio::sync::Mutex<Box<dyn AbstractCamera + Send>>> =
            Arc::new(tokio::sync::Mutex::new(Box::new(FakeCamera::new(
                vec![GrayImage::from_pixel(64, 64, image::Luma([12]))],
            ))));
        let position = Arc::new(Mutex::new(CelestialPosition::new()));
        let pipeline = Pipeline::new(
            context.clone(),
            camera,
            Arc::new(solver),
            Arc::new(Mutex::new(Analyzer::new())),
            position.clone(),
            RuntimeOptions::default(),
            None,
        );
        (pipeline, context, position)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_first_solve_end_to_end() {
        let (mut pipeline, context, position) =
            test_pipeline(FakeSolver::fixed(279.2437, 38.7861, 0.0));
        pipeline.start().await.unwrap();

        let mut solved = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if context.telescope.lock().unwrap().is_solved() {
                solved = true;
                break;
            }
        }
        assert!(solved, "no solve applied within a second");
        {
            let telescope = context.telescope.lock().unwrap();
            assert_eq!(telescope.position, Some((279.2437, 38.7861)));
            assert_eq!(telescope.speed, 0.0);
        }
        {
            let position = position.lock().unwrap();
            assert_eq!(position.ra, 279.2437);
            assert_eq!(position.dec, 38.7861);
        }
        assert!(
            pipeline.counters().solve_successes.load(Ordering::Relaxed) >= 1
        );
        pipeline.stop().await;
        assert!(!context.camera.lock().unwrap().enabled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_solver_failures_are_counted_not_fatal() {
        let (mut pipeline, context, _position) =
            test_pipeline(FakeSolver::failing());
        pipeline.start().await.unwrap();
        let counters = pipeline.counters();

        let mut failures = 0;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            failures = counters.solve_failures.load(Ordering::Relaxed);
            if failures >= 2 {
                break;
            }
        }
        assert!(failures >= 2, "only {} failures recorded", failures);
        assert!(!context.telescope.lock().unwrap().is_solved());
        pipeline.stop().await;
    }
}
