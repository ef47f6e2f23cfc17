// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use canonical_error::{failed_precondition_error, CanonicalError};
use image::GrayImage;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::context::{Frame, MAX_EXPOSURE_US, MIN_EXPOSURE_US};

/// Gain presets for the SBC camera's analog gain range.
pub const GAIN_LOW: f64 = 2.0;
pub const GAIN_MID: f64 = 8.0;
pub const GAIN_HIGH: f64 = 16.0;

/// Exposure presets, microseconds.
pub const EXPOSURE_FAST_US: i64 = 300_000;
pub const EXPOSURE_DEFAULT_US: i64 = 600_000;
pub const EXPOSURE_LONG_US: i64 = 1_500_000;

/// Camera device contract. Stopped -> Running via start(); both start() and
/// stop() are idempotent. capture() fails with FailedPrecondition while
/// stopped.
#[async_trait]
pub trait AbstractCamera {
    /// Makes the device ready to capture.
    async fn start(&mut self) -> Result<(), CanonicalError>;

    /// Applies clamped exposure/gain and verifies convergence with a test
    /// capture (within 1% exposure and 0.1 gain), retrying a bounded number
    /// of times before giving up with a warning. Calling with the values
    /// already in effect performs no hardware write.
    async fn configure(
        &mut self,
        exposure_us: i64,
        gain: f64,
    ) -> Result<(), CanonicalError>;

    /// Returns a frame exposed for the configured duration.
    async fn capture(&mut self) -> Result<Frame, CanonicalError>;

    async fn stop(&mut self);

    /// (exposure_us, gain) currently in effect.
    fn settings(&self) -> (i64, f64);
}

const CONFIGURE_ATTEMPTS: u32 = 10;

/// Convergence check shared by camera implementations.
pub fn settings_converged(
    goal_exposure_us: i64,
    goal_gain: f64,
    actual_exposure_us: i64,
    actual_gain: f64,
) -> bool {
    let exposure_tolerance = (goal_exposure_us as f64 * 0.01).max(1.0);
    (goal_exposure_us - actual_exposure_us).abs() as f64 <= exposure_tolerance
        && (goal_gain - actual_gain).abs() <= 0.1
}

/// Development camera: serves a preloaded frame (or synthesized noise) after
/// sleeping for the configured exposure time.
pub struct FakeCamera {
    feed: Vec<GrayImage>,
    feed_index: usize,
    exposure_us: i64,
    gain: f64,
    running: bool,
    rng: StdRng,

    // Counts hardware write cycles, for tests of configure() idempotence.
    configure_writes: Arc<Mutex<u32>>,
}

impl FakeCamera {
    /// `feed` may be empty, in which case synthetic noise frames are served.
    pub fn new(feed: Vec<GrayImage>) -> Self {
        FakeCamera {
            feed,
            feed_index: 0,
            exposure_us: EXPOSURE_DEFAULT_US,
            gain: GAIN_MID,
            running: false,
            rng: StdRng::seed_from_u64(0x5eed),
            configure_writes: Arc::new(Mutex::new(0)),
        }
    }

    pub fn configure_writes(&self) -> Arc<Mutex<u32>> {
        self.configure_writes.clone()
    }

    fn synthesize_image(&mut self, width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |_x, _y| {
            image::Luma([self.rng.gen_range(0..=32u8)])
        })
    }
}

#[async_trait]
impl AbstractCamera for FakeCamera {
    async fn start(&mut self) -> Result<(), CanonicalError> {
        if !self.running {
            self.running = true;
            info!("Fake camera started");
        }
        Ok(())
    }

    async fn configure(
        &mut self,
        exposure_us: i64,
        gain: f64,
    ) -> Result<(), CanonicalError> {
        let goal_exposure = exposure_us.clamp(MIN_EXPOSURE_US, MAX_EXPOSURE_US);
        if settings_converged(goal_exposure, gain, self.exposure_us, self.gain)
        {
            return Ok(()); // Already in effect; skip the write cycle.
        }
        for _attempt in 0..CONFIGURE_ATTEMPTS {
            *self.configure_writes.lock().unwrap() += 1;
            // The fake device applies settings exactly; one attempt suffices.
            self.exposure_us = goal_exposure;
            self.gain = gain;
            if settings_converged(
                goal_exposure,
                gain,
                self.exposure_us,
                self.gain,
            ) {
                return Ok(());
            }
        }
        warn!(
            "Camera settings did not converge; wanted {}us gain {}, have {}us gain {}",
            goal_exposure, gain, self.exposure_us, self.gain
        );
        Ok(())
    }

    async fn capture(&mut self) -> Result<Frame, CanonicalError> {
        if !self.running {
            return Err(failed_precondition_error(
                "capture() called before start()",
            ));
        }
        tokio::time::sleep(Duration::from_micros(self.exposure_us as u64))
            .await;

        let image = if self.feed.is_empty() {
            self.synthesize_image(256, 256)
        } else {
            if self.feed_index >= self.feed.len() {
                self.feed_index = 0;
            }
            let image = self.feed[self.feed_index].clone();
            self.feed_index += 1;
            image
        };
        Ok(Frame { image, readout_time: SystemTime::now() })
    }

    async fn stop(&mut self) {
        if self.running {
            self.running = false;
            info!("Fake camera stopped");
        }
    }

    fn settings(&self) -> (i64, f64) {
        (self.exposure_us, self.gain)
    }
}
