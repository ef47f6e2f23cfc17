// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, SystemTime};

use image::GrayImage;
use imageproc::filter::{gaussian_blur_f32, median_filter};
use log::debug;

use crate::context::Frame;
use crate::metrics::MetricAccumulator;

/// Samples retained per rolling metric.
pub const METRIC_WINDOW: usize = 100;

const FEEDBACK_LIFETIME: Duration = Duration::from_secs(5);

/// Per-frame measurements fed to the classifier rules.
#[derive(Clone, Copy, Debug)]
pub struct FrameMetrics {
    /// Mean background level, 0..1.
    pub background: f64,
    /// Residual standard deviation after background removal, 0..1.
    pub noise: f64,
    /// Fraction of pixels at or near full scale.
    pub saturated_fraction: f64,
    /// Full width at half maximum of the brightest star, pixels.
    pub fwhm: f64,
}

// A rule fires when its frame condition holds; the highest-priority firing
// rule supplies the user-visible feedback text.
trait ClassificationRule: Send {
    fn name(&self) -> &'static str;
    fn priority(&self) -> i32;
    fn evaluate(&self, metrics: &FrameMetrics) -> bool;
}

struct CapOnRule {
    max_background: f64,
}
impl ClassificationRule for CapOnRule {
    fn name(&self) -> &'static str {
        "Cap on?"
    }
    fn priority(&self) -> i32 {
        100
    }
    fn evaluate(&self, metrics: &FrameMetrics) -> bool {
        metrics.background < self.max_background
            && metrics.saturated_fraction == 0.0
    }
}

struct OverExposedRule {
    saturation_threshold: f64,
}
impl ClassificationRule for OverExposedRule {
    fn name(&self) -> &'static str {
        "Over-exposed"
    }
    fn priority(&self) -> i32 {
        100
    }
    fn evaluate(&self, metrics: &FrameMetrics) -> bool {
        metrics.saturated_fraction > self.saturation_threshold
    }
}

struct BlurRule {
    max_fwhm: f64,
}
impl ClassificationRule for BlurRule {
    fn name(&self) -> &'static str {
        "Out of focus"
    }
    fn priority(&self) -> i32 {
        10
    }
    fn evaluate(&self, metrics: &FrameMetrics) -> bool {
        metrics.fwhm > self.max_fwhm
    }
}

/// Maintains rolling background / noise / FWHM statistics over the mirrored
/// frame stream, and rule-based imaging feedback for the UI. Single owner:
/// the analyze worker.
pub struct Analyzer {
    pub background: MetricAccumulator,
    pub noise: MetricAccumulator,
    pub fwhm: MetricAccumulator,

    rules: Vec<Box<dyn ClassificationRule>>,
    feedback: Option<(String, SystemTime)>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        let mut rules: Vec<Box<dyn ClassificationRule>> = vec![
            Box::new(CapOnRule { max_background: 0.01 }),
            Box::new(OverExposedRule { saturation_threshold: 0.01 }),
            Box::new(BlurRule { max_fwhm: 12.0 }),
        ];
        rules.sort_by_key(|r| -r.priority());
        Analyzer {
            background: MetricAccumulator::new(METRIC_WINDOW),
            noise: MetricAccumulator::new(METRIC_WINDOW),
            fwhm: MetricAccumulator::new(METRIC_WINDOW),
            rules,
            feedback: None,
        }
    }

    /// Ingests one frame: updates the rolling metrics and re-evaluates the
    /// feedback rules. Returns the name of the rule that fired, if any.
    pub fn process_frame(&mut self, frame: &Frame) -> Option<&'static str> {
        let metrics = measure_frame(&frame.image);
        self.background.add_value(metrics.background);
        self.noise.add_value(metrics.noise);
        self.fwhm.add_value(metrics.fwhm);

        for rule in &self.rules {
            if rule.evaluate(&metrics) {
                debug!("imaging feedback: {}", rule.name());
                self.feedback = Some((
                    rule.name().to_string(),
                    SystemTime::now() + FEEDBACK_LIFETIME,
                ));
                return Some(rule.name());
            }
        }
        None
    }

    /// Current feedback text, if it has not expired.
    pub fn feedback(&mut self) -> Option<String> {
        match &self.feedback {
            Some((text, expires)) if SystemTime::now() < *expires => {
                Some(text.clone())
            }
            _ => {
                self.feedback = None;
                None
            }
        }
    }

    /// Best (lowest) FWHM seen this session; the focus screen's target.
    pub fn best_fwhm(&self) -> Option<f64> {
        self.fwhm.session_min()
    }
}

/// Location (col=x, row=y) and value of the brightest pixel, after a small
/// blur to suppress hot pixels.
pub fn find_brightest(image: &GrayImage) -> ((u32, u32), u8) {
    let blurred = gaussian_blur_f32(image, 1.5);
    let mut best = ((0u32, 0u32), 0u8);
    for (x, y, pixel) in blurred.enumerate_pixels() {
        if pixel.0[0] > best.1 {
            best = ((x, y), pixel.0[0]);
        }
    }
    best
}

fn measure_frame(image: &GrayImage) -> FrameMetrics {
    let pixel_count = (image.width() * image.height()).max(1) as f64;

    // Cheap background estimate: a median filter kills stars and hot
    // pixels; what's left is sky glow.
    let filtered = median_filter(image, 2, 2);
    let background_sum: f64 =
        filtered.pixels().map(|p| p.0[0] as f64).sum();
    let background = background_sum / pixel_count / 255.0;

    let mut residual_sq = 0.0;
    let mut residual_sum = 0.0;
    let mut saturated = 0u64;
    for (pixel, base) in image.pixels().zip(filtered.pixels()) {
        let r = pixel.0[0] as f64 - base.0[0] as f64;
        residual_sum += r;
        residual_sq += r * r;
        if pixel.0[0] >= 250 {
            saturated += 1;
        }
    }
    let residual_mean = residual_sum / pixel_count;
    let noise =
        (residual_sq / pixel_count - residual_mean * residual_mean)
            .max(0.0)
            .sqrt()
            / 255.0;
    let saturated_fraction = saturated as f64 / pixel_count;

    FrameMetrics {
        background,
        noise,
        saturated_fraction,
        fwhm: measure_fwhm(image, background * 255.0),
    }
}

// Profile FWHM of the brightest star: crop around the peak, take each row's
// peak response, and count the rows at or above half maximum.
fn measure_fwhm(image: &GrayImage, background_level: f64) -> f64 {
    let ((peak_x, peak_y), peak_value) = find_brightest(image);
    let peak = (peak_value as f64 - background_level).max(0.0);
    if peak <= 0.0 {
        return 0.0;
    }
    let half_max = peak / 2.0;

    const HALF_SIZE: i64 = 40;
    let y_min = (peak_y as i64 - HALF_SIZE).max(0) as u32;
    let y_max = (peak_y as i64 + HALF_SIZE).min(image.height() as i64) as u32;
    let x_min = (peak_x as i64 - HALF_SIZE).max(0) as u32;
    let x_max = (peak_x as i64 + HALF_SIZE).min(image.width() as i64) as u32;
    if y_min >= y_max || x_min >= x_max {
        return 0.0;
    }

    let mut first_row: Option<u32> = None;
    let mut last_row: Option<u32> = None;
    for y in y_min..y_max {
        let mut row_peak = 0.0_f64;
        for x in x_min..x_max {
            let value =
                (image.get_pixel(x, y).0[0] as f64 - background_level).max(0.0);
            row_peak = row_peak.max(value);
        }
        if row_peak >= half_max {
            if first_row.is_none() {
                first_row = Some(y);
            }
            last_row = Some(y);
        }
    }
    match (first_row, last_row) {
        (Some(first), Some(last)) => (last - first + 1) as f64,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    // A dark field with one gaussian star of the given sigma.
    fn star_frame(sigma: f64, amplitude: f64) -> Frame {
        let (cx, cy) = (64.0, 48.0);
        let image = GrayImage::from_fn(128, 96, |x, y| {
            let d2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
            let value = 10.0 + amplitude * (-d2 / (2.0 * sigma * sigma)).exp();
            image::Luma([value.min(255.0) as u8])
        });
        Frame { image, readout_time: SystemTime::now() }
    }

    #[test]
    fn test_find_brightest_locates_star() {
        let frame = star_frame(3.0, 200.0);
        let ((x, y), value) = find_brightest(&frame.image);
        assert!((x as i64 - 64).abs() <= 2, "x = {}", x);
        assert!((y as i64 - 48).abs() <= 2, "y = {}", y);
        assert!(value > 100);
    }

    #[test]
    fn test_metrics_reflect_star_field() {
        let mut analyzer = Analyzer::new();
        let frame = star_frame(3.0, 200.0);
        analyzer.process_frame(&frame);
        // Background near the 10/255 pedestal.
        let background = analyzer.background.latest().unwrap();
        assert!(background > 0.02 && background < 0.08, "{}", background);
        assert!(analyzer.fwhm.latest().unwrap() > 0.0);
    }

    #[test]
    fn test_sharper_star_has_smaller_fwhm() {
        let mut analyzer = Analyzer::new();
        analyzer.process_frame(&star_frame(2.0, 200.0));
        let sharp = analyzer.fwhm.latest().unwrap();
        analyzer.process_frame(&star_frame(6.0, 200.0));
        let soft = analyzer.fwhm.latest().unwrap();
        assert!(sharp < soft, "sharp {} soft {}", sharp, soft);
        assert_eq!(analyzer.best_fwhm(), Some(sharp));
    }

    #[test]
    fn test_cap_on_rule_fires_on_black_frame() {
        let mut analyzer = Analyzer::new();
        let frame = Frame {
            image: GrayImage::from_pixel(64, 64, image::Luma([0])),
            readout_time: SystemTime::now(),
        };
        assert_eq!(analyzer.process_frame(&frame), Some("Cap on?"));
        assert_eq!(analyzer.feedback(), Some("Cap on?".to_string()));
    }

    #[test]
    fn test_over_exposed_rule_fires_on_white_frame() {
        let mut analyzer = Analyzer::new();
        let frame = Frame {
            image: GrayImage::from_pixel(64, 64, image::Luma([255])),
            readout_time: SystemTime::now(),
        };
        assert_eq!(analyzer.process_frame(&frame), Some("Over-exposed"));
    }

    #[test]
    fn test_normal_frame_yields_no_feedback() {
        let mut analyzer = Analyzer::new();
        assert_eq!(analyzer.process_frame(&star_frame(3.0, 180.0)), None);
        assert_eq!(analyzer.feedback(), None);
    }

    #[test]
    fn test_metric_windows_stay_bounded() {
        let mut analyzer = Analyzer::new();
        let frame = star_frame(3.0, 180.0);
        for _ in 0..METRIC_WINDOW + 20 {
            analyzer.process_frame(&frame);
        }
        assert_eq!(analyzer.background.len(), METRIC_WINDOW);
        assert_eq!(analyzer.noise.len(), METRIC_WINDOW);
        assert_eq!(analyzer.fwhm.len(), METRIC_WINDOW);
    }
}
