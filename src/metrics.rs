// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use medians::Medianf64;

/// Summary of the values currently held in a MetricAccumulator's window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WindowStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

/// Capacity-bounded accumulator for a rolling image/solve metric. Keeps the
/// most recent `capacity` samples in a ring plus whole-session running
/// statistics; the ring never grows past its capacity.
pub struct MetricAccumulator {
    ring: RingBuffer,
    latest: Option<f64>,
    window: WindowStats,
    session: rolling_stats::Stats<f64>,
    session_count: u64,
}

impl MetricAccumulator {
    pub fn new(capacity: usize) -> Self {
        MetricAccumulator {
            ring: RingBuffer::new(capacity),
            latest: None,
            window: WindowStats::default(),
            session: rolling_stats::Stats::<f64>::new(),
            session_count: 0,
        }
    }

    pub fn add_value(&mut self, value: f64) {
        self.ring.push(value);
        self.latest = Some(value);
        self.session.update(value);
        self.session_count += 1;

        let values = self.ring.contents();
        self.window.min =
            *values.iter().min_by(|a, b| a.total_cmp(b)).unwrap();
        self.window.max =
            *values.iter().max_by(|a, b| a.total_cmp(b)).unwrap();
        self.window.mean = statistical::mean(values);
        self.window.stddev = if values.len() > 1 {
            statistical::standard_deviation(values, Some(self.window.mean))
        } else {
            0.0
        };
        let median = values.medf_unchecked();
        self.window.median = Some(median);
        self.window.median_absolute_deviation = Some(values.madf(median));
    }

    /// The most recently added sample.
    pub fn latest(&self) -> Option<f64> {
        self.latest
    }

    /// Lowest value seen over the whole session, even after the ring has
    /// wrapped.
    pub fn session_min(&self) -> Option<f64> {
        if self.session_count == 0 {
            None
        } else {
            Some(self.session.min)
        }
    }

    pub fn session_mean(&self) -> Option<f64> {
        if self.session_count == 0 {
            None
        } else {
            Some(self.session.mean)
        }
    }

    pub fn session_count(&self) -> u64 {
        self.session_count
    }

    pub fn window(&self) -> &WindowStats {
        &self.window
    }

    pub fn len(&self) -> usize {
        self.ring.contents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.contents().is_empty()
    }

    /// Forgets session statistics; the recent window is kept.
    pub fn reset_session(&mut self) {
        self.session = rolling_stats::Stats::<f64>::new();
        self.session_count = 0;
    }
}

// Vec-backed ring. We want all elements viewable as one slice for the stats
// crates, and don't care about their order within the window.
struct RingBuffer {
    next: usize,
    data: Vec<f64>,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        RingBuffer { next: 0, data: Vec::with_capacity(capacity) }
    }

    fn push(&mut self, value: f64) {
        if self.data.len() < self.data.capacity() {
            self.data.push(value);
        } else {
            self.data[self.next] = value;
            self.next = (self.next + 1) % self.data.capacity();
        }
    }

    fn contents(&self) -> &[f64] {
        self.data.as_slice()
    }
}
