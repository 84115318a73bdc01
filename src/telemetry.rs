use chrono::{DateTime, Local};
use std::collections::VecDeque;

use crate::config::MAX_WINDOW_SAMPLES;

/// One heart-rate measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    pub timestamp_ms: u64,
    pub bpm: f32,
}

/// Statistics of a closed, non-empty upload window.
#[derive(Clone, Debug, PartialEq)]
pub struct HeartRateStats {
    pub window_start_ms: u64,
    pub window_end_ms: u64,
    pub max: f32,
    /// Median of the window's readings.
    pub mid: f32,
    pub min: f32,
    pub count: usize,
    pub closed_at: DateTime<Local>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WindowResult {
    /// No reading arrived during the window.
    Empty {
        window_start_ms: u64,
        window_end_ms: u64,
    },
    Stats(HeartRateStats),
}

impl WindowResult {
    pub fn stats(self) -> Option<HeartRateStats> {
        match self {
            WindowResult::Stats(stats) => Some(stats),
            WindowResult::Empty { .. } => None,
        }
    }
}

#[derive(Debug)]
struct AggregationWindow {
    start_ms: u64,
    max: f32,
    min: f32,
    count: usize,
    samples: VecDeque<f32>,
}

impl AggregationWindow {
    fn new(start_ms: u64) -> Self {
        Self {
            start_ms,
            max: f32::MIN,
            min: f32::MAX,
            count: 0,
            samples: VecDeque::with_capacity(MAX_WINDOW_SAMPLES),
        }
    }

    fn push(&mut self, bpm: f32) {
        self.max = self.max.max(bpm);
        self.min = self.min.min(bpm);
        self.count += 1;

        // Only the median store is bounded; max/min/count stay exact
        if self.samples.len() >= MAX_WINDOW_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(bpm);
    }

    fn close(self, end_ms: u64) -> WindowResult {
        if self.count == 0 {
            return WindowResult::Empty {
                window_start_ms: self.start_ms,
                window_end_ms: end_ms,
            };
        }

        let mid = median(self.samples.into_iter().collect()).clamp(self.min, self.max);

        WindowResult::Stats(HeartRateStats {
            window_start_ms: self.start_ms,
            window_end_ms: end_ms,
            max: self.max,
            mid,
            min: self.min,
            count: self.count,
            closed_at: Local::now(),
        })
    }
}

fn median(mut values: Vec<f32>) -> f32 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Aggregates readings of the current upload window.
pub struct Sampler {
    window: AggregationWindow,
}

impl Sampler {
    pub fn new(start_ms: u64) -> Self {
        Self {
            window: AggregationWindow::new(start_ms),
        }
    }

    pub fn observe(&mut self, reading: Reading) {
        if !reading.bpm.is_finite() {
            return;
        }
        self.window.push(reading.bpm);
    }

    /// Close the current window and open a fresh one starting at `now_ms`.
    pub fn flush(&mut self, now_ms: u64) -> WindowResult {
        let closed = std::mem::replace(&mut self.window, AggregationWindow::new(now_ms));
        closed.close(now_ms)
    }

    pub fn pending_readings(&self) -> usize {
        self.window.count
    }
}
