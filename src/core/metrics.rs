// src/core/metrics.rs

//! Kernel metrics: latency, saturation, and rate observations of the
//! message-routing substrate.
//!
//! Samples feed the adaptive controller's throttling decisions. Latency
//! lives in a bounded ring; percentile queries sort a copy so readers
//! never block writers for longer than the ring lock itself.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// The rate counters roll over on this period.
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// A point-in-time copy of all derived metric values.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KernelMetricsSnapshot {
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// In `[0, 100]`.
    pub buffer_saturation_pct: f64,
    /// Messages per second over the last completed window.
    pub message_rate: f64,
    /// Errors per second over the last completed window.
    pub error_rate: f64,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RateWindow {
    window_start: Instant,
    messages: u64,
    errors: u64,
    message_rate: f64,
    error_rate: f64,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            messages: 0,
            errors: 0,
            message_rate: 0.0,
            error_rate: 0.0,
        }
    }

    /// Closes the current window if it has elapsed, folding the counters
    /// into the published rates.
    fn roll(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed < RATE_WINDOW {
            return;
        }
        let secs = elapsed.as_secs_f64();
        self.message_rate = self.messages as f64 / secs;
        self.error_rate = self.errors as f64 / secs;
        self.messages = 0;
        self.errors = 0;
        self.window_start = Instant::now();
    }
}

/// The shared metrics recorder. Writers take brief exclusive locks;
/// snapshot readers take the same locks just long enough to copy.
#[derive(Debug)]
pub struct KernelMetrics {
    capacity: usize,
    latencies_ms: Mutex<VecDeque<f64>>,
    buffer_saturation_pct: Mutex<f64>,
    rates: Mutex<RateWindow>,
}

impl KernelMetrics {
    /// Creates a recorder whose latency ring holds `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            latencies_ms: Mutex::new(VecDeque::with_capacity(capacity)),
            buffer_saturation_pct: Mutex::new(0.0),
            rates: Mutex::new(RateWindow::new()),
        }
    }

    /// Appends one per-message latency sample, evicting the oldest when
    /// the ring is full.
    pub fn observe_latency(&self, latency: Duration) {
        let mut ring = self.latencies_ms.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(latency.as_secs_f64() * 1000.0);
    }

    /// Records buffer occupancy as a saturation percentage.
    pub fn observe_buffer(&self, depth: usize, capacity: usize) {
        let pct = if capacity == 0 {
            0.0
        } else {
            (100.0 * depth as f64 / capacity as f64).clamp(0.0, 100.0)
        };
        *self.buffer_saturation_pct.lock() = pct;
    }

    /// Counts one routed message toward the rolling 1-second rates.
    pub fn tick_message(&self, is_error: bool) {
        let mut rates = self.rates.lock();
        rates.roll();
        rates.messages += 1;
        if is_error {
            rates.errors += 1;
        }
    }

    /// Computes a percentile over the current ring contents by sorting a
    /// copy. Returns 0 when no samples exist.
    pub fn latency_percentile(&self, percentile: f64) -> f64 {
        let mut samples: Vec<f64> = self.latencies_ms.lock().iter().copied().collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).expect("latency samples are finite"));
        let rank = (percentile / 100.0) * (samples.len() - 1) as f64;
        samples[rank.round() as usize]
    }

    /// A point-in-time copy of all derived values.
    pub fn snapshot(&self) -> KernelMetricsSnapshot {
        let (message_rate, error_rate) = {
            let mut rates = self.rates.lock();
            rates.roll();
            (rates.message_rate, rates.error_rate)
        };
        KernelMetricsSnapshot {
            p50_latency_ms: self.latency_percentile(50.0),
            p95_latency_ms: self.latency_percentile(95.0),
            p99_latency_ms: self.latency_percentile(99.0),
            buffer_saturation_pct: *self.buffer_saturation_pct.lock(),
            message_rate,
            error_rate,
            sampled_at: Utc::now(),
        }
    }
}
