//! Request lifecycle hooks.
//!
//! Observers see every call the executor makes: `on_begin` before admission,
//! then exactly one of `on_finish` (a 200/201 response) or `on_error`.
//! Observers cannot change the outcome; a panicking observer is logged and
//! skipped.
//!
//! [`LatencyObserver`] keeps a histogram of round-trip times with fixed 1ms
//! bins up to 30s; slower calls are clamped to the last bin.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Method;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RestError;

/// Identity of one executor call.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Unique per call, for correlating log lines.
    pub id: Uuid,
    pub method: Method,
    pub path: String,
}

pub trait RequestObserver: Send + Sync {
    fn on_begin(&self, _info: &RequestInfo) {}

    fn on_finish(&self, _info: &RequestInfo, _status: u16, _elapsed: Duration) {}

    fn on_error(&self, _info: &RequestInfo, _error: &RestError, _elapsed: Duration) {}
}

/// Logs every call through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct LoggingObserver;

impl RequestObserver for LoggingObserver {
    fn on_begin(&self, info: &RequestInfo) {
        debug!(request_id = %info.id, "[rest] {} {}", info.method, info.path);
    }

    fn on_finish(&self, info: &RequestInfo, status: u16, elapsed: Duration) {
        debug!(request_id = %info.id, status, elapsed_ms = elapsed.as_millis() as u64, "[rest] {} {} ok", info.method, info.path);
    }

    fn on_error(&self, info: &RequestInfo, error: &RestError, elapsed: Duration) {
        warn!(request_id = %info.id, elapsed_ms = elapsed.as_millis() as u64, "[rest] {} {} failed: {error}", info.method, info.path);
    }
}

/// Width of each histogram bin in microseconds.
const BIN_WIDTH_US: u64 = 1_000;

/// Number of histogram bins (covers 0 to 30s).
const NUM_BINS: usize = 30_000;

/// Round-trip statistics.
#[derive(Debug, Clone, Copy)]
pub struct LatencyStats {
    pub count: u64,
    pub errors: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub avg_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
}

impl std::fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "n={} err={} min={}µs max={}µs avg={:.1}µs p50={}µs p90={}µs p99={}µs",
            self.count, self.errors, self.min_us, self.max_us, self.avg_us, self.p50_us, self.p90_us, self.p99_us,
        )
    }
}

struct Histogram {
    bins: Vec<u64>,
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
}

impl Histogram {
    fn new() -> Self {
        Self { bins: vec![0u64; NUM_BINS], count: 0, sum: 0, min: u64::MAX, max: 0 }
    }

    fn record(&mut self, us: u64) {
        self.count += 1;
        self.sum += us;
        self.min = self.min.min(us);
        self.max = self.max.max(us);
        let bin = ((us / BIN_WIDTH_US) as usize).min(NUM_BINS - 1);
        self.bins[bin] += 1;
    }

    fn percentile(&self, pct: f64) -> u64 {
        let target = (self.count as f64 * pct).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &n) in self.bins.iter().enumerate() {
            cumulative += n;
            if cumulative >= target {
                return (i as u64) * BIN_WIDTH_US;
            }
        }
        self.max
    }
}

/// Collects round-trip latency of successful calls and counts failures.
pub struct LatencyObserver {
    histogram: Mutex<Histogram>,
    errors: AtomicU64,
}

impl LatencyObserver {
    pub fn new() -> Self {
        Self { histogram: Mutex::new(Histogram::new()), errors: AtomicU64::new(0) }
    }

    /// `None` until at least one call has succeeded.
    pub fn stats(&self) -> Option<LatencyStats> {
        let h = self.histogram.lock();
        if h.count == 0 {
            return None;
        }
        Some(LatencyStats {
            count: h.count,
            errors: self.errors.load(Ordering::Relaxed),
            min_us: h.min,
            max_us: h.max,
            avg_us: h.sum as f64 / h.count as f64,
            p50_us: h.percentile(0.50),
            p90_us: h.percentile(0.90),
            p99_us: h.percentile(0.99),
        })
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        *self.histogram.lock() = Histogram::new();
        self.errors.store(0, Ordering::Relaxed);
    }
}

impl Default for LatencyObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestObserver for LatencyObserver {
    fn on_finish(&self, _info: &RequestInfo, _status: u16, elapsed: Duration) {
        self.histogram.lock().record(elapsed.as_micros() as u64);
    }

    fn on_error(&self, _info: &RequestInfo, _error: &RestError, _elapsed: Duration) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}
