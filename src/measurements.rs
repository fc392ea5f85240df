//! Measurement records and the containers that hold them.

use crate::config::MONITOR_SERIES_CAPACITY;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Outcome of a single round-trip probe.
///
/// A reply of zero milliseconds is a valid (very fast) sample; loss is
/// carried by the separate `NoResponse` variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LatencySample {
    Reply(Duration),
    NoResponse,
}

impl LatencySample {
    pub fn from_ms(ms: f64) -> Self {
        if ms.is_finite() && ms >= 0.0 {
            LatencySample::Reply(Duration::from_secs_f64(ms / 1000.0))
        } else {
            LatencySample::NoResponse
        }
    }

    pub fn rtt_ms(&self) -> Option<f64> {
        match self {
            LatencySample::Reply(rtt) => Some(rtt.as_secs_f64() * 1000.0),
            LatencySample::NoResponse => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, LatencySample::Reply(_))
    }

    /// Value plotted on charts: the RTT, or zero when nothing came back.
    pub fn chart_value(&self) -> f64 {
        self.rtt_ms().unwrap_or(0.0)
    }
}

impl fmt::Display for LatencySample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rtt_ms() {
            Some(ms) => write!(f, "{:.2} ms", ms),
            None => f.write_str("no response"),
        }
    }
}

/// Convert a byte count and transfer time into megabits per second.
///
/// Returns 0.0 when nothing was transferred or the elapsed time is not
/// positive.
pub fn calculate_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();

    if bytes == 0 || seconds <= 0.0 {
        return 0.0;
    }

    (bytes as f64 * 8.0 / 1_000_000.0) / seconds
}

/// One completed monitor tick. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub timestamp: DateTime<Local>,
    pub interface: String,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_avg_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    pub http_response_ms: f64,
}

/// Append-only measurement history shared between the scheduler and
/// exporters.
#[derive(Debug, Clone, Default)]
pub struct MeasurementHistory {
    inner: Arc<Mutex<Vec<Measurement>>>,
}

impl MeasurementHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, measurement: Measurement) {
        lock(&self.inner).push(measurement);
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every measurement recorded so far, in order.
    pub fn snapshot(&self) -> Vec<Measurement> {
        lock(&self.inner).clone()
    }
}

/// Fixed-capacity series that evicts its oldest point.
#[derive(Debug, Clone)]
pub struct RollingSeries {
    capacity: usize,
    points: VecDeque<f64>,
}

impl RollingSeries {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, points: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, value: f64) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.points.iter().copied().collect()
    }
}

/// A [`RollingSeries`] behind a lock: one writer, any number of readers
/// taking snapshots.
#[derive(Debug, Clone)]
pub struct SharedSeries {
    inner: Arc<Mutex<RollingSeries>>,
}

impl SharedSeries {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Arc::new(Mutex::new(RollingSeries::new(capacity))) }
    }

    pub fn push(&self, value: f64) {
        lock(&self.inner).push(value);
    }

    pub fn snapshot(&self) -> Vec<f64> {
        lock(&self.inner).to_vec()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Download, upload and ping chart series of the monitor.
#[derive(Debug, Clone)]
pub struct MonitorSeries {
    pub download: SharedSeries,
    pub upload: SharedSeries,
    pub ping: SharedSeries,
}

impl MonitorSeries {
    pub fn record(&self, measurement: &Measurement) {
        self.download.push(measurement.download_mbps);
        self.upload.push(measurement.upload_mbps);
        self.ping.push(measurement.ping_avg_ms);
    }
}

impl Default for MonitorSeries {
    fn default() -> Self {
        Self {
            download: SharedSeries::new(MONITOR_SERIES_CAPACITY),
            upload: SharedSeries::new(MONITOR_SERIES_CAPACITY),
            ping: SharedSeries::new(MONITOR_SERIES_CAPACITY),
        }
    }
}

// A panicking writer cannot leave a Vec or VecDeque half-updated, so a
// poisoned lock still guards consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
