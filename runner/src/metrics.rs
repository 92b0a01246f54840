//! Run wide aggregation of counters, gauges, trends and checks.
//!
//! Iterations report through the [`Recorder`] trait. The [`Aggregator`] keeps
//! everything needed to evaluate thresholds at the end of the run and mirrors
//! each update into OpenTelemetry instruments so a collector can follow the
//! run live.
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use opentelemetry::{
    global,
    metrics::{Counter, Histogram, ObservableGauge},
    KeyValue,
};
use serde::Serialize;
use tdigest::TDigest;

use crate::thresholds::ThresholdResult;

/// Name of the rate metric computed over every check.
pub const CHECKS: &str = "checks";
/// Resources created, including creates answered with already exists.
pub const CREATED: &str = "devworkspace_created";
/// Resources that reached a ready phase.
pub const READY: &str = "devworkspace_ready";
/// Resources that reached a failure phase.
pub const READY_FAILED: &str = "devworkspace_ready_failed";
/// Resources that did not reach a terminal phase in time.
pub const READY_TIMEOUT: &str = "devworkspace_ready_timeout";
/// Creates rejected by the API.
pub const CREATE_FAILED: &str = "devworkspace_create_failed";
/// Deletes rejected by the API.
pub const DELETE_FAILED: &str = "devworkspace_delete_failed";
/// Identity tampering attempts accepted by the API.
pub const WEBHOOK_PROBE_FAILURES: &str = "webhook_probe_failures";
/// Latency of create calls in milliseconds.
pub const CREATE_DURATION: &str = "devworkspace_create_duration";
/// Time from the start of the create call until ready, in milliseconds.
pub const READY_DURATION: &str = "devworkspace_ready_duration";
/// Latency of delete calls in milliseconds.
pub const DELETE_DURATION: &str = "devworkspace_delete_duration";

const DIGEST_SIZE: usize = 100;
const TREND_BUFFER: usize = 1000;

/// Sink for the metrics of a run.
///
/// Implementations must accept concurrent updates from every VU; all
/// operations are commutative.
pub trait Recorder: Send + Sync {
    /// Add one to a counter.
    fn increment(&self, counter: &str) {
        self.add(counter, 1)
    }
    /// Add `n` to a counter.
    fn add(&self, counter: &str, n: u64);
    /// Add a sample to a trend.
    fn observe(&self, trend: &str, value: f64);
    /// Replace the value of a gauge.
    fn set_gauge(&self, gauge: &str, value: f64);
    /// Record the result of a named check.
    fn check(&self, name: &str, passed: bool);
}

/// Pass and fail counts of a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckCounts {
    /// Times the check passed
    pub passes: u64,
    /// Times the check failed
    pub fails: u64,
}

#[derive(Debug, Clone)]
struct Trend {
    digest: TDigest,
    buffer: Vec<f64>,
}

impl Default for Trend {
    fn default() -> Self {
        Self {
            digest: TDigest::new_with_size(DIGEST_SIZE),
            buffer: Vec::with_capacity(TREND_BUFFER),
        }
    }
}

impl Trend {
    fn observe(&mut self, value: f64) {
        self.buffer.push(value);
        if self.buffer.len() == TREND_BUFFER {
            self.digest = self.digest.merge_unsorted(std::mem::take(&mut self.buffer));
        }
    }

    fn digest(&self) -> TDigest {
        self.digest.merge_unsorted(self.buffer.clone())
    }
}

#[derive(Debug, Default)]
struct State {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    trends: BTreeMap<String, Trend>,
    checks: BTreeMap<String, CheckCounts>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Instruments {
    counter: Counter<u64>,
    trend: Histogram<f64>,
    checks: Counter<u64>,
    _gauge: ObservableGauge<f64>,
}

impl Instruments {
    fn new(state: Arc<Mutex<State>>) -> Self {
        let meter = global::meter("dwload");
        let counter = meter
            .u64_counter("dwload_counter")
            .with_description("Load test counters by name")
            .init();
        let trend = meter
            .f64_histogram("dwload_trend")
            .with_description("Load test trends by name")
            .init();
        let checks = meter
            .u64_counter("dwload_checks")
            .with_description("Load test checks by name and result")
            .init();
        let gauge = meter
            .f64_observable_gauge("dwload_gauge")
            .with_description("Load test gauges by name")
            .with_callback(move |observer| {
                for (name, value) in &lock(&state).gauges {
                    observer.observe(*value, &[KeyValue::new("name", name.clone())]);
                }
            })
            .init();
        Self {
            counter,
            trend,
            checks,
            _gauge: gauge,
        }
    }
}

/// Thread safe [`Recorder`] accumulating the metrics of one run.
#[derive(Clone)]
pub struct Aggregator {
    state: Arc<Mutex<State>>,
    instruments: Arc<Instruments>,
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    /// Create an empty aggregator registered with the global meter provider.
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        Self {
            instruments: Arc::new(Instruments::new(state.clone())),
            state,
        }
    }

    /// Copy the current values out of the aggregator.
    pub fn snapshot(&self) -> Snapshot {
        let state = lock(&self.state);
        Snapshot {
            counters: state.counters.clone(),
            gauges: state.gauges.clone(),
            trends: state
                .trends
                .iter()
                .map(|(name, trend)| (name.clone(), trend.digest()))
                .collect(),
            checks: state.checks.clone(),
        }
    }
}

impl Recorder for Aggregator {
    fn add(&self, counter: &str, n: u64) {
        *lock(&self.state)
            .counters
            .entry(counter.to_owned())
            .or_default() += n;
        self.instruments
            .counter
            .add(n, &[KeyValue::new("name", counter.to_owned())]);
    }

    fn observe(&self, trend: &str, value: f64) {
        lock(&self.state)
            .trends
            .entry(trend.to_owned())
            .or_default()
            .observe(value);
        self.instruments
            .trend
            .record(value, &[KeyValue::new("name", trend.to_owned())]);
    }

    fn set_gauge(&self, gauge: &str, value: f64) {
        lock(&self.state).gauges.insert(gauge.to_owned(), value);
    }

    fn check(&self, name: &str, passed: bool) {
        {
            let mut state = lock(&self.state);
            let counts = state.checks.entry(name.to_owned()).or_default();
            if passed {
                counts.passes += 1;
            } else {
                counts.fails += 1;
            }
        }
        self.instruments.checks.add(
            1,
            &[
                KeyValue::new("name", name.to_owned()),
                KeyValue::new("passed", passed),
            ],
        );
    }
}

/// Point in time copy of the aggregated metrics.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Counter values by name
    pub counters: BTreeMap<String, u64>,
    /// Gauge values by name
    pub gauges: BTreeMap<String, f64>,
    /// Trend digests by name
    pub trends: BTreeMap<String, TDigest>,
    /// Check results by name
    pub checks: BTreeMap<String, CheckCounts>,
}

impl Snapshot {
    /// Value of a counter, zero when never incremented.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or_default()
    }

    /// Value of a gauge, zero when never set.
    pub fn gauge(&self, name: &str) -> f64 {
        self.gauges.get(name).copied().unwrap_or_default()
    }

    /// Digest of a trend, None when it has no samples.
    pub fn trend(&self, name: &str) -> Option<&TDigest> {
        self.trends.get(name).filter(|digest| digest.count() > 0.0)
    }

    /// Totals over every check.
    pub fn check_totals(&self) -> CheckCounts {
        self.checks
            .values()
            .fold(CheckCounts::default(), |total, counts| CheckCounts {
                passes: total.passes + counts.passes,
                fails: total.fails + counts.fails,
            })
    }

    /// Fraction of passing checks, None when no check ran.
    pub fn check_rate(&self) -> Option<f64> {
        let totals = self.check_totals();
        let total = totals.passes + totals.fails;
        (total > 0).then(|| totals.passes as f64 / total as f64)
    }

    /// Build the summary of the run from the snapshot and threshold results.
    pub fn summary(&self, thresholds: Vec<ThresholdResult>) -> RunSummary {
        RunSummary {
            passed: thresholds.iter().all(|result| result.passed),
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
            trends: self
                .trends
                .iter()
                .map(|(name, digest)| (name.clone(), TrendStats::from(digest)))
                .collect(),
            checks: self.checks.clone(),
            thresholds,
        }
    }
}

/// Statistics of a trend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TrendStats {
    /// Number of samples
    pub count: u64,
    /// Mean
    pub avg: f64,
    /// Smallest sample
    pub min: f64,
    /// Median
    pub med: f64,
    /// Largest sample
    pub max: f64,
    /// 90th percentile
    pub p90: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
}

impl From<&TDigest> for TrendStats {
    fn from(digest: &TDigest) -> Self {
        if digest.count() == 0.0 {
            return Self::default();
        }
        Self {
            count: digest.count() as u64,
            avg: digest.mean(),
            min: digest.min(),
            med: digest.estimate_quantile(0.5),
            max: digest.max(),
            p90: digest.estimate_quantile(0.9),
            p95: digest.estimate_quantile(0.95),
            p99: digest.estimate_quantile(0.99),
        }
    }
}

/// Final result of the metrics of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// True when every threshold passed
    pub passed: bool,
    /// Counter values
    pub counters: BTreeMap<String, u64>,
    /// Gauge values
    pub gauges: BTreeMap<String, f64>,
    /// Trend statistics
    pub trends: BTreeMap<String, TrendStats>,
    /// Check results
    pub checks: BTreeMap<String, CheckCounts>,
    /// Result of every threshold
    pub thresholds: Vec<ThresholdResult>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, counts) in &self.checks {
            let mark = if counts.fails == 0 { "✓" } else { "✗" };
            writeln!(
                f,
                "{mark} {name} ({} passed, {} failed)",
                counts.passes, counts.fails
            )?;
        }
        for (name, value) in &self.counters {
            writeln!(f, "{name:.<40}: {value}")?;
        }
        for (name, value) in &self.gauges {
            writeln!(f, "{name:.<40}: {value}")?;
        }
        for (name, stats) in &self.trends {
            writeln!(
                f,
                "{name:.<40}: count={} avg={:.2} min={:.2} med={:.2} max={:.2} p(90)={:.2} p(95)={:.2}",
                stats.count, stats.avg, stats.min, stats.med, stats.max, stats.p90, stats.p95
            )?;
        }
        for result in &self.thresholds {
            let mark = if result.passed { "✓" } else { "✗" };
            match result.actual {
                Some(actual) => writeln!(f, "{mark} {} (actual {actual:.2})", result.threshold)?,
                None => writeln!(f, "{mark} {} (no data)", result.threshold)?,
            }
        }
        write!(f, "{}", if self.passed { "PASSED" } else { "FAILED" })
    }
}
