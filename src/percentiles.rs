//! Latency trends backed by HDR Histogram.
//!
//! Samples are stored in microseconds with 3 significant digits, so any
//! `p(N)` answer is within 0.1% of the exact sample value. Queries and
//! summaries are in milliseconds, the unit thresholds are written in.

use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::warn;

const LOWEST_US: u64 = 1;

/// One hour. Longer samples are clamped.
const HIGHEST_US: u64 = 3_600_000_000;

const SIGNIFICANT_DIGITS: u8 = 3;

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

/// End-of-run view of one trend, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSummary {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub med: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Shared, lock-protected histogram for one trend name.
pub struct PercentileTracker {
    histogram: Mutex<Histogram<u64>>,
}

impl PercentileTracker {
    pub fn new() -> Self {
        // constant bounds, cannot fail
        let histogram = Histogram::new_with_bounds(LOWEST_US, HIGHEST_US, SIGNIFICANT_DIGITS)
            .expect("constant histogram bounds are valid");
        Self {
            histogram: Mutex::new(histogram),
        }
    }

    pub fn record_duration(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros())
            .unwrap_or(u64::MAX)
            .clamp(LOWEST_US, HIGHEST_US);

        let mut hist = self.histogram.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = hist.record(us) {
            warn!(latency_us = us, error = %e, "Dropping trend sample");
        }
    }

    pub fn snapshot(&self) -> TrendSnapshot {
        let hist = self.histogram.lock().unwrap_or_else(PoisonError::into_inner);
        TrendSnapshot {
            histogram: hist.clone(),
        }
    }

    /// `None` until the first sample arrives.
    pub fn summary(&self) -> Option<TrendSummary> {
        self.snapshot().summary()
    }
}

impl Default for PercentileTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Detached copy of a trend, safe to query while producers keep recording.
#[derive(Debug, Clone)]
pub struct TrendSnapshot {
    histogram: Histogram<u64>,
}

impl TrendSnapshot {
    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    pub fn min_ms(&self) -> f64 {
        us_to_ms(self.histogram.min())
    }

    pub fn max_ms(&self) -> f64 {
        us_to_ms(self.histogram.max())
    }

    pub fn mean_ms(&self) -> f64 {
        self.histogram.mean() / 1000.0
    }

    /// Value at percentile `p` in `0.0..=100.0`.
    pub fn percentile_ms(&self, p: f64) -> f64 {
        let q = (p / 100.0).clamp(0.0, 1.0);
        us_to_ms(self.histogram.value_at_quantile(q))
    }

    pub fn summary(&self) -> Option<TrendSummary> {
        if self.is_empty() {
            return None;
        }

        Some(TrendSummary {
            count: self.count(),
            avg: self.mean_ms(),
            min: self.min_ms(),
            med: self.percentile_ms(50.0),
            max: self.max_ms(),
            p90: self.percentile_ms(90.0),
            p95: self.percentile_ms(95.0),
            p99: self.percentile_ms(99.0),
        })
    }
}

/// Renders one row per trend, all columns in milliseconds.
pub fn format_percentile_table(title: &str, trends: &BTreeMap<String, TrendSummary>) -> String {
    if trends.is_empty() {
        return format!("## {}\n\nNo data available.\n", title);
    }

    let mut out = format!("\n## {} (ms)\n\n", title);
    out.push_str(&format!(
        "{:<32} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}\n",
        "Metric", "Count", "Avg", "Min", "Med", "Max", "P90", "P95", "P99"
    ));
    out.push_str(&"-".repeat(114));
    out.push('\n');

    for (name, t) in trends {
        out.push_str(&format!(
            "{:<32} {:>8} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2}\n",
            name, t.count, t.avg, t.min, t.med, t.max, t.p90, t.p95, t.p99
        ));
    }

    out
}
