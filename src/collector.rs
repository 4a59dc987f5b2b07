//! Thread-safe aggregation of counters, rates and latency trends.
//!
//! Every worker feeds [`MetricSample`]s into one shared [`MetricsCollector`].
//! Aggregation is commutative: the collector keeps sums and counts only, so
//! samples may arrive in any order from any number of tasks.
//!
//! Each metric name owns its own cell. The name maps are write-locked only
//! when a name is seen for the first time; afterwards producers touch atomics
//! (counters, rates) or the per-trend histogram mutex.

use crate::percentiles::{PercentileTracker, TrendSnapshot, TrendSummary};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Names of the metrics the engine records on its own.
pub mod names {
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const ERRORS: &str = "errors";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const STEPS_SKIPPED: &str = "steps_skipped";
    pub const FALLBACKS: &str = "fallbacks";
    pub const CHECK_PREFIX: &str = "checks.";
    pub const HTTP_ERRORS_PREFIX: &str = "http_errors.";
    pub const GROUP_DURATION_PREFIX: &str = "group_duration.";

    /// Rate name under which a single check's outcomes are recorded.
    pub fn check(check_name: &str) -> String {
        format!("{}{}", CHECK_PREFIX, check_name)
    }

    /// Counter name for one error category label.
    pub fn http_errors(category_label: &str) -> String {
        format!("{}{}", HTTP_ERRORS_PREFIX, category_label)
    }

    /// Trend name for the time spent inside one step group.
    pub fn group_duration(group: &str) -> String {
        format!("{}{}", GROUP_DURATION_PREFIX, group)
    }
}

/// One observation produced by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricSample {
    Counter(String, u64),
    Rate(String, bool),
    Trend(String, Duration),
}

/// The kind of a metric, used when a statistic must match the metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

#[derive(Default)]
struct RateCell {
    trues: AtomicU64,
    total: AtomicU64,
}

impl RateCell {
    fn record(&self, outcome: bool) {
        // total first so a concurrent reader never sees trues > total
        self.total.fetch_add(1, Ordering::SeqCst);
        if outcome {
            self.trues.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn read(&self) -> RateSummary {
        let trues = self.trues.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        RateSummary::new(trues.min(total), total)
    }
}

/// Aggregate of a boolean metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateSummary {
    pub trues: u64,
    pub total: u64,
    pub rate: f64,
}

impl RateSummary {
    pub fn new(trues: u64, total: u64) -> Self {
        let rate = if total == 0 {
            0.0
        } else {
            trues as f64 / total as f64
        };
        Self { trues, total, rate }
    }

    pub fn falses(&self) -> u64 {
        self.total - self.trues
    }
}

/// Current aggregate of one named metric.
#[derive(Debug, Clone)]
pub enum AggregatedMetric {
    Counter(u64),
    Rate(RateSummary),
    Trend(TrendSnapshot),
}

impl AggregatedMetric {
    pub fn kind(&self) -> MetricKind {
        match self {
            AggregatedMetric::Counter(_) => MetricKind::Counter,
            AggregatedMetric::Rate(_) => MetricKind::Rate,
            AggregatedMetric::Trend(_) => MetricKind::Trend,
        }
    }

    /// True when nothing has been recorded under this name yet.
    pub fn is_empty(&self) -> bool {
        match self {
            AggregatedMetric::Counter(_) => false,
            AggregatedMetric::Rate(r) => r.total == 0,
            AggregatedMetric::Trend(t) => t.is_empty(),
        }
    }
}

/// Serializable view of every metric at one instant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub rates: BTreeMap<String, RateSummary>,
    pub trends: BTreeMap<String, TrendSummary>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn rate(&self, name: &str) -> Option<&RateSummary> {
        self.rates.get(name)
    }

    pub fn trend(&self, name: &str) -> Option<&TrendSummary> {
        self.trends.get(name)
    }
}

/// Shared, concurrently writable metric store.
#[derive(Default)]
pub struct MetricsCollector {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    rates: RwLock<HashMap<String, Arc<RateCell>>>,
    trends: RwLock<HashMap<String, Arc<PercentileTracker>>>,
}

fn cell<T: Default>(map: &RwLock<HashMap<String, Arc<T>>>, name: &str) -> Arc<T> {
    if let Some(existing) = map.read().unwrap_or_else(PoisonError::into_inner).get(name) {
        return Arc::clone(existing);
    }
    let mut guard = map.write().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(guard.entry(name.to_string()).or_default())
}

fn lookup<T>(map: &RwLock<HashMap<String, Arc<T>>>, name: &str) -> Option<Arc<T>> {
    map.read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
}

fn entries<T>(map: &RwLock<HashMap<String, Arc<T>>>) -> Vec<(String, Arc<T>)> {
    map.read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(k, v)| (k.clone(), Arc::clone(v)))
        .collect()
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sample: MetricSample) {
        match sample {
            MetricSample::Counter(name, delta) => self.add_counter(&name, delta),
            MetricSample::Rate(name, outcome) => self.add_rate(&name, outcome),
            MetricSample::Trend(name, value) => self.add_trend(&name, value),
        }
    }

    pub fn add_all(&self, samples: impl IntoIterator<Item = MetricSample>) {
        for sample in samples {
            self.add(sample);
        }
    }

    pub fn add_counter(&self, name: &str, delta: u64) {
        cell(&self.counters, name).fetch_add(delta, Ordering::Relaxed);
    }

    pub fn add_rate(&self, name: &str, outcome: bool) {
        cell(&self.rates, name).record(outcome);
    }

    pub fn add_trend(&self, name: &str, value: Duration) {
        cell(&self.trends, name).record_duration(value);
    }

    /// Current aggregate for `name`, or `None` if the name was never recorded.
    pub fn aggregate(&self, name: &str) -> Option<AggregatedMetric> {
        if let Some(counter) = lookup(&self.counters, name) {
            return Some(AggregatedMetric::Counter(counter.load(Ordering::Relaxed)));
        }
        if let Some(rate) = lookup(&self.rates, name) {
            return Some(AggregatedMetric::Rate(rate.read()));
        }
        lookup(&self.trends, name).map(|t| AggregatedMetric::Trend(t.snapshot()))
    }

    pub fn counter(&self, name: &str) -> u64 {
        lookup(&self.counters, name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn rate(&self, name: &str) -> Option<RateSummary> {
        lookup(&self.rates, name).map(|r| r.read())
    }

    pub fn trend(&self, name: &str) -> Option<TrendSnapshot> {
        lookup(&self.trends, name).map(|t| t.snapshot())
    }

    /// Reads every metric without blocking producers for longer than one
    /// map clone.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = entries(&self.counters)
            .into_iter()
            .map(|(name, c)| (name, c.load(Ordering::Relaxed)))
            .collect();
        let rates = entries(&self.rates)
            .into_iter()
            .map(|(name, r)| (name, r.read()))
            .collect();
        let trends = entries(&self.trends)
            .into_iter()
            .filter_map(|(name, t)| t.summary().map(|s| (name, s)))
            .collect();

        MetricsSnapshot {
            counters,
            rates,
            trends,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_sum_deltas() {
        let c = MetricsCollector::new();
        c.add_counter("http_reqs", 1);
        c.add_counter("http_reqs", 4);

        assert_eq!(c.counter("http_reqs"), 5);
        assert_eq!(c.counter("missing"), 0);
        assert!(matches!(c.aggregate("http_reqs"), Some(AggregatedMetric::Counter(5))));
    }

    #[test]
    fn empty_rate_is_zero() {
        assert_eq!(RateSummary::new(0, 0).rate, 0.0);
        assert!(MetricsCollector::new().rate("errors").is_none());
    }

    #[test]
    fn rate_is_trues_over_total() {
        let c = MetricsCollector::new();
        for i in 0..100 {
            c.add_rate(names::ERRORS, i < 3);
        }
        let r = c.rate(names::ERRORS).unwrap();
        assert_eq!(r.trues, 3);
        assert_eq!(r.total, 100);
        assert_eq!(r.falses(), 97);
        assert!((r.rate - 0.03).abs() < f64::EPSILON);
    }

    #[test]
    fn trend_aggregate_reports_percentiles() {
        let c = MetricsCollector::new();
        for ms in 1..=100 {
            c.add_trend(names::HTTP_REQ_DURATION, Duration::from_millis(ms));
        }

        match c.aggregate(names::HTTP_REQ_DURATION) {
            Some(AggregatedMetric::Trend(t)) => {
                assert_eq!(t.count(), 100);
                assert!((t.percentile_ms(95.0) - 95.0).abs() < 0.1);
            }
            other => panic!("expected trend, got {:?}", other),
        }
    }

    #[test]
    fn snapshot_contains_every_kind() {
        let c = MetricsCollector::new();
        c.add_counter(names::ITERATIONS, 2);
        c.add_rate(&names::check("status is 200"), true);
        c.add_trend(names::ITERATION_DURATION, Duration::from_millis(12));

        let snap = c.snapshot();
        assert_eq!(snap.counter(names::ITERATIONS), 2);
        assert_eq!(snap.rate("checks.status is 200").unwrap().trues, 1);
        assert_eq!(snap.trend(names::ITERATION_DURATION).unwrap().count, 1);
    }

    #[test]
    fn add_all_dispatches_each_sample() {
        let c = MetricsCollector::new();
        c.add_all(vec![
            MetricSample::Counter(names::HTTP_REQS.into(), 2),
            MetricSample::Rate(names::HTTP_REQ_FAILED.into(), true),
            MetricSample::Rate(names::HTTP_REQ_FAILED.into(), false),
            MetricSample::Trend(names::HTTP_REQ_DURATION.into(), Duration::from_millis(7)),
        ]);

        assert_eq!(c.counter(names::HTTP_REQS), 2);
        assert_eq!(c.rate(names::HTTP_REQ_FAILED).unwrap().total, 2);
        assert_eq!(c.trend(names::HTTP_REQ_DURATION).unwrap().count(), 1);
    }

    #[test]
    fn error_category_counter_names() {
        assert_eq!(names::http_errors("timeout_error"), "http_errors.timeout_error");
    }
}
