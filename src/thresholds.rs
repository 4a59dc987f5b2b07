//! Pass/fail conditions over aggregated metrics.
//!
//! Expressions follow the k6 form `<statistic><op><bound>`, for example
//! `p(95)<2000` on a trend (milliseconds) or `rate<0.05` on a rate.

use crate::collector::{AggregatedMetric, MetricKind, MetricsCollector};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

lazy_static::lazy_static! {
    static ref EXPRESSION_PATTERN: Regex = Regex::new(
        r"^\s*(rate|count|value|avg|min|max|med|p\(\s*(\d+(?:\.\d+)?)\s*\))\s*(===|==|!=|<=|>=|<|>)\s*(-?\d+(?:\.\d+)?)\s*$"
    )
    .expect("threshold pattern is valid");
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdParseError {
    #[error("threshold on '{metric}' has an invalid expression '{expression}' (expected e.g. 'p(95)<2000' or 'rate<0.05')")]
    InvalidExpression { metric: String, expression: String },

    #[error("threshold on '{metric}' uses percentile {percentile} outside 0..=100")]
    InvalidPercentile { metric: String, percentile: f64 },

    #[error("threshold has an empty metric name")]
    EmptyMetric,
}

/// Aggregate a threshold reads from its metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Rate,
    Count,
    Value,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl Statistic {
    /// Whether this statistic exists for metrics of `kind`.
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        match self {
            Statistic::Rate => kind == MetricKind::Rate,
            Statistic::Count | Statistic::Value => kind == MetricKind::Counter,
            Statistic::Avg
            | Statistic::Min
            | Statistic::Max
            | Statistic::Med
            | Statistic::Percentile(_) => kind == MetricKind::Trend,
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Rate => write!(f, "rate"),
            Statistic::Count => write!(f, "count"),
            Statistic::Value => write!(f, "value"),
            Statistic::Avg => write!(f, "avg"),
            Statistic::Min => write!(f, "min"),
            Statistic::Max => write!(f, "max"),
            Statistic::Med => write!(f, "med"),
            Statistic::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Le),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Ge),
            "==" | "===" => Some(Operator::Eq),
            "!=" => Some(Operator::Ne),
            _ => None,
        }
    }

    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Operator::Lt => observed < bound,
            Operator::Le => observed <= bound,
            Operator::Gt => observed > bound,
            Operator::Ge => observed >= bound,
            Operator::Eq => observed == bound,
            Operator::Ne => observed != bound,
        }
    }
}

/// A parsed threshold on one metric.
///
/// # Examples
/// ```
/// use rampload::thresholds::Threshold;
///
/// let t = Threshold::parse("http_req_duration", "p(95)<2000").unwrap();
/// assert_eq!(t.metric, "http_req_duration");
/// assert!(Threshold::parse("errors", "rate<<0.05").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Threshold {
    pub metric: String,

    /// Expression as written
    pub expression: String,

    pub statistic: Statistic,
    pub operator: Operator,
    pub bound: f64,

    /// Stop the run as soon as this threshold fails
    pub abort_on_fail: bool,
}

impl Threshold {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ThresholdParseError> {
        if metric.trim().is_empty() {
            return Err(ThresholdParseError::EmptyMetric);
        }

        let invalid = || ThresholdParseError::InvalidExpression {
            metric: metric.to_string(),
            expression: expression.to_string(),
        };

        let caps = EXPRESSION_PATTERN.captures(expression).ok_or_else(invalid)?;

        let statistic = match &caps[1] {
            "rate" => Statistic::Rate,
            "count" => Statistic::Count,
            "value" => Statistic::Value,
            "avg" => Statistic::Avg,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "med" => Statistic::Med,
            _ => {
                let p: f64 = caps
                    .get(2)
                    .and_then(|m| m.as_str().parse().ok())
                    .ok_or_else(invalid)?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(ThresholdParseError::InvalidPercentile {
                        metric: metric.to_string(),
                        percentile: p,
                    });
                }
                Statistic::Percentile(p)
            }
        };

        let operator = Operator::parse(&caps[3]).ok_or_else(invalid)?;
        let bound: f64 = caps[4].parse().map_err(|_| invalid())?;

        Ok(Self {
            metric: metric.to_string(),
            expression: expression.trim().to_string(),
            statistic,
            operator,
            bound,
            abort_on_fail: false,
        })
    }

    pub fn with_abort_on_fail(mut self, abort_on_fail: bool) -> Self {
        self.abort_on_fail = abort_on_fail;
        self
    }

    /// The statistic's value for `metric`, or `None` if it does not apply to
    /// the metric's kind. Trend values are milliseconds.
    pub fn observe(&self, metric: &AggregatedMetric) -> Option<f64> {
        if !self.statistic.applies_to(metric.kind()) {
            return None;
        }

        let value = match (metric, self.statistic) {
            (AggregatedMetric::Rate(rate), Statistic::Rate) => rate.rate,
            (AggregatedMetric::Counter(count), _) => *count as f64,
            (AggregatedMetric::Trend(trend), Statistic::Avg) => trend.mean_ms(),
            (AggregatedMetric::Trend(trend), Statistic::Min) => trend.min_ms(),
            (AggregatedMetric::Trend(trend), Statistic::Max) => trend.max_ms(),
            (AggregatedMetric::Trend(trend), Statistic::Med) => trend.percentile_ms(50.0),
            (AggregatedMetric::Trend(trend), Statistic::Percentile(p)) => trend.percentile_ms(p),
            _ => return None,
        };
        Some(value)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.expression)
    }
}

/// A threshold that did not hold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub threshold: Threshold,

    /// `None` when the statistic does not apply to the metric
    pub observed: Option<f64>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.observed {
            Some(value) => write!(f, "{} (observed {:.4})", self.threshold, value),
            None => write!(
                f,
                "{} ({} does not apply to this metric)",
                self.threshold, self.threshold.statistic
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThresholdReport {
    pub passed: bool,
    pub violations: Vec<Violation>,

    /// Thresholds whose metric had data
    pub evaluated: usize,
}

impl ThresholdReport {
    pub fn has_abort_violation(&self) -> bool {
        self.violations.iter().any(|v| v.threshold.abort_on_fail)
    }
}

/// Evaluates every threshold against the collector's current aggregates.
///
/// Metrics without samples are skipped rather than failed.
pub fn evaluate(thresholds: &[Threshold], collector: &MetricsCollector) -> ThresholdReport {
    let mut report = ThresholdReport {
        passed: true,
        ..Default::default()
    };

    for threshold in thresholds {
        let metric = match collector.aggregate(&threshold.metric) {
            Some(metric) if !metric.is_empty() => metric,
            _ => {
                debug!(threshold = %threshold, "No samples yet, skipping threshold");
                continue;
            }
        };

        report.evaluated += 1;
        let observed = threshold.observe(&metric);
        let holds = observed.is_some_and(|value| threshold.operator.holds(value, threshold.bound));

        if !holds {
            let violation = Violation {
                threshold: threshold.clone(),
                observed,
            };
            warn!(violation = %violation, "Threshold crossed");
            report.violations.push(violation);
        }
    }

    report.passed = report.violations.is_empty();
    report
}

/// Evaluates only the thresholds marked abort-on-fail.
pub fn evaluate_abort_on_fail(thresholds: &[Threshold], collector: &MetricsCollector) -> ThresholdReport {
    let abortable: Vec<Threshold> = thresholds
        .iter()
        .filter(|t| t.abort_on_fail)
        .cloned()
        .collect();
    evaluate(&abortable, collector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::names;
    use std::time::Duration;

    #[test]
    fn parses_statistics_and_operators() {
        let t = Threshold::parse("http_req_duration", "p(95)<2000").unwrap();
        assert_eq!(t.statistic, Statistic::Percentile(95.0));
        assert_eq!(t.operator, Operator::Lt);
        assert_eq!(t.bound, 2000.0);

        let t = Threshold::parse("errors", " rate <= 0.05 ").unwrap();
        assert_eq!((t.statistic, t.operator), (Statistic::Rate, Operator::Le));

        let t = Threshold::parse("http_reqs", "count===10").unwrap();
        assert_eq!(t.operator, Operator::Eq);

        let t = Threshold::parse("d", "p(99.9)>=1").unwrap();
        assert_eq!(t.statistic, Statistic::Percentile(99.9));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["", "p95<1", "rate<", "rate<<1", "median<1", "p(95)~1"] {
            assert!(Threshold::parse("m", bad).is_err(), "{bad:?} should fail");
        }
        assert!(matches!(
            Threshold::parse("m", "p(101)<1"),
            Err(ThresholdParseError::InvalidPercentile { .. })
        ));
        assert_eq!(
            Threshold::parse(" ", "rate<1").unwrap_err(),
            ThresholdParseError::EmptyMetric
        );
    }

    fn errors_collector(failures: usize, total: usize) -> MetricsCollector {
        let collector = MetricsCollector::new();
        for i in 0..total {
            collector.add_rate(names::ERRORS, i < failures);
        }
        collector
    }

    #[test]
    fn error_rate_threshold_boundary() {
        let thresholds = vec![Threshold::parse(names::ERRORS, "rate<0.05").unwrap()];

        assert!(evaluate(&thresholds, &errors_collector(3, 100)).passed);

        let report = evaluate(&thresholds, &errors_collector(6, 100));
        assert!(!report.passed);
        assert_eq!(report.violations.len(), 1);
        assert!((report.violations[0].observed.unwrap() - 0.06).abs() < 1e-9);
    }

    #[test]
    fn trend_percentiles_in_milliseconds() {
        let collector = MetricsCollector::new();
        for ms in 1..=100 {
            collector.add_trend(names::HTTP_REQ_DURATION, Duration::from_millis(ms));
        }

        let ok = Threshold::parse(names::HTTP_REQ_DURATION, "p(95)<96").unwrap();
        let bad = Threshold::parse(names::HTTP_REQ_DURATION, "p(95)<90").unwrap();
        let avg = Threshold::parse(names::HTTP_REQ_DURATION, "avg<60").unwrap();

        let report = evaluate(&[ok, bad.clone(), avg], &collector);
        assert_eq!(report.evaluated, 3);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].threshold, bad);
    }

    #[test]
    fn missing_metric_passes() {
        let collector = MetricsCollector::new();
        let t = Threshold::parse("student_creation_duration", "p(95)<1500").unwrap();
        let report = evaluate(&[t], &collector);
        assert!(report.passed);
        assert_eq!(report.evaluated, 0);
    }

    #[test]
    fn inapplicable_statistic_is_a_violation() {
        let collector = errors_collector(1, 10);
        let t = Threshold::parse(names::ERRORS, "p(95)<1").unwrap();
        let report = evaluate(&[t], &collector);
        assert!(!report.passed);
        assert_eq!(report.violations[0].observed, None);
    }

    #[test]
    fn counter_count_threshold() {
        let collector = MetricsCollector::new();
        collector.add_counter(names::STEPS_SKIPPED, 4);
        let t = Threshold::parse(names::STEPS_SKIPPED, "count<5").unwrap();
        assert!(evaluate(&[t], &collector).passed);
    }

    #[test]
    fn abort_subset_only_checks_flagged() {
        let collector = errors_collector(50, 100);
        let thresholds = vec![
            Threshold::parse(names::ERRORS, "rate<0.05").unwrap(),
            Threshold::parse(names::ERRORS, "rate<0.9").unwrap().with_abort_on_fail(true),
        ];
        let report = evaluate_abort_on_fail(&thresholds, &collector);
        assert!(report.passed);
        assert!(!evaluate(&thresholds, &collector).has_abort_violation());
    }
}
