//! End-of-run reporting.
//!
//! A [`ReportSink`] receives the finished [`RunReport`]. The console sink
//! prints the human summary; the JSON sink writes the full report for CI.

use crate::collector::{names, MetricsSnapshot};
use crate::controller::{RunReport, StopReason};
use crate::percentiles::format_percentile_table;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write report to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub trait ReportSink {
    fn emit(&self, report: &RunReport) -> Result<(), ReportError>;
}

/// Prints the summary to stdout.
pub struct ConsoleReportSink;

impl ReportSink for ConsoleReportSink {
    fn emit(&self, report: &RunReport) -> Result<(), ReportError> {
        println!("{}", render_summary(report));
        Ok(())
    }
}

/// Writes the whole report as pretty JSON.
pub struct JsonReportSink {
    path: PathBuf,
}

impl JsonReportSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ReportSink for JsonReportSink {
    fn emit(&self, report: &RunReport) -> Result<(), ReportError> {
        let json = serde_json::to_string_pretty(report)?;
        fs::write(&self.path, json).map_err(|source| ReportError::Write {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), "Wrote JSON report");
        Ok(())
    }
}

/// Renders the plain-text summary shown at the end of a run.
pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let verdict = if report.passed { "PASSED" } else { "FAILED" };

    let _ = writeln!(out, "\n=== {} : {} ===", report.plan, verdict);
    let _ = writeln!(out, "Duration: {:.1}s", report.duration.as_secs_f64());

    if let Some(e) = &report.setup_error {
        let _ = writeln!(out, "Setup failed: {}", e);
    }
    match &report.stop_reason {
        Some(StopReason::ThresholdAbort(crossed)) => {
            let _ = writeln!(out, "Stopped early by threshold: {}", crossed.join(", "));
        }
        Some(StopReason::Shutdown) => {
            let _ = writeln!(out, "Stopped early by shutdown request");
        }
        None => {}
    }

    if let Some(summary) = &report.scheduler {
        let _ = writeln!(
            out,
            "Virtual users: peak {}, interrupted {}",
            summary.peak_vus, summary.interrupted
        );
    }

    render_metrics(&mut out, &report.metrics);

    let _ = writeln!(out, "\n## Thresholds\n");
    if report.thresholds_evaluated == 0 && report.violations.is_empty() {
        let _ = writeln!(out, "No thresholds evaluated.");
    } else {
        let _ = writeln!(
            out,
            "{} evaluated, {} violated",
            report.thresholds_evaluated,
            report.violations.len()
        );
        for violation in &report.violations {
            let _ = writeln!(out, "  ✗ {}", violation);
        }
    }

    out
}

fn render_metrics(out: &mut String, metrics: &MetricsSnapshot) {
    let _ = writeln!(out, "\n## Counters\n");
    for (name, value) in &metrics.counters {
        let _ = writeln!(out, "{:<30} {:>10}", name, value);
    }

    let (checks, rates): (Vec<_>, Vec<_>) = metrics
        .rates
        .iter()
        .partition(|(name, _)| name.starts_with(names::CHECK_PREFIX));

    let _ = writeln!(out, "\n## Rates\n");
    for (name, rate) in rates {
        let _ = writeln!(
            out,
            "{:<30} {:>7.2}%  ({} of {})",
            name,
            rate.rate * 100.0,
            rate.trues,
            rate.total
        );
    }

    if !checks.is_empty() {
        let _ = writeln!(out, "\n## Checks\n");
        for (name, rate) in checks {
            let mark = if rate.trues == rate.total { "✓" } else { "✗" };
            let _ = writeln!(
                out,
                "  {} {:<40} {:>7.2}%  ({} failed)",
                mark,
                &name[names::CHECK_PREFIX.len()..],
                rate.rate * 100.0,
                rate.falses()
            );
        }
    }

    out.push_str(&format_percentile_table("Trends", &metrics.trends));
}
