//! Named boolean checks over responses.
//!
//! Checks are data: each [`Check`] describes a predicate over an
//! [`HttpResponse`]. [`run_checks`] evaluates a list of them, records one rate
//! sample per check plus one `errors` sample, and reports whether all passed.
//! A predicate that faults (unparseable body, bad pattern, panicking closure)
//! is a failed check, never a crash.

use crate::client::HttpResponse;
use crate::collector::{names, MetricsCollector};
use regex::Regex;
use serde_json::Value;
use serde_json_path::JsonPath;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Arbitrary response predicate.
pub type CheckFn = Arc<dyn Fn(&HttpResponse) -> bool + Send + Sync>;

/// A named predicate over a response.
#[derive(Clone, Debug)]
pub struct Check {
    pub name: String,
    pub kind: CheckKind,
}

#[derive(Clone)]
pub enum CheckKind {
    /// Status is one of the listed codes
    Status(Vec<u16>),

    /// Response arrived within the limit
    MaxDuration(Duration),

    /// JSONPath matches exactly one value. Without `expected` the value must
    /// be present and not null; with it, its string form must be equal.
    JsonPath {
        path: String,
        expected: Option<String>,
    },

    /// JSONPath matches exactly one array
    IsArray(String),

    BodyContains(String),

    BodyMatches(String),

    HeaderExists(String),

    Custom(CheckFn),
}

impl fmt::Debug for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Status(codes) => f.debug_tuple("Status").field(codes).finish(),
            CheckKind::MaxDuration(d) => f.debug_tuple("MaxDuration").field(d).finish(),
            CheckKind::JsonPath { path, expected } => f
                .debug_struct("JsonPath")
                .field("path", path)
                .field("expected", expected)
                .finish(),
            CheckKind::IsArray(p) => f.debug_tuple("IsArray").field(p).finish(),
            CheckKind::BodyContains(s) => f.debug_tuple("BodyContains").field(s).finish(),
            CheckKind::BodyMatches(s) => f.debug_tuple("BodyMatches").field(s).finish(),
            CheckKind::HeaderExists(h) => f.debug_tuple("HeaderExists").field(h).finish(),
            CheckKind::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Check {
    pub fn new(name: impl Into<String>, kind: CheckKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn status(name: impl Into<String>, code: u16) -> Self {
        Self::new(name, CheckKind::Status(vec![code]))
    }

    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&HttpResponse) -> bool + Send + Sync + 'static,
    {
        Self::new(name, CheckKind::Custom(Arc::new(predicate)))
    }

    /// Copy of this check with every template string passed through `resolve`.
    pub fn resolve(&self, resolve: impl Fn(&str) -> String) -> Check {
        let kind = match &self.kind {
            CheckKind::JsonPath { path, expected } => CheckKind::JsonPath {
                path: path.clone(),
                expected: expected.as_deref().map(&resolve),
            },
            CheckKind::BodyContains(s) => CheckKind::BodyContains(resolve(s)),
            other => other.clone(),
        };
        Check {
            name: self.name.clone(),
            kind,
        }
    }

    /// Evaluates the predicate. Any fault is returned as an error.
    pub fn evaluate(&self, response: &HttpResponse) -> Result<(), CheckError> {
        match &self.kind {
            CheckKind::Status(codes) => {
                if codes.contains(&response.status) {
                    Ok(())
                } else {
                    Err(CheckError::StatusMismatch {
                        expected: codes.clone(),
                        actual: response.status,
                    })
                }
            }

            CheckKind::MaxDuration(limit) => {
                if response.elapsed <= *limit {
                    Ok(())
                } else {
                    Err(CheckError::TooSlow {
                        actual_ms: response.elapsed.as_millis(),
                        limit_ms: limit.as_millis(),
                    })
                }
            }

            CheckKind::JsonPath { path, expected } => {
                let value = query_one(response, path)?;
                match expected {
                    None if value.is_null() => {
                        Err(CheckError::JsonPath(format!("'{}' is null", path)))
                    }
                    None => Ok(()),
                    Some(expected) => {
                        let actual = json_to_string(&value);
                        if &actual == expected {
                            Ok(())
                        } else {
                            Err(CheckError::JsonPath(format!(
                                "'{}' expected '{}', got '{}'",
                                path, expected, actual
                            )))
                        }
                    }
                }
            }

            CheckKind::IsArray(path) => {
                if query_one(response, path)?.is_array() {
                    Ok(())
                } else {
                    Err(CheckError::JsonPath(format!("'{}' is not an array", path)))
                }
            }

            CheckKind::BodyContains(needle) => {
                if response.body.contains(needle.as_str()) {
                    Ok(())
                } else {
                    Err(CheckError::BodyNotContains(needle.clone()))
                }
            }

            CheckKind::BodyMatches(pattern) => {
                if Regex::new(pattern)?.is_match(&response.body) {
                    Ok(())
                } else {
                    Err(CheckError::BodyNotMatches(pattern.clone()))
                }
            }

            CheckKind::HeaderExists(name) => {
                if response.headers.contains_key(name.as_str()) {
                    Ok(())
                } else {
                    Err(CheckError::HeaderNotFound(name.clone()))
                }
            }

            CheckKind::Custom(predicate) => {
                match catch_unwind(AssertUnwindSafe(|| predicate(response))) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(CheckError::PredicateFalse),
                    Err(_) => Err(CheckError::Panicked),
                }
            }
        }
    }
}

/// Why a check did not pass.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("status {actual} not in {expected:?}")]
    StatusMismatch { expected: Vec<u16>, actual: u16 },

    #[error("response time {actual_ms}ms exceeds {limit_ms}ms")]
    TooSlow { actual_ms: u128, limit_ms: u128 },

    #[error("JSONPath check failed: {0}")]
    JsonPath(String),

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("body does not contain '{0}'")]
    BodyNotContains(String),

    #[error("body does not match /{0}/")]
    BodyNotMatches(String),

    #[error("header '{0}' not found")]
    HeaderNotFound(String),

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("predicate returned false")]
    PredicateFalse,

    #[error("predicate panicked")]
    Panicked,
}

fn query_one(response: &HttpResponse, path: &str) -> Result<Value, CheckError> {
    let json = response.json()?;
    let json_path = JsonPath::parse(path)
        .map_err(|e| CheckError::JsonPath(format!("invalid JSONPath '{}': {}", path, e)))?;
    let node_list = json_path.query(&json);
    node_list
        .exactly_one()
        .map(|v| v.clone())
        .map_err(|_| CheckError::JsonPath(format!("'{}' did not match exactly one value", path)))
}

pub(crate) fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => value.to_string(),
    }
}

/// Runs every check against `response` and records the outcomes.
///
/// Appends one `checks.<name>` rate sample per check and one `errors` rate
/// sample for the aggregate. Returns true iff all checks passed.
pub fn run_checks(response: &HttpResponse, checks: &[Check], collector: &MetricsCollector) -> bool {
    let mut all_passed = true;

    for check in checks {
        let passed = match check.evaluate(response) {
            Ok(()) => {
                debug!(check = %check.name, "Check passed");
                true
            }
            Err(e) => {
                warn!(check = %check.name, status = response.status, error = %e, "Check failed");
                false
            }
        };

        crate::metrics::CHECK_RESULTS_TOTAL
            .with_label_values(&[&check.name, if passed { "pass" } else { "fail" }])
            .inc();
        collector.add_rate(&names::check(&check.name), passed);
        all_passed &= passed;
    }

    collector.add_rate(names::ERRORS, !all_passed);
    all_passed
}
