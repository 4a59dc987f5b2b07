//! Scenario definitions and per-user execution state.
//!
//! A [`Scenario`] is an ordered list of dependent [`Step`]s. Each virtual user
//! owns a [`ScenarioContext`] holding the variables it extracted; run-wide
//! values produced by setup live in a shared, read-only [`RunContext`].

use crate::checks::Check;
use crate::utils::{random_cpf, random_phone, random_string};
use rand::seq::SliceRandom;
use rand::Rng;
use regex::{Captures, Regex};
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

lazy_static::lazy_static! {
    static ref VARIABLE_PATTERN: Regex =
        Regex::new(r"\$\{([^}]+)\}").expect("variable pattern is valid");
}

/// A user journey selected by weight.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,

    /// Share of the uniform draw this scenario receives. Weights are
    /// normalized by their sum, so `0.1/0.2/0.7` and `1/2/7` are equivalent.
    pub weight: f64,

    /// Templates evaluated once at the start of every iteration, in order.
    /// Later entries may reference earlier ones.
    pub variables: Vec<(String, String)>,

    /// Sequential steps to execute. May be empty for an idle scenario.
    pub steps: Vec<Step>,

    /// Pause after a complete pass, before the worker starts the next one.
    pub pacing: Option<ThinkTime>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            variables: Vec::new(),
            steps: Vec::new(),
            pacing: None,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.variables.push((name.into(), template.into()));
        self
    }

    pub fn with_pacing(mut self, pacing: ThinkTime) -> Self {
        self.pacing = Some(pacing);
        self
    }
}

/// Delay between steps or iterations.
///
/// # Examples
/// ```
/// use rampload::scenario::ThinkTime;
/// use std::time::Duration;
///
/// let fixed = ThinkTime::Fixed(Duration::from_secs(1));
/// assert_eq!(fixed.calculate_delay(), Duration::from_secs(1));
///
/// let random = ThinkTime::Random {
///     min: Duration::from_secs(1),
///     max: Duration::from_secs(3),
/// };
/// let d = random.calculate_delay();
/// assert!(d >= Duration::from_secs(1) && d <= Duration::from_secs(3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ThinkTime {
    Fixed(Duration),

    /// Uniform in `min..=max` at millisecond resolution
    Random { min: Duration, max: Duration },
}

impl ThinkTime {
    pub fn calculate_delay(&self) -> Duration {
        match self {
            ThinkTime::Fixed(duration) => *duration,
            ThinkTime::Random { min, max } => {
                let min_ms = min.as_millis() as u64;
                let max_ms = max.as_millis() as u64;

                if min_ms >= max_ms {
                    return *min;
                }

                Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
            }
        }
    }
}

/// A single request within a scenario.
#[derive(Debug, Clone)]
pub struct Step {
    /// Descriptive name (e.g. "create student")
    pub name: String,

    pub request: RequestConfig,

    /// Evaluated in order against the response
    pub checks: Vec<Check>,

    /// Applied after the checks; failures leave state untouched
    pub extractions: Vec<VariableExtraction>,

    /// Variables that must be set for this step to run
    pub precondition: Option<Precondition>,

    /// Optional delay after this step completes. Not counted as latency.
    pub think_time: Option<ThinkTime>,

    /// Extra trend metric receiving this step's latency
    pub trend: Option<String>,

    /// Extra rate metric receiving `true` whenever this step fails
    pub failure_rate: Option<String>,

    /// Consecutive steps sharing a group are timed together
    pub group: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, request: RequestConfig) -> Self {
        Self {
            name: name.into(),
            request,
            checks: Vec::new(),
            extractions: Vec::new(),
            precondition: None,
            think_time: None,
            trend: None,
            failure_rate: None,
            group: None,
        }
    }

    pub fn with_check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn with_extraction(mut self, extraction: VariableExtraction) -> Self {
        self.extractions.push(extraction);
        self
    }

    pub fn requires(mut self, variables: &[&str]) -> Self {
        self.precondition = Some(Precondition {
            requires: variables.iter().map(|v| v.to_string()).collect(),
            fallback: None,
        });
        self
    }

    /// Step to run first when a required variable is missing.
    pub fn with_fallback(mut self, fallback: Step) -> Self {
        let precondition = self.precondition.get_or_insert_with(|| Precondition {
            requires: Vec::new(),
            fallback: None,
        });
        precondition.fallback = Some(Box::new(fallback));
        self
    }

    pub fn with_trend(mut self, trend: impl Into<String>) -> Self {
        self.trend = Some(trend.into());
        self
    }

    pub fn with_think_time(mut self, think_time: ThinkTime) -> Self {
        self.think_time = Some(think_time);
        self
    }

    pub fn with_failure_rate(mut self, rate: impl Into<String>) -> Self {
        self.failure_rate = Some(rate.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Variables a step depends on, with an optional recovery step.
#[derive(Debug, Clone)]
pub struct Precondition {
    pub requires: Vec<String>,
    pub fallback: Option<Box<Step>>,
}

/// Request payload template.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Sent verbatim after substitution
    Raw(String),

    /// Substituted string by string, then serialized, so inserted values
    /// are always escaped
    Json(Value),
}

/// HTTP request template. Every string may contain `${name}` references.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub method: Method,

    /// Path appended to the base URL, or an absolute URL
    pub path: String,

    pub query: Vec<(String, String)>,

    pub body: Option<RequestBody>,

    pub headers: Vec<(String, String)>,
}

impl RequestConfig {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// JSON body; also sets `Content-Type: application/json`.
    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self.headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

/// Where an extracted value is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractScope {
    /// Cleared when the next iteration starts (created resource ids)
    #[default]
    Iteration,

    /// Kept for the lifetime of the virtual user (auth tokens)
    User,
}

/// Extract a variable from the response for use in subsequent steps.
#[derive(Debug, Clone)]
pub struct VariableExtraction {
    pub name: String,
    pub extractor: Extractor,
    pub scope: ExtractScope,
}

impl VariableExtraction {
    pub fn json(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extractor: Extractor::JsonPath(path.into()),
            scope: ExtractScope::Iteration,
        }
    }

    pub fn user_scoped(mut self) -> Self {
        self.scope = ExtractScope::User;
        self
    }
}

#[derive(Debug, Clone)]
pub enum Extractor {
    /// JSONPath query (e.g. "$.id")
    JsonPath(String),

    /// Regex with a named capture group
    Regex { pattern: String, group: String },

    Header(String),

    /// Cookie from `Set-Cookie`
    Cookie(String),
}

/// Run-wide values produced by setup. Read-only once the run starts.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    variables: HashMap<String, String>,
}

impl RunContext {
    pub fn new(variables: HashMap<String, String>) -> Self {
        Self { variables }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }
}

/// Variable state owned by one virtual user.
#[derive(Debug, Clone)]
pub struct ScenarioContext {
    run: Arc<RunContext>,

    /// Survives across iterations
    user_vars: HashMap<String, String>,

    /// Reset at the start of every iteration
    iteration_vars: HashMap<String, String>,

    vu_id: usize,
    iteration: u64,
}

impl ScenarioContext {
    pub fn new(run: Arc<RunContext>, vu_id: usize) -> Self {
        Self {
            run,
            user_vars: HashMap::new(),
            iteration_vars: HashMap::new(),
            vu_id,
            iteration: 0,
        }
    }

    /// Clears iteration state and evaluates the scenario's variable templates.
    pub fn begin_iteration(&mut self, iteration: u64, scenario: &Scenario) {
        self.iteration = iteration;
        self.iteration_vars.clear();
        for (name, template) in &scenario.variables {
            let value = self.substitute_variables(template);
            self.iteration_vars.insert(name.clone(), value);
        }
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>, scope: ExtractScope) {
        let name = name.into();
        match scope {
            ExtractScope::Iteration => {
                self.iteration_vars.insert(name, value.into());
            }
            ExtractScope::User => {
                // an iteration value would shadow the fresh user value
                self.iteration_vars.remove(&name);
                self.user_vars.insert(name, value.into());
            }
        }
    }

    /// Looks a name up in iteration, user, then run scope.
    pub fn get_variable(&self, name: &str) -> Option<&str> {
        self.iteration_vars
            .get(name)
            .or_else(|| self.user_vars.get(name))
            .map(String::as_str)
            .or_else(|| self.run.get(name))
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.get_variable(name).is_some()
    }

    /// User and iteration variables merged, iteration values winning.
    pub fn local_variables(&self) -> HashMap<String, String> {
        let mut vars = self.user_vars.clone();
        vars.extend(
            self.iteration_vars
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        vars
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Replace `${name}` references with their values.
    ///
    /// Besides stored variables, these generators are available:
    /// `timestamp`, `randomString`, `randomCpf`, `randomPhone`, `randomInt`,
    /// `pick:a|b|c`, `vu` and `iteration`. Unknown names are left as-is.
    ///
    /// # Example
    /// ```
    /// use rampload::scenario::{ExtractScope, RunContext, ScenarioContext};
    /// use std::sync::Arc;
    ///
    /// let mut ctx = ScenarioContext::new(Arc::new(RunContext::default()), 1);
    /// ctx.set_variable("student_id", "12345", ExtractScope::Iteration);
    ///
    /// assert_eq!(ctx.substitute_variables("/students/${student_id}"), "/students/12345");
    /// assert_eq!(ctx.substitute_variables("${unknown}"), "${unknown}");
    /// ```
    pub fn substitute_variables(&self, input: &str) -> String {
        if !input.contains("${") {
            return input.to_string();
        }

        VARIABLE_PATTERN
            .replace_all(input, |caps: &Captures| {
                let name = caps[1].trim();
                self.get_variable(name)
                    .map(str::to_string)
                    .or_else(|| self.builtin(name))
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Request body with every reference resolved.
    pub fn render_body(&self, body: &RequestBody) -> String {
        match body {
            RequestBody::Raw(text) => self.substitute_variables(text),
            RequestBody::Json(value) => self.substitute_json(value).to_string(),
        }
    }

    fn substitute_json(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute_variables(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.substitute_json(v)).collect()),
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (self.substitute_variables(k), self.substitute_json(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn builtin(&self, name: &str) -> Option<String> {
        if let Some(options) = name.strip_prefix("pick:") {
            let choices: Vec<&str> = options.split('|').collect();
            return choices
                .choose(&mut rand::thread_rng())
                .map(|c| c.to_string());
        }

        let value = match name {
            "timestamp" => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0)
                .to_string(),
            "randomString" => random_string(8),
            "randomCpf" => random_cpf(),
            "randomPhone" => random_phone(),
            "randomInt" => rand::thread_rng().gen_range(0..1_000_000u32).to_string(),
            "vu" => self.vu_id.to_string(),
            "iteration" => self.iteration.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// One simulated concurrent client.
#[derive(Debug)]
pub struct VirtualUser {
    pub id: usize,

    /// Completed scenario passes
    pub iteration: u64,

    pub state: ScenarioContext,
}

impl VirtualUser {
    pub fn new(id: usize, run: Arc<RunContext>) -> Self {
        Self {
            id,
            iteration: 0,
            state: ScenarioContext::new(run, id),
        }
    }
}
