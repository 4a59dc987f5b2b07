//! YAML test plans.
//!
//! A plan file declares the ramp stages, weighted scenarios, thresholds and
//! setup/teardown steps. [`YamlConfig::from_str`] parses and validates;
//! [`YamlConfig::to_plan`] turns the document into a runnable [`TestPlan`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration as StdDuration;
use thiserror::Error;

use crate::checks::{Check, CheckKind};
use crate::config_validation::{
    DurationValidator, HttpMethodValidator, StageValidator, ThresholdValidator, UrlValidator,
    ValidationContext, VersionValidator, WeightValidator,
};
use crate::plan::{RunSettings, SetupPhase, TestPlan};
use crate::ramp::{RampProfile, Stage};
use crate::scenario::{
    ExtractScope, Extractor, RequestBody, RequestConfig, Scenario, Step, ThinkTime,
    VariableExtraction,
};
use crate::thresholds::Threshold;

#[derive(Error, Debug)]
pub enum YamlConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Duration format for YAML (e.g., "500ms", "30s", "5m", or bare seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlDuration {
    Seconds(u64),
    String(String),
}

impl YamlDuration {
    pub fn to_std_duration(&self) -> Result<StdDuration, YamlConfigError> {
        match self {
            YamlDuration::Seconds(s) => Ok(StdDuration::from_secs(*s)),
            YamlDuration::String(s) => crate::utils::parse_duration_string(s)
                .map_err(|e| YamlConfigError::Validation(format!("Invalid duration '{}': {}", s, e))),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            YamlDuration::Seconds(_) => Ok(()),
            YamlDuration::String(s) => DurationValidator::validate(s).map_err(|e| e.to_string()),
        }
    }

    /// Like `validate`, but zero is rejected too.
    fn validate_positive(&self) -> Result<(), String> {
        match self {
            YamlDuration::Seconds(0) => Err("duration must be greater than zero".to_string()),
            YamlDuration::Seconds(_) => Ok(()),
            YamlDuration::String(s) => DurationValidator::validate_positive(s).map_err(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct YamlMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlGlobalConfig {
    #[serde(rename = "baseUrl")]
    pub base_url: String,

    #[serde(default = "default_timeout")]
    pub timeout: YamlDuration,

    /// Scheduler reconciliation interval
    #[serde(default = "default_tick")]
    pub tick: YamlDuration,

    #[serde(rename = "gracefulStop", default = "default_graceful_stop")]
    pub graceful_stop: YamlDuration,

    #[serde(rename = "thresholdInterval", default = "default_threshold_interval")]
    pub threshold_interval: YamlDuration,

    /// Pause after an unpaced pass that sent no request
    #[serde(rename = "idleInterval", default = "default_idle_interval")]
    pub idle_interval: YamlDuration,

    #[serde(rename = "skipTlsVerify", default)]
    pub skip_tls_verify: bool,

    /// Comma-separated `Name:Value` headers sent with every request
    #[serde(rename = "customHeaders")]
    pub custom_headers: Option<String>,

    /// Seed variables for the run context (e.g. admin_email)
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,

    /// Rate fed by every scenario step that has none of its own
    #[serde(rename = "failureRate")]
    pub failure_rate: Option<String>,
}

fn default_timeout() -> YamlDuration {
    YamlDuration::Seconds(30)
}

fn default_tick() -> YamlDuration {
    YamlDuration::Seconds(1)
}

fn default_graceful_stop() -> YamlDuration {
    YamlDuration::Seconds(30)
}

fn default_threshold_interval() -> YamlDuration {
    YamlDuration::Seconds(2)
}

fn default_idle_interval() -> YamlDuration {
    YamlDuration::String("100ms".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlStage {
    pub duration: YamlDuration,
    pub target: u32,
}

/// Think time: fixed (`"2s"`) or a random `{min, max}` range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlThinkTime {
    Fixed(YamlDuration),
    Random { min: YamlDuration, max: YamlDuration },
}

impl YamlThinkTime {
    pub fn to_think_time(&self) -> Result<ThinkTime, YamlConfigError> {
        match self {
            YamlThinkTime::Fixed(duration) => Ok(ThinkTime::Fixed(duration.to_std_duration()?)),
            YamlThinkTime::Random { min, max } => Ok(ThinkTime::Random {
                min: min.to_std_duration()?,
                max: max.to_std_duration()?,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlScenario {
    pub name: String,

    #[serde(default = "default_weight")]
    pub weight: f64,

    /// Templates evaluated at the start of every iteration, in order
    #[serde(default)]
    pub variables: Vec<YamlVariable>,

    #[serde(default)]
    pub steps: Vec<YamlStep>,

    pub pacing: Option<YamlThinkTime>,

    /// Group for steps that do not name one
    pub group: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlStep {
    pub name: Option<String>,

    pub request: YamlRequest,

    #[serde(default)]
    pub checks: Vec<YamlCheck>,

    #[serde(default)]
    pub extract: Vec<YamlExtraction>,

    /// Variables that must be set for the step to run
    #[serde(default)]
    pub requires: Vec<String>,

    /// Step run first when a required variable is missing
    pub fallback: Option<Box<YamlStep>>,

    #[serde(rename = "thinkTime")]
    pub think_time: Option<YamlThinkTime>,

    /// Extra trend receiving this step's latency
    pub trend: Option<String>,

    /// Extra rate receiving `true` when this step fails
    #[serde(rename = "failureRate")]
    pub failure_rate: Option<String>,

    /// Steps in the same group get one `group_duration.<group>` sample per pass
    pub group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlRequest {
    pub method: String,
    pub path: String,

    #[serde(rename = "queryParams", default)]
    pub query_params: BTreeMap<String, String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Raw body
    pub body: Option<String>,

    /// Structured body, sent as JSON
    pub json: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum YamlScope {
    #[default]
    Iteration,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlExtraction {
    #[serde(flatten)]
    pub extractor: YamlExtractor,

    #[serde(default)]
    pub scope: YamlScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum YamlExtractor {
    #[serde(rename = "jsonPath")]
    JsonPath {
        name: String,
        #[serde(rename = "jsonPath")]
        json_path: String,
    },
    Regex {
        name: String,
        regex: String,
        #[serde(default = "default_regex_group")]
        group: String,
    },
    Header {
        name: String,
        header: String,
    },
    Cookie {
        name: String,
        cookie: String,
    },
}

fn default_regex_group() -> String {
    "value".to_string()
}

/// One or several accepted status codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlStatusCodes {
    One(u16),
    Many(Vec<u16>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlCheck {
    /// Defaults to a description of the check
    pub name: Option<String>,

    #[serde(flatten)]
    pub kind: YamlCheckKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum YamlCheckKind {
    #[serde(rename = "statusCode")]
    StatusCode { expected: YamlStatusCodes },
    #[serde(rename = "responseTime")]
    ResponseTime { max: YamlDuration },
    #[serde(rename = "jsonPath")]
    JsonPath {
        path: String,
        expected: Option<String>,
    },
    #[serde(rename = "isArray")]
    IsArray { path: String },
    #[serde(rename = "bodyContains")]
    BodyContains { text: String },
    #[serde(rename = "bodyMatches")]
    BodyMatches { regex: String },
    #[serde(rename = "headerExists")]
    HeaderExists { header: String },
}

/// `"rate<0.05"` or `{threshold: "rate<0.05", abortOnFail: true}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlThresholdEntry {
    Expression(String),
    Detailed {
        threshold: String,
        #[serde(rename = "abortOnFail", default)]
        abort_on_fail: bool,
    },
}

impl YamlThresholdEntry {
    fn parts(&self) -> (&str, bool) {
        match self {
            YamlThresholdEntry::Expression(expr) => (expr.as_str(), false),
            YamlThresholdEntry::Detailed {
                threshold,
                abort_on_fail,
            } => (threshold.as_str(), *abort_on_fail),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlThresholds {
    One(YamlThresholdEntry),
    Many(Vec<YamlThresholdEntry>),
}

impl YamlThresholds {
    fn entries(&self) -> Vec<&YamlThresholdEntry> {
        match self {
            YamlThresholds::One(entry) => vec![entry],
            YamlThresholds::Many(entries) => entries.iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct YamlSetup {
    #[serde(default)]
    pub steps: Vec<YamlStep>,

    /// Variables setup must produce
    #[serde(default)]
    pub require: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct YamlTeardown {
    #[serde(default)]
    pub steps: Vec<YamlStep>,
}

/// Root of a plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YamlConfig {
    pub version: String,

    #[serde(default)]
    pub metadata: YamlMetadata,

    pub config: YamlGlobalConfig,

    pub stages: Vec<YamlStage>,

    pub scenarios: Vec<YamlScenario>,

    /// Metric name to one or more threshold expressions
    #[serde(default)]
    pub thresholds: BTreeMap<String, YamlThresholds>,

    #[serde(default)]
    pub setup: YamlSetup,

    #[serde(default)]
    pub teardown: YamlTeardown,
}

impl YamlConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, YamlConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parses and validates a plan.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, YamlConfigError> {
        let config: YamlConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Collects every problem in the document before failing.
    pub fn validate(&self) -> Result<(), YamlConfigError> {
        let mut ctx = ValidationContext::new();

        ctx.enter("version");
        ctx.check(VersionValidator::validate(&self.version));
        ctx.exit();

        ctx.enter("config");
        ctx.enter("baseUrl");
        ctx.check(UrlValidator::validate(&self.config.base_url));
        ctx.exit();
        ctx.enter("gracefulStop");
        if let Err(e) = self.config.graceful_stop.validate() {
            ctx.field_error(e);
        }
        ctx.exit();
        for (field, duration) in [
            ("timeout", &self.config.timeout),
            ("tick", &self.config.tick),
            ("thresholdInterval", &self.config.threshold_interval),
            ("idleInterval", &self.config.idle_interval),
        ] {
            ctx.enter(field);
            if let Err(e) = duration.validate_positive() {
                ctx.field_error(e);
            }
            ctx.exit();
        }
        ctx.exit();

        ctx.enter("stages");
        let mut profile = Vec::with_capacity(self.stages.len());
        for (idx, stage) in self.stages.iter().enumerate() {
            ctx.enter(&format!("[{}]", idx));
            ctx.enter("duration");
            match stage.duration.to_std_duration() {
                Ok(d) => profile.push((d, stage.target)),
                Err(e) => ctx.field_error(e.to_string()),
            }
            ctx.exit();
            ctx.enter("target");
            ctx.check(StageValidator::validate_target(stage.target));
            ctx.exit();
            ctx.exit();
        }
        if profile.len() == self.stages.len() {
            ctx.check(StageValidator::validate_profile(&profile));
        }
        ctx.exit();

        ctx.enter("scenarios");
        if self.scenarios.is_empty() {
            ctx.field_error("At least one scenario must be defined".to_string());
        } else {
            let weights: Vec<f64> = self.scenarios.iter().map(|s| s.weight).collect();
            ctx.check(WeightValidator::validate_total(&weights));
        }
        for (idx, scenario) in self.scenarios.iter().enumerate() {
            ctx.enter(&format!("[{}]", idx));
            ctx.enter("name");
            if scenario.name.trim().is_empty() {
                ctx.field_error("Scenario name cannot be empty".to_string());
            }
            ctx.exit();

            ctx.enter("weight");
            ctx.check(WeightValidator::validate(scenario.weight));
            ctx.exit();

            Self::validate_steps(&mut ctx, "steps", &scenario.steps);
            ctx.exit();
        }
        ctx.exit();

        ctx.enter("thresholds");
        for (metric, spec) in &self.thresholds {
            ctx.enter(metric);
            for entry in spec.entries() {
                let (expression, _) = entry.parts();
                ctx.check(ThresholdValidator::validate(metric, expression));
            }
            ctx.exit();
        }
        ctx.exit();

        ctx.enter("setup");
        Self::validate_steps(&mut ctx, "steps", &self.setup.steps);
        ctx.exit();

        ctx.enter("teardown");
        Self::validate_steps(&mut ctx, "steps", &self.teardown.steps);
        ctx.exit();

        ctx.into_result()
            .map_err(|e| YamlConfigError::Validation(e.to_string()))
    }

    fn validate_steps(ctx: &mut ValidationContext, field: &str, steps: &[YamlStep]) {
        ctx.enter(field);
        for (idx, step) in steps.iter().enumerate() {
            ctx.enter(&format!("[{}]", idx));
            Self::validate_step(ctx, step);
            ctx.exit();
        }
        ctx.exit();
    }

    fn validate_step(ctx: &mut ValidationContext, step: &YamlStep) {
        ctx.enter("request");
        ctx.enter("method");
        ctx.check(HttpMethodValidator::validate(&step.request.method));
        ctx.exit();

        ctx.enter("path");
        if step.request.path.is_empty() {
            ctx.field_error("Request path cannot be empty".to_string());
        }
        ctx.exit();

        if step.request.body.is_some() && step.request.json.is_some() {
            ctx.field_error("Use either 'body' or 'json', not both".to_string());
        }
        ctx.exit();

        ctx.enter("checks");
        for (idx, check) in step.checks.iter().enumerate() {
            ctx.enter(&format!("[{}]", idx));
            match &check.kind {
                YamlCheckKind::BodyMatches { regex } => {
                    if let Err(e) = regex::Regex::new(regex) {
                        ctx.field_error(format!("Invalid regex: {}", e));
                    }
                }
                YamlCheckKind::ResponseTime { max } => {
                    if let Err(e) = max.validate() {
                        ctx.field_error(e);
                    }
                }
                _ => {}
            }
            ctx.exit();
        }
        ctx.exit();

        if step.fallback.is_some() && step.requires.is_empty() {
            ctx.enter("fallback");
            ctx.field_error("A fallback needs 'requires' to decide when it runs".to_string());
            ctx.exit();
        }

        if let Some(fallback) = &step.fallback {
            ctx.enter("fallback");
            Self::validate_step(ctx, fallback);
            ctx.exit();
        }
    }

    /// Builds the runnable plan.
    pub fn to_plan(&self) -> Result<TestPlan, YamlConfigError> {
        let stages = self
            .stages
            .iter()
            .map(|s| Ok(Stage::new(s.duration.to_std_duration()?, s.target)))
            .collect::<Result<Vec<_>, YamlConfigError>>()?;

        let settings = RunSettings {
            tick: self.config.tick.to_std_duration()?,
            graceful_stop: self.config.graceful_stop.to_std_duration()?,
            request_timeout: self.config.timeout.to_std_duration()?,
            threshold_interval: self.config.threshold_interval.to_std_duration()?,
            idle_interval: self.config.idle_interval.to_std_duration()?,
        };

        let name = self
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| "load test".to_string());

        let mut plan = TestPlan::new(name, self.config.base_url.clone(), RampProfile::new(stages))
            .with_settings(settings);

        plan.scenarios = self.to_scenarios()?;
        plan.thresholds = self.to_thresholds()?;
        plan.setup = SetupPhase {
            steps: Self::convert_steps(&self.setup.steps)?,
            require: self.setup.require.clone(),
        };
        plan.teardown = Self::convert_steps(&self.teardown.steps)?;
        plan.run_variables = self
            .config
            .credentials
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(plan)
    }

    pub fn to_scenarios(&self) -> Result<Vec<Scenario>, YamlConfigError> {
        let mut scenarios = Vec::with_capacity(self.scenarios.len());

        for yaml_scenario in &self.scenarios {
            let mut scenario = Scenario::new(yaml_scenario.name.clone(), yaml_scenario.weight);
            for variable in &yaml_scenario.variables {
                scenario = scenario.with_variable(variable.name.clone(), variable.value.clone());
            }
            scenario.steps = Self::convert_steps(&yaml_scenario.steps)?;
            for step in &mut scenario.steps {
                if step.group.is_none() {
                    step.group = yaml_scenario.group.clone();
                }
                if step.failure_rate.is_none() {
                    step.failure_rate = self.config.failure_rate.clone();
                }
            }
            if let Some(pacing) = &yaml_scenario.pacing {
                scenario = scenario.with_pacing(pacing.to_think_time()?);
            }
            scenarios.push(scenario);
        }

        Ok(scenarios)
    }

    pub fn to_thresholds(&self) -> Result<Vec<Threshold>, YamlConfigError> {
        let mut thresholds = Vec::new();
        for (metric, spec) in &self.thresholds {
            for entry in spec.entries() {
                let (expression, abort_on_fail) = entry.parts();
                let threshold = Threshold::parse(metric, expression)
                    .map_err(|e| YamlConfigError::Validation(e.to_string()))?
                    .with_abort_on_fail(abort_on_fail);
                thresholds.push(threshold);
            }
        }
        Ok(thresholds)
    }

    fn convert_steps(steps: &[YamlStep]) -> Result<Vec<Step>, YamlConfigError> {
        steps
            .iter()
            .enumerate()
            .map(|(idx, step)| Self::convert_step(step, idx))
            .collect()
    }

    fn convert_step(yaml_step: &YamlStep, idx: usize) -> Result<Step, YamlConfigError> {
        let step_name = yaml_step
            .name
            .clone()
            .unwrap_or_else(|| format!("Step {}", idx + 1));

        let method = reqwest::Method::from_bytes(yaml_step.request.method.to_uppercase().as_bytes())
            .map_err(|e| YamlConfigError::Validation(format!("step '{}': {}", step_name, e)))?;

        let mut request = RequestConfig::new(method, yaml_step.request.path.clone());
        for (k, v) in &yaml_step.request.query_params {
            request = request.with_query(k.clone(), v.clone());
        }
        if let Some(json) = &yaml_step.request.json {
            request = request.with_json(json.clone());
        } else if let Some(body) = &yaml_step.request.body {
            request.body = Some(RequestBody::Raw(body.clone()));
        }
        for (k, v) in &yaml_step.request.headers {
            request = request.with_header(k.clone(), v.clone());
        }

        let mut step = Step::new(step_name, request);

        for check in &yaml_step.checks {
            step = step.with_check(Self::convert_check(check)?);
        }
        for extraction in &yaml_step.extract {
            step = step.with_extraction(Self::convert_extraction(extraction));
        }

        if !yaml_step.requires.is_empty() {
            let requires: Vec<&str> = yaml_step.requires.iter().map(String::as_str).collect();
            step = step.requires(&requires);
        }
        if let Some(fallback) = &yaml_step.fallback {
            step = step.with_fallback(Self::convert_step(fallback, 0)?);
        }
        if let Some(think_time) = &yaml_step.think_time {
            step = step.with_think_time(think_time.to_think_time()?);
        }
        if let Some(trend) = &yaml_step.trend {
            step = step.with_trend(trend.clone());
        }
        step.failure_rate = yaml_step.failure_rate.clone();
        step.group = yaml_step.group.clone();

        Ok(step)
    }

    fn convert_extraction(extraction: &YamlExtraction) -> VariableExtraction {
        let (name, extractor) = match &extraction.extractor {
            YamlExtractor::JsonPath { name, json_path } => {
                (name.clone(), Extractor::JsonPath(json_path.clone()))
            }
            YamlExtractor::Regex { name, regex, group } => (
                name.clone(),
                Extractor::Regex {
                    pattern: regex.clone(),
                    group: group.clone(),
                },
            ),
            YamlExtractor::Header { name, header } => (name.clone(), Extractor::Header(header.clone())),
            YamlExtractor::Cookie { name, cookie } => (name.clone(), Extractor::Cookie(cookie.clone())),
        };

        VariableExtraction {
            name,
            extractor,
            scope: match extraction.scope {
                YamlScope::Iteration => ExtractScope::Iteration,
                YamlScope::User => ExtractScope::User,
            },
        }
    }

    fn convert_check(check: &YamlCheck) -> Result<Check, YamlConfigError> {
        let (default_name, kind) = match &check.kind {
            YamlCheckKind::StatusCode { expected } => {
                let codes = match expected {
                    YamlStatusCodes::One(code) => vec![*code],
                    YamlStatusCodes::Many(codes) => codes.clone(),
                };
                let listed: Vec<String> = codes.iter().map(u16::to_string).collect();
                (format!("status is {}", listed.join(" or ")), CheckKind::Status(codes))
            }
            YamlCheckKind::ResponseTime { max } => {
                let max = max.to_std_duration()?;
                (
                    format!("response time < {}ms", max.as_millis()),
                    CheckKind::MaxDuration(max),
                )
            }
            YamlCheckKind::JsonPath { path, expected } => {
                let name = match expected {
                    Some(value) => format!("{} is {}", path, value),
                    None => format!("has {}", path),
                };
                (
                    name,
                    CheckKind::JsonPath {
                        path: path.clone(),
                        expected: expected.clone(),
                    },
                )
            }
            YamlCheckKind::IsArray { path } => {
                (format!("{} is an array", path), CheckKind::IsArray(path.clone()))
            }
            YamlCheckKind::BodyContains { text } => (
                format!("body contains '{}'", text),
                CheckKind::BodyContains(text.clone()),
            ),
            YamlCheckKind::BodyMatches { regex } => (
                format!("body matches '{}'", regex),
                CheckKind::BodyMatches(regex.clone()),
            ),
            YamlCheckKind::HeaderExists { header } => (
                format!("has header {}", header),
                CheckKind::HeaderExists(header.clone()),
            ),
        };

        Ok(Check::new(check.name.clone().unwrap_or(default_name), kind))
    }
}
