//! Scenario execution engine.
//!
//! Runs one scenario pass for a virtual user: steps in order, each request
//! built from the user's variables, checked, recorded and then mined for new
//! variables. Failures never stop a pass; they only show up in metrics.

use crate::checks::{run_checks, Check};
use crate::client::{HttpClient, HttpRequest, HttpResponse};
use crate::clock::Clock;
use crate::collector::{names, MetricSample, MetricsCollector};
use crate::errors::{ErrorCategory, TransportError};
use crate::extractor;
use crate::metrics::{
    CONCURRENT_REQUESTS, REQUEST_DURATION_SECONDS, REQUEST_ERRORS_BY_CATEGORY,
    REQUEST_STATUS_CODES, REQUEST_TOTAL, SCENARIO_DURATION_SECONDS, SCENARIO_EXECUTIONS_TOTAL,
    SCENARIO_STEPS_TOTAL,
};
use crate::scenario::{Scenario, ScenarioContext, Step, ThinkTime, VirtualUser};
use crate::selector::ScenarioSelector;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Result of executing a single step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_name: String,

    /// HTTP status received; 0 for transport failures, `None` when skipped
    pub status_code: Option<u16>,

    pub response_time: Duration,

    /// Checks passed (vacuously true when there were none)
    pub checks_passed: bool,

    /// Request succeeded with a 2xx and all checks passed
    pub success: bool,

    /// Precondition unmet even after any fallback
    pub skipped: bool,

    /// A fallback step was run before this one
    pub fallback_ran: bool,

    pub error: Option<String>,

    /// Set when no HTTP response was received
    pub transport_error: Option<TransportError>,
}

impl StepResult {
    fn skipped(step: &Step, fallback_ran: bool, missing: &str) -> Self {
        Self {
            step_name: step.name.clone(),
            status_code: None,
            response_time: Duration::ZERO,
            checks_passed: true,
            success: false,
            skipped: true,
            fallback_ran,
            error: Some(format!("precondition unmet: '{}' not set", missing)),
            transport_error: None,
        }
    }
}

/// Result of one complete scenario pass.
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub scenario_name: String,

    /// Every executed step succeeded
    pub success: bool,

    pub steps: Vec<StepResult>,

    /// Wall time of the pass, think times included
    pub duration: Duration,
}

impl ScenarioOutcome {
    pub fn steps_executed(&self) -> usize {
        self.steps.iter().filter(|s| !s.skipped).count()
    }

    /// Requests issued during the pass, fallbacks included.
    pub fn requests_sent(&self) -> usize {
        self.steps
            .iter()
            .map(|s| usize::from(!s.skipped) + usize::from(s.fallback_ran))
            .sum()
    }

    pub fn steps_skipped(&self) -> usize {
        self.steps.iter().filter(|s| s.skipped).count()
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_name == name)
    }
}

/// Shared by every worker of a run.
pub struct ScenarioEngine {
    /// Base URL for relative request paths (e.g. "http://localhost/api")
    base_url: String,

    client: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    collector: Arc<MetricsCollector>,
    selector: ScenarioSelector,
    request_timeout: Duration,
}

impl ScenarioEngine {
    pub fn new(
        base_url: impl Into<String>,
        client: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        collector: Arc<MetricsCollector>,
        selector: ScenarioSelector,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            clock,
            collector,
            selector,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn selector(&self) -> &ScenarioSelector {
        &self.selector
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Draws a scenario from the weight table and runs it once.
    pub async fn run_scenario(&self, vu: &mut VirtualUser) -> ScenarioOutcome {
        let scenario = self.selector.select();
        self.execute(scenario, vu).await
    }

    /// Runs `scenario` once for `vu`. Never aborts early.
    pub async fn execute(&self, scenario: &Scenario, vu: &mut VirtualUser) -> ScenarioOutcome {
        vu.iteration += 1;
        vu.state.begin_iteration(vu.iteration, scenario);

        let start = self.clock.now();
        let mut steps = Vec::with_capacity(scenario.steps.len());

        debug!(
            vu = vu.id,
            iteration = vu.iteration,
            scenario = %scenario.name,
            steps = scenario.steps.len(),
            "Starting scenario"
        );

        let mut group: Option<(&str, Instant)> = None;
        for step in &scenario.steps {
            if group.map(|(name, _)| name) != step.group.as_deref() {
                self.close_group(group.take());
                group = step.group.as_deref().map(|name| (name, self.clock.now()));
            }

            let result = self.execute_step(&scenario.name, step, &mut vu.state).await;
            let skipped = result.skipped;
            steps.push(result);

            if !skipped {
                if let Some(think_time) = &step.think_time {
                    self.think(&scenario.name, &step.name, think_time).await;
                }
            }
        }

        self.close_group(group);

        let duration = self.clock.now() - start;
        let success = steps.iter().filter(|s| !s.skipped).all(|s| s.success);

        self.collector.add_counter(names::ITERATIONS, 1);
        self.collector.add_trend(names::ITERATION_DURATION, duration);

        SCENARIO_DURATION_SECONDS
            .with_label_values(&[&scenario.name])
            .observe(duration.as_secs_f64());
        SCENARIO_EXECUTIONS_TOTAL
            .with_label_values(&[&scenario.name, if success { "success" } else { "failed" }])
            .inc();

        let outcome = ScenarioOutcome {
            scenario_name: scenario.name.clone(),
            success,
            steps,
            duration,
        };

        debug!(
            vu = vu.id,
            scenario = %scenario.name,
            success,
            executed = outcome.steps_executed(),
            skipped = outcome.steps_skipped(),
            duration_ms = duration.as_millis() as u64,
            "Scenario finished"
        );

        outcome
    }

    /// Runs one step, honouring its precondition and fallback.
    async fn execute_step(
        &self,
        scenario_name: &str,
        step: &Step,
        ctx: &mut ScenarioContext,
    ) -> StepResult {
        let mut fallback_ran = false;

        if let Some(precondition) = &step.precondition {
            if missing_variable(&precondition.requires, ctx).is_some() {
                if let Some(fallback) = &precondition.fallback {
                    debug!(
                        scenario = %scenario_name,
                        step = %step.name,
                        fallback = %fallback.name,
                        "Precondition unmet, running fallback"
                    );
                    self.collector.add_counter(names::FALLBACKS, 1);
                    self.perform(scenario_name, fallback, ctx).await;
                    fallback_ran = true;
                    if let Some(think_time) = &fallback.think_time {
                        self.think(scenario_name, &fallback.name, think_time).await;
                    }
                }

                if let Some(missing) = missing_variable(&precondition.requires, ctx) {
                    debug!(
                        scenario = %scenario_name,
                        step = %step.name,
                        missing = %missing,
                        "Skipping step"
                    );
                    self.collector.add_counter(names::STEPS_SKIPPED, 1);
                    SCENARIO_STEPS_TOTAL
                        .with_label_values(&[scenario_name, &step.name, "skipped"])
                        .inc();
                    return StepResult::skipped(step, fallback_ran, missing);
                }
            }
        }

        let mut result = self.perform(scenario_name, step, ctx).await;
        result.fallback_ran = fallback_ran;
        result
    }

    /// Sends the step's request and records everything about it. Ignores the
    /// step's precondition.
    pub async fn perform(
        &self,
        scenario_name: &str,
        step: &Step,
        ctx: &mut ScenarioContext,
    ) -> StepResult {
        let response = match self.build_request(step, ctx) {
            Ok(request) => {
                debug!(
                    step = %step.name,
                    method = %request.method,
                    url = %request.url,
                    "Making HTTP request"
                );
                CONCURRENT_REQUESTS.inc();
                let response = self.client.send(request).await;
                CONCURRENT_REQUESTS.dec();
                response
            }
            Err(message) => HttpResponse::transport_failure(
                TransportError::new(ErrorCategory::OtherError, message),
                Duration::ZERO,
            ),
        };

        self.record_response(step, &response);

        let checks: Vec<Check> = step
            .checks
            .iter()
            .map(|c| c.resolve(|s| ctx.substitute_variables(s)))
            .collect();
        let checks_passed = run_checks(&response, &checks, &self.collector);
        let success = response.is_success() && checks_passed;

        if let Some(rate) = &step.failure_rate {
            self.collector.add_rate(rate, !success);
        }

        if response.error.is_none() {
            for (extraction, value) in extractor::extract_variables(&step.extractions, &response) {
                ctx.set_variable(extraction.name.clone(), value, extraction.scope);
            }
        }

        SCENARIO_STEPS_TOTAL
            .with_label_values(&[scenario_name, &step.name, if success { "success" } else { "failed" }])
            .inc();

        let error = match &response.error {
            Some(e) => {
                warn!(
                    scenario = %scenario_name,
                    step = %step.name,
                    error = %e,
                    response_time_ms = response.elapsed.as_millis() as u64,
                    "Request failed"
                );
                Some(e.to_string())
            }
            None if !response.is_success() => Some(format!("HTTP {}", response.status)),
            None if !checks_passed => Some("checks failed".to_string()),
            None => None,
        };

        debug!(
            step = %step.name,
            status_code = response.status,
            success,
            response_time_ms = response.elapsed.as_millis() as u64,
            "Step execution complete"
        );

        StepResult {
            step_name: step.name.clone(),
            status_code: Some(response.status),
            response_time: response.elapsed,
            checks_passed,
            success,
            skipped: false,
            fallback_ran: false,
            error,
            transport_error: response.error.clone(),
        }
    }

    fn build_request(&self, step: &Step, ctx: &ScenarioContext) -> Result<HttpRequest, String> {
        let path = ctx.substitute_variables(&step.request.path);
        let url = if path.starts_with("http://") || path.starts_with("https://") {
            path
        } else {
            format!("{}{}", self.base_url, path)
        };

        let mut url = reqwest::Url::parse(&url).map_err(|e| format!("invalid URL '{}': {}", url, e))?;
        if !step.request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &step.request.query {
                pairs.append_pair(name, &ctx.substitute_variables(value));
            }
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &step.request.headers {
            let value = ctx.substitute_variables(value);
            let header_name =
                HeaderName::from_str(name).map_err(|e| format!("invalid header name '{}': {}", name, e))?;
            let header_value = HeaderValue::from_str(&value)
                .map_err(|e| format!("invalid value for header '{}': {}", name, e))?;
            headers.insert(header_name, header_value);
        }

        Ok(HttpRequest {
            method: step.request.method.clone(),
            url: url.into(),
            headers,
            body: step.request.body.as_ref().map(|b| ctx.render_body(b)),
            timeout: self.request_timeout,
        })
    }

    fn record_response(&self, step: &Step, response: &HttpResponse) {
        let mut samples = vec![
            MetricSample::Counter(names::HTTP_REQS.to_string(), 1),
            MetricSample::Trend(names::HTTP_REQ_DURATION.to_string(), response.elapsed),
            MetricSample::Rate(names::HTTP_REQ_FAILED.to_string(), !response.is_success()),
        ];
        if let Some(trend) = &step.trend {
            samples.push(MetricSample::Trend(trend.clone(), response.elapsed));
        }

        REQUEST_TOTAL.inc();
        REQUEST_STATUS_CODES
            .with_label_values(&[&response.status.to_string()])
            .inc();
        REQUEST_DURATION_SECONDS.observe(response.elapsed.as_secs_f64());

        if let Some(category) = response.error_category() {
            samples.push(MetricSample::Counter(names::http_errors(category.label()), 1));
            REQUEST_ERRORS_BY_CATEGORY
                .with_label_values(&[category.label()])
                .inc();
        }

        self.collector.add_all(samples);
    }

    fn close_group(&self, group: Option<(&str, Instant)>) {
        if let Some((name, started)) = group {
            self.collector
                .add_trend(&names::group_duration(name), self.clock.now() - started);
        }
    }

    async fn think(&self, scenario_name: &str, step_name: &str, think_time: &ThinkTime) {
        let delay = think_time.calculate_delay();
        debug!(
            scenario = %scenario_name,
            step = %step_name,
            think_time_ms = delay.as_millis() as u64,
            "Applying think time"
        );
        self.clock.sleep(delay).await;
    }
}

fn missing_variable<'a>(requires: &'a [String], ctx: &ScenarioContext) -> Option<&'a str> {
    requires
        .iter()
        .find(|name| !ctx.has_variable(name))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::CheckKind;
    use crate::clock::TokioClock;
    use crate::scenario::{RequestConfig, RunContext, VariableExtraction};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers by path; records every request it saw.
    struct StubClient {
        routes: HashMap<String, HttpResponse>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl StubClient {
        fn new(routes: Vec<(&str, HttpResponse)>) -> Self {
            Self {
                routes: routes
                    .into_iter()
                    .map(|(p, r)| (p.to_string(), r))
                    .collect(),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn paths(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|r| {
                    let url = reqwest::Url::parse(&r.url).unwrap();
                    url.path().to_string()
                })
                .collect()
        }
    }

    #[async_trait]
    impl HttpClient for StubClient {
        async fn send(&self, request: HttpRequest) -> HttpResponse {
            let path = reqwest::Url::parse(&request.url).unwrap().path().to_string();
            self.seen.lock().unwrap().push(request);
            self.routes
                .get(&path)
                .cloned()
                .unwrap_or_else(|| HttpResponse::new(404, ""))
        }
    }

    fn build_engine(client: Arc<StubClient>, scenarios: Vec<Scenario>) -> (ScenarioEngine, Arc<MetricsCollector>) {
        let collector = Arc::new(MetricsCollector::new());
        let engine = ScenarioEngine::new(
            "http://sut.local/api/",
            client,
            Arc::new(TokioClock),
            Arc::clone(&collector),
            ScenarioSelector::new(scenarios).unwrap(),
        );
        (engine, collector)
    }

    fn vu_with(vars: &[(&str, &str)]) -> VirtualUser {
        let run = RunContext::new(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        VirtualUser::new(1, Arc::new(run))
    }

    fn crud_scenario() -> Scenario {
        Scenario::new("students", 1.0)
            .with_step(
                Step::new("list", RequestConfig::get("/students").with_header("Authorization", "Bearer ${token}"))
                    .with_check(Check::status("list 200", 200)),
            )
            .with_step(
                Step::new("create", RequestConfig::post("/students").with_json(json!({})))
                    .with_check(Check::new("created", CheckKind::Status(vec![200, 201])))
                    .with_extraction(VariableExtraction::json("student_id", "$.id")),
            )
            .with_step(
                Step::new("get", RequestConfig::get("/students/${student_id}"))
                    .requires(&["student_id"])
                    .with_check(Check::status("get 200", 200)),
            )
    }

    #[tokio::test]
    async fn dependent_step_runs_when_create_succeeds() {
        let client = Arc::new(StubClient::new(vec![
            ("/api/students", HttpResponse::new(201, r#"{"id": 42}"#)),
            ("/api/students/42", HttpResponse::new(200, "{}")),
        ]));
        let (engine, collector) = build_engine(Arc::clone(&client), vec![crud_scenario()]);
        let mut vu = vu_with(&[("token", "admin-token")]);

        let outcome = engine.run_scenario(&mut vu).await;

        assert_eq!(client.paths(), vec!["/api/students", "/api/students", "/api/students/42"]);
        assert_eq!(outcome.steps_skipped(), 0);
        assert!(!outcome.step("get").unwrap().skipped);
        assert_eq!(collector.counter(names::HTTP_REQS), 3);
        assert_eq!(collector.counter(names::ITERATIONS), 1);

        let auth = client.seen.lock().unwrap()[0].headers["authorization"].clone();
        assert_eq!(auth, "Bearer admin-token");
    }

    #[tokio::test]
    async fn dependent_step_skipped_when_create_fails() {
        let client = Arc::new(StubClient::new(vec![(
            "/api/students",
            HttpResponse::new(500, "boom"),
        )]));
        let (engine, collector) = build_engine(Arc::clone(&client), vec![crud_scenario()]);
        let mut vu = vu_with(&[("token", "t")]);

        let outcome = engine.run_scenario(&mut vu).await;

        assert_eq!(client.paths().len(), 2);
        assert!(outcome.step("get").unwrap().skipped);
        assert!(!outcome.success);
        assert_eq!(collector.counter(names::STEPS_SKIPPED), 1);
        let failed = collector.rate(names::HTTP_REQ_FAILED).unwrap();
        assert_eq!((failed.trues, failed.total), (2, 2));
    }

    #[tokio::test]
    async fn iteration_scope_is_reset_between_passes() {
        let client = Arc::new(StubClient::new(vec![(
            "/api/students",
            HttpResponse::new(201, r#"{"id": 1}"#),
        )]));
        let (engine, _) = build_engine(Arc::clone(&client), vec![crud_scenario()]);
        let mut vu = vu_with(&[]);

        engine.run_scenario(&mut vu).await;
        assert_eq!(vu.state.get_variable("student_id"), Some("1"));
        assert_eq!(vu.iteration, 1);

        // second pass: create now fails, the old id must not leak into "get"
        let failing = Arc::new(StubClient::new(vec![]));
        let (engine, _) = build_engine(Arc::clone(&failing), vec![crud_scenario()]);
        let outcome = engine.run_scenario(&mut vu).await;
        assert!(outcome.step("get").unwrap().skipped);
        assert_eq!(vu.iteration, 2);
    }

    #[tokio::test]
    async fn fallback_runs_before_guarded_step() {
        let login = Step::new("login", RequestConfig::post("/auth/login").with_json(json!({})))
            .with_extraction(VariableExtraction::json("token", "$.token").user_scoped());
        let scenario = Scenario::new("me", 1.0).with_step(
            Step::new("me", RequestConfig::get("/auth/me").with_header("Authorization", "Bearer ${token}"))
                .requires(&["token"])
                .with_fallback(login),
        );
        let client = Arc::new(StubClient::new(vec![
            ("/api/auth/login", HttpResponse::new(200, r#"{"token": "abc"}"#)),
            ("/api/auth/me", HttpResponse::new(200, "{}")),
        ]));
        let (engine, collector) = build_engine(Arc::clone(&client), vec![scenario]);
        let mut vu = vu_with(&[]);

        let outcome = engine.run_scenario(&mut vu).await;
        assert!(outcome.step("me").unwrap().fallback_ran);
        assert_eq!(client.paths(), vec!["/api/auth/login", "/api/auth/me"]);
        assert_eq!(collector.counter(names::FALLBACKS), 1);

        // token is user scoped, so the next pass needs no login
        engine.run_scenario(&mut vu).await;
        assert_eq!(client.paths().len(), 3);
    }

    #[tokio::test]
    async fn failed_fallback_skips_step() {
        let login = Step::new("login", RequestConfig::post("/auth/login"))
            .with_extraction(VariableExtraction::json("token", "$.token").user_scoped());
        let scenario = Scenario::new("me", 1.0).with_step(
            Step::new("me", RequestConfig::get("/auth/me"))
                .requires(&["token"])
                .with_fallback(login),
        );
        let client = Arc::new(StubClient::new(vec![(
            "/api/auth/login",
            HttpResponse::new(401, r#"{"error": "nope"}"#),
        )]));
        let (engine, _) = build_engine(Arc::clone(&client), vec![scenario]);
        let mut vu = vu_with(&[]);

        let outcome = engine.run_scenario(&mut vu).await;
        let me = outcome.step("me").unwrap();
        assert!(me.skipped && me.fallback_ran);
        assert_eq!(client.paths(), vec!["/api/auth/login"]);
    }

    #[tokio::test]
    async fn query_params_and_body_are_substituted() {
        let scenario = Scenario::new("search", 1.0)
            .with_variable("term", "ana")
            .with_step(Step::new(
                "search",
                RequestConfig::get("/students")
                    .with_query("search", "${term}")
                    .with_query("page", "1"),
            ))
            .with_step(Step::new(
                "create",
                RequestConfig::post("/students").with_json(json!({"name": "${term}"})),
            ));
        let client = Arc::new(StubClient::new(vec![]));
        let (engine, _) = build_engine(Arc::clone(&client), vec![scenario]);
        let mut vu = vu_with(&[]);

        engine.run_scenario(&mut vu).await;

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].url, "http://sut.local/api/students?search=ana&page=1");
        assert_eq!(seen[1].body.as_deref(), Some(r#"{"name":"ana"}"#));
    }

    #[tokio::test]
    async fn invalid_header_is_recorded_as_failed_request() {
        let scenario = Scenario::new("bad", 1.0).with_step(Step::new(
            "bad header",
            RequestConfig::get("/x").with_header("Bad Header", "v"),
        ));
        let client = Arc::new(StubClient::new(vec![]));
        let (engine, collector) = build_engine(Arc::clone(&client), vec![scenario]);

        let outcome = engine.run_scenario(&mut vu_with(&[])).await;

        assert!(client.paths().is_empty());
        assert_eq!(outcome.steps[0].status_code, Some(0));
        assert_eq!(collector.counter("http_errors.other_error"), 1);
    }

    #[tokio::test]
    async fn step_trend_and_failure_rate_are_recorded() {
        let mut step = Step::new("create", RequestConfig::post("/students"))
            .with_check(Check::status("created", 201))
            .with_trend("student_creation_duration");
        step.failure_rate = Some("failed_requests".into());
        let client = Arc::new(StubClient::new(vec![(
            "/api/students",
            HttpResponse::new(201, "{}").with_elapsed(Duration::from_millis(80)),
        )]));
        let (engine, collector) = build_engine(client, vec![Scenario::new("c", 1.0).with_step(step)]);

        engine.run_scenario(&mut vu_with(&[])).await;

        let trend = collector.trend("student_creation_duration").unwrap();
        assert_eq!(trend.count(), 1);
        assert!((trend.max_ms() - 80.0).abs() < 0.1);
        assert_eq!(collector.rate("failed_requests").unwrap().trues, 0);
    }

    #[tokio::test]
    async fn idle_scenario_counts_an_iteration() {
        let client = Arc::new(StubClient::new(vec![]));
        let (engine, collector) = build_engine(Arc::clone(&client), vec![Scenario::new("idle", 1.0)]);

        let outcome = engine.run_scenario(&mut vu_with(&[])).await;

        assert!(outcome.success);
        assert!(client.paths().is_empty());
        assert_eq!(collector.counter(names::ITERATIONS), 1);
    }

    #[tokio::test]
    async fn extracted_quotes_stay_valid_json() {
        let client = Arc::new(StubClient::new(vec![(
            "/api/profile",
            HttpResponse::new(200, r#"{"name": "Ana \"Jr\" \\ Lima"}"#),
        )]));
        let scenario = Scenario::new("profile", 1.0)
            .with_step(
                Step::new("profile", RequestConfig::get("/profile"))
                    .with_extraction(VariableExtraction::json("name", "$.name")),
            )
            .with_step(Step::new(
                "rename",
                RequestConfig::post("/students").with_json(json!({"name": "${name}"})),
            ));
        let (engine, _) = build_engine(Arc::clone(&client), vec![scenario]);
        let mut vu = vu_with(&[]);

        engine.run_scenario(&mut vu).await;

        let seen = client.seen.lock().unwrap();
        let body: serde_json::Value = serde_json::from_str(seen[1].body.as_deref().unwrap()).unwrap();
        assert_eq!(body["name"], r#"Ana "Jr" \ Lima"#);
    }

    #[tokio::test(start_paused = true)]
    async fn contiguous_group_is_timed_once_per_pass() {
        let client = Arc::new(StubClient::new(vec![
            ("/api/students", HttpResponse::new(200, "[]")),
            ("/api/classes", HttpResponse::new(200, "[]")),
        ]));
        let scenario = Scenario::new("school", 1.0)
            .with_step(
                Step::new("list students", RequestConfig::get("/students"))
                    .in_group("Students CRUD")
                    .with_think_time(ThinkTime::Fixed(Duration::from_secs(1))),
            )
            .with_step(Step::new("list again", RequestConfig::get("/students")).in_group("Students CRUD"))
            .with_step(Step::new("list classes", RequestConfig::get("/classes")).in_group("Classes"))
            .with_step(Step::new("ungrouped", RequestConfig::get("/classes")));
        let (engine, collector) = build_engine(client, vec![scenario]);

        engine.run_scenario(&mut vu_with(&[])).await;

        let students = collector.trend(&names::group_duration("Students CRUD")).unwrap();
        assert_eq!(students.count(), 1);
        assert!(students.max_ms() >= 1_000.0, "group took {}ms", students.max_ms());
        assert_eq!(collector.trend(&names::group_duration("Classes")).unwrap().count(), 1);
        assert!(collector.trend("group_duration.").is_none());
    }

    #[tokio::test]
    async fn failure_rate_counts_non_2xx_without_checks() {
        let client = Arc::new(StubClient::new(vec![("/api/students", HttpResponse::new(200, "[]"))]));
        let scenario = Scenario::new("mixed", 1.0)
            .with_step(Step::new("ok", RequestConfig::get("/students")).with_failure_rate("failed_requests"))
            .with_step(Step::new("missing", RequestConfig::get("/nope")).with_failure_rate("failed_requests"));
        let (engine, collector) = build_engine(client, vec![scenario]);

        engine.run_scenario(&mut vu_with(&[])).await;

        let rate = collector.rate("failed_requests").unwrap();
        assert_eq!(rate.total, 2);
        assert_eq!(rate.trues, 1);
    }
}
