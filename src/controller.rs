//! Run lifecycle: setup, ramp, teardown and the final verdict.
//!
//! The controller moves through `Idle → SettingUp → Running → TearingDown →
//! Completed`, publishing every state on a watch channel. A failed or
//! interrupted setup goes straight to `Completed(Failed)`; nothing else aborts
//! the lifecycle.

use crate::client::HttpClient;
use crate::clock::{Clock, TokioClock};
use crate::collector::{MetricsCollector, MetricsSnapshot};
use crate::engine::ScenarioEngine;
use crate::errors::SetupError;
use crate::metrics::THRESHOLD_VIOLATIONS;
use crate::plan::TestPlan;
use crate::scenario::{RunContext, ScenarioContext};
use crate::scheduler::{signalled, RampScheduler, SchedulerSummary};
use crate::selector::{ScenarioSelector, SelectorError};
use crate::thresholds::{self, ThresholdReport, Violation};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SETUP_SCENARIO: &str = "setup";
const TEARDOWN_SCENARIO: &str = "teardown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    SettingUp,
    Running,
    TearingDown,
    Completed(Verdict),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub state: RunState,

    /// Time since the run started
    pub at: Duration,
}

/// Why the ramp stopped before its profile ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StopReason {
    /// Abort-on-fail thresholds crossed, as `metric: expression`
    ThresholdAbort(Vec<String>),
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan: String,
    pub passed: bool,
    pub verdict: Verdict,

    #[serde(serialize_with = "serialize_setup_error")]
    pub setup_error: Option<SetupError>,

    pub stop_reason: Option<StopReason>,
    pub violations: Vec<Violation>,
    pub thresholds_evaluated: usize,
    pub metrics: MetricsSnapshot,

    /// Absent when the ramp never started
    pub scheduler: Option<SchedulerSummary>,

    pub transitions: Vec<StateTransition>,
    pub duration: Duration,
}

fn serialize_setup_error<S: Serializer>(
    error: &Option<SetupError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Requests an early, graceful end of the run. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

pub struct RunController {
    plan: TestPlan,
    engine: Arc<ScenarioEngine>,
    collector: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<RunState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    transitions: Vec<StateTransition>,
}

impl RunController {
    pub fn new(plan: TestPlan, client: Arc<dyn HttpClient>) -> Result<Self, SelectorError> {
        Self::with_clock(plan, client, Arc::new(TokioClock))
    }

    pub fn with_clock(
        plan: TestPlan,
        client: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SelectorError> {
        let collector = Arc::new(MetricsCollector::new());
        let selector = ScenarioSelector::new(plan.scenarios.clone())?;
        let engine = ScenarioEngine::new(
            plan.base_url.clone(),
            client,
            Arc::clone(&clock),
            Arc::clone(&collector),
            selector,
        )
        .with_request_timeout(plan.settings.request_timeout);

        let (state_tx, _) = watch::channel(RunState::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            plan,
            engine: Arc::new(engine),
            collector,
            clock,
            state_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            transitions: Vec::new(),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> RunState {
        *self.state_tx.borrow()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    pub fn engine(&self) -> &Arc<ScenarioEngine> {
        &self.engine
    }

    /// Drives the run to completion.
    pub async fn run(mut self) -> RunReport {
        let start = self.clock.now();
        info!(plan = %self.plan.name, base_url = %self.plan.base_url, "Starting run");
        self.transition(RunState::Idle, start);

        self.transition(RunState::SettingUp, start);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let setup = tokio::select! {
            result = self.setup() => result,
            true = signalled(&mut shutdown_rx) => Err(SetupError::Interrupted),
        };
        let run = match setup {
            Ok(run) => Arc::new(run),
            Err(e) => {
                error!(error = %e, "Setup failed, run will not start");
                let stop_reason = matches!(e, SetupError::Interrupted).then_some(StopReason::Shutdown);
                self.transition(RunState::Completed(Verdict::Failed), start);
                return self.report(start, Some(e), None, stop_reason, ThresholdReport::default());
            }
        };

        self.transition(RunState::Running, start);
        let (summary, stop_reason) = self.running(Arc::clone(&run)).await;

        self.transition(RunState::TearingDown, start);
        self.teardown(&run).await;

        let final_report = thresholds::evaluate(&self.plan.thresholds, &self.collector);
        THRESHOLD_VIOLATIONS.set(final_report.violations.len() as i64);
        let aborted_by_threshold = matches!(stop_reason, Some(StopReason::ThresholdAbort(_)));
        let verdict = if final_report.passed && !aborted_by_threshold {
            Verdict::Passed
        } else {
            Verdict::Failed
        };
        self.transition(RunState::Completed(verdict), start);

        self.report(start, None, Some(summary), stop_reason, final_report)
    }

    fn transition(&mut self, state: RunState, start: tokio::time::Instant) {
        let at = self.clock.now() - start;
        info!(state = ?state, at_secs = at.as_secs_f64(), "Run state changed");
        self.state_tx.send_replace(state);
        self.transitions.push(StateTransition { state, at });
    }

    /// Runs the setup steps and builds the run context from their output.
    async fn setup(&self) -> Result<RunContext, SetupError> {
        let seed = Arc::new(RunContext::new(self.plan.run_variables.clone()));
        let mut ctx = ScenarioContext::new(seed, 0);

        for step in &self.plan.setup.steps {
            let result = self.engine.perform(SETUP_SCENARIO, step, &mut ctx).await;

            if let Some(source) = result.transport_error {
                return Err(SetupError::Transport {
                    step: step.name.clone(),
                    source,
                });
            }
            let status = result.status_code.unwrap_or(0);
            if !(200..300).contains(&status) {
                return Err(SetupError::UnexpectedStatus {
                    step: step.name.clone(),
                    status,
                });
            }
            if !result.checks_passed {
                return Err(SetupError::ChecksFailed {
                    step: step.name.clone(),
                });
            }
            info!(step = %step.name, status, "Setup step complete");
        }

        let mut variables = self.plan.run_variables.clone();
        variables.extend(ctx.local_variables());

        for name in &self.plan.setup.require {
            if !variables.contains_key(name) {
                return Err(SetupError::MissingVariable(name.clone()));
            }
        }

        Ok(RunContext::new(variables))
    }

    /// Hosts the scheduler, watching abort-on-fail thresholds and the
    /// shutdown handle until it drains.
    async fn running(&self, run: Arc<RunContext>) -> (SchedulerSummary, Option<StopReason>) {
        self.engine.selector().log_mix();

        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduler = RampScheduler::new(self.plan.profile.clone(), Arc::clone(&self.engine), run)
            .with_tick(self.plan.settings.tick)
            .with_graceful_stop(self.plan.settings.graceful_stop)
            .with_idle_interval(self.plan.settings.idle_interval)
            .with_stop_signal(stop_rx);

        let watch_thresholds = self.plan.thresholds.iter().any(|t| t.abort_on_fail);
        let interval = self
            .plan
            .settings
            .threshold_interval
            .max(Duration::from_millis(10));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut stop_reason = None;

        let scheduler_run = scheduler.run();
        tokio::pin!(scheduler_run);

        let summary = loop {
            tokio::select! {
                summary = &mut scheduler_run => break summary,
                _ = self.clock.sleep(interval), if watch_thresholds && stop_reason.is_none() => {
                    let report = thresholds::evaluate_abort_on_fail(&self.plan.thresholds, &self.collector);
                    THRESHOLD_VIOLATIONS.set(report.violations.len() as i64);
                    if report.has_abort_violation() {
                        let crossed: Vec<String> =
                            report.violations.iter().map(|v| v.threshold.to_string()).collect();
                        error!(thresholds = ?crossed, "Abort-on-fail threshold crossed, stopping run");
                        stop_reason = Some(StopReason::ThresholdAbort(crossed));
                        stop_tx.send_replace(true);
                    }
                }
                stopped = signalled(&mut shutdown_rx), if stop_reason.is_none() => {
                    if stopped {
                        warn!("Shutdown requested, stopping run");
                        stop_reason = Some(StopReason::Shutdown);
                        stop_tx.send_replace(true);
                    }
                }
            }
        };

        (summary, stop_reason)
    }

    /// Best-effort; failures are only logged.
    async fn teardown(&self, run: &Arc<RunContext>) {
        if self.plan.teardown.is_empty() {
            return;
        }

        let mut ctx = ScenarioContext::new(Arc::clone(run), 0);
        for step in &self.plan.teardown {
            let result = self.engine.perform(TEARDOWN_SCENARIO, step, &mut ctx).await;
            match &result.error {
                Some(e) => warn!(step = %step.name, error = %e, "Teardown step failed"),
                None => info!(step = %step.name, "Teardown step complete"),
            }
        }
    }

    fn report(
        &self,
        start: tokio::time::Instant,
        setup_error: Option<SetupError>,
        scheduler: Option<SchedulerSummary>,
        stop_reason: Option<StopReason>,
        thresholds: ThresholdReport,
    ) -> RunReport {
        let verdict = match self.state() {
            RunState::Completed(verdict) => verdict,
            _ => Verdict::Failed,
        };

        RunReport {
            plan: self.plan.name.clone(),
            passed: verdict == Verdict::Passed,
            verdict,
            setup_error,
            stop_reason,
            violations: thresholds.violations,
            thresholds_evaluated: thresholds.evaluated,
            metrics: self.collector.snapshot(),
            scheduler,
            transitions: self.transitions.clone(),
            duration: self.clock.now() - start,
        }
    }
}
