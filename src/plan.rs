//! A complete, validated description of one load test run.

use crate::ramp::RampProfile;
use crate::scenario::{Scenario, Step};
use crate::scheduler::{DEFAULT_GRACEFUL_STOP, DEFAULT_IDLE_INTERVAL, DEFAULT_TICK};
use crate::thresholds::Threshold;
use std::collections::HashMap;
use std::time::Duration;

/// Timing knobs for the run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    /// Scheduler reconciliation interval
    pub tick: Duration,

    /// How long retired workers may finish their pass once the ramp ends
    pub graceful_stop: Duration,

    pub request_timeout: Duration,

    /// How often abort-on-fail thresholds are checked while running
    pub threshold_interval: Duration,

    /// Pause after an unpaced scenario pass that sent no request
    pub idle_interval: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            request_timeout: Duration::from_secs(30),
            threshold_interval: Duration::from_secs(2),
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }
}

/// Steps run once before the ramp starts.
#[derive(Debug, Clone, Default)]
pub struct SetupPhase {
    pub steps: Vec<Step>,

    /// Variables that must exist once setup finishes (e.g. an admin token)
    pub require: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TestPlan {
    pub name: String,
    pub base_url: String,
    pub settings: RunSettings,
    pub profile: RampProfile,
    pub scenarios: Vec<Scenario>,
    pub thresholds: Vec<Threshold>,
    pub setup: SetupPhase,

    /// Best-effort steps run after the ramp drains
    pub teardown: Vec<Step>,

    /// Seed values for the run context, such as credentials
    pub run_variables: HashMap<String, String>,
}

impl TestPlan {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, profile: RampProfile) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            settings: RunSettings::default(),
            profile,
            scenarios: Vec::new(),
            thresholds: Vec::new(),
            setup: SetupPhase::default(),
            teardown: Vec::new(),
            run_variables: HashMap::new(),
        }
    }

    pub fn with_scenario(mut self, scenario: Scenario) -> Self {
        self.scenarios.push(scenario);
        self
    }

    pub fn with_threshold(mut self, threshold: Threshold) -> Self {
        self.thresholds.push(threshold);
        self
    }

    pub fn with_setup_step(mut self, step: Step) -> Self {
        self.setup.steps.push(step);
        self
    }

    pub fn with_required(mut self, variable: impl Into<String>) -> Self {
        self.setup.require.push(variable.into());
        self
    }

    pub fn with_teardown_step(mut self, step: Step) -> Self {
        self.teardown.push(step);
        self
    }

    pub fn with_run_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.run_variables.insert(name.into(), value.into());
        self
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }
}
