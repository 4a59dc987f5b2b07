//! Weighted scenario selection over one uniform draw.
//!
//! Weights are turned into cumulative bounds over `[0, 1)`; a draw falls into
//! exactly one band. `0.1/0.2/0.1/0.6` becomes the bounds
//! `0.1/0.3/0.4/1.0`, so a draw of `0.35` picks the third scenario.

use crate::scenario::Scenario;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("no scenarios configured")]
    Empty,

    #[error("scenario '{name}' has invalid weight {weight}")]
    InvalidWeight { name: String, weight: f64 },

    #[error("scenario weights sum to zero")]
    ZeroTotal,
}

/// Immutable weighted-partition table shared by all workers.
#[derive(Clone, Debug)]
pub struct ScenarioSelector {
    scenarios: Arc<Vec<Scenario>>,
    bounds: Arc<Vec<f64>>,
    last_selectable: usize,
}

impl ScenarioSelector {
    /// Builds the partition. Weights must be finite and non-negative with a
    /// positive sum; zero-weight scenarios are never chosen.
    pub fn new(scenarios: Vec<Scenario>) -> Result<Self, SelectorError> {
        if scenarios.is_empty() {
            return Err(SelectorError::Empty);
        }

        for scenario in &scenarios {
            if !scenario.weight.is_finite() || scenario.weight < 0.0 {
                return Err(SelectorError::InvalidWeight {
                    name: scenario.name.clone(),
                    weight: scenario.weight,
                });
            }
        }

        let total: f64 = scenarios.iter().map(|s| s.weight).sum();
        if total <= 0.0 {
            return Err(SelectorError::ZeroTotal);
        }

        let mut bounds = Vec::with_capacity(scenarios.len());
        let mut sum = 0.0;
        for scenario in &scenarios {
            sum += scenario.weight;
            bounds.push(sum / total);
        }
        // float error must not leave a gap below 1.0
        let last_selectable = scenarios
            .iter()
            .rposition(|s| s.weight > 0.0)
            .unwrap_or(scenarios.len() - 1);
        for bound in &mut bounds[last_selectable..] {
            *bound = 1.0;
        }

        Ok(Self {
            scenarios: Arc::new(scenarios),
            bounds: Arc::new(bounds),
            last_selectable,
        })
    }

    /// Index of the band containing `draw`. Draws outside `[0, 1)` are
    /// clamped into it.
    pub fn index_for(&self, draw: f64) -> usize {
        let draw = if draw.is_nan() { 0.0 } else { draw.clamp(0.0, 1.0) };
        let index = self.bounds.partition_point(|bound| *bound <= draw);
        index.min(self.last_selectable)
    }

    /// The scenario whose band contains `draw`.
    pub fn select_with(&self, draw: f64) -> &Scenario {
        &self.scenarios[self.index_for(draw)]
    }

    pub fn select_from_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> &Scenario {
        self.select_with(rng.gen::<f64>())
    }

    pub fn select(&self) -> &Scenario {
        self.select_from_rng(&mut rand::thread_rng())
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    /// Upper bound of each scenario's band.
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Normalized selection probability per scenario.
    pub fn probabilities(&self) -> Vec<(String, f64)> {
        let mut lower = 0.0;
        self.scenarios
            .iter()
            .zip(self.bounds.iter())
            .map(|(s, upper)| {
                let p = upper - lower;
                lower = *upper;
                (s.name.clone(), p)
            })
            .collect()
    }

    /// Logs each scenario's share of iterations.
    pub fn log_mix(&self) {
        for (name, probability) in self.probabilities() {
            info!(
                scenario = %name,
                share_percent = %format!("{:.1}", probability * 100.0),
                "Scenario weight"
            );
        }
    }
}
