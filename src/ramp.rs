//! Concurrency ramp profiles.
//!
//! A profile is a list of stages, each moving the target concurrency linearly
//! from the previous stage's level to its own target over its duration.

use serde::Serialize;
use std::time::Duration;

/// One segment of the ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

/// Ordered stages describing target concurrency over time.
///
/// # Examples
/// ```
/// use rampload::ramp::{RampProfile, Stage};
/// use std::time::Duration;
///
/// let profile = RampProfile::new(vec![
///     Stage::new(Duration::from_secs(10), 10),
///     Stage::new(Duration::from_secs(10), 0),
/// ]);
///
/// assert_eq!(profile.target_at(Duration::from_secs(5)), 5.0);
/// assert_eq!(profile.target_at(Duration::from_secs(10)), 10.0);
/// assert_eq!(profile.target_at(Duration::from_secs(30)), 0.0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RampProfile {
    stages: Vec<Stage>,
}

impl RampProfile {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Sum of all stage durations; the run deadline.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn max_target(&self) -> u32 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Target concurrency at `elapsed` since the run started.
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        let mut stage_start = Duration::ZERO;
        let mut level = 0.0;

        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            let target = stage.target as f64;

            if elapsed < stage_end {
                let into = (elapsed - stage_start).as_secs_f64();
                let progress = into / stage.duration.as_secs_f64();
                return level + (target - level) * progress;
            }

            stage_start = stage_end;
            level = target;
        }

        level
    }

    /// `target_at` rounded to a whole number of workers.
    pub fn workers_at(&self, elapsed: Duration) -> usize {
        self.target_at(elapsed).round().max(0.0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn school_profile() -> RampProfile {
        RampProfile::new(vec![
            Stage::new(secs(30), 10),
            Stage::new(secs(60), 50),
            Stage::new(secs(30), 100),
            Stage::new(secs(60), 100),
            Stage::new(secs(30), 0),
        ])
    }

    #[test]
    fn starts_at_zero_and_interpolates_from_previous_level() {
        let profile = school_profile();
        assert_eq!(profile.target_at(Duration::ZERO), 0.0);
        assert_eq!(profile.target_at(secs(15)), 5.0);
        assert_eq!(profile.target_at(secs(30)), 10.0);
        assert_eq!(profile.target_at(secs(60)), 30.0);
        assert_eq!(profile.target_at(secs(150)), 100.0);
        assert_eq!(profile.target_at(secs(195)), 50.0);
    }

    #[test]
    fn past_the_end_holds_last_target() {
        let profile = school_profile();
        assert_eq!(profile.target_at(secs(210)), 0.0);
        assert_eq!(profile.target_at(secs(10_000)), 0.0);

        let hold = RampProfile::new(vec![Stage::new(secs(5), 7)]);
        assert_eq!(hold.target_at(secs(60)), 7.0);
    }

    #[test]
    fn zero_length_stage_jumps() {
        let profile = RampProfile::new(vec![
            Stage::new(Duration::ZERO, 20),
            Stage::new(secs(10), 20),
        ]);
        assert_eq!(profile.target_at(Duration::ZERO), 20.0);
        assert_eq!(profile.target_at(secs(5)), 20.0);
    }

    #[test]
    fn empty_profile_is_zero() {
        let profile = RampProfile::default();
        assert_eq!(profile.target_at(secs(1)), 0.0);
        assert_eq!(profile.total_duration(), Duration::ZERO);
        assert_eq!(profile.max_target(), 0);
    }

    #[test]
    fn totals_and_rounding() {
        let profile = school_profile();
        assert_eq!(profile.total_duration(), secs(210));
        assert_eq!(profile.max_target(), 100);

        let small = RampProfile::new(vec![Stage::new(secs(10), 3)]);
        // 3 * 0.5 = 1.5 rounds away from zero
        assert_eq!(small.workers_at(secs(5)), 2);
        assert_eq!(small.workers_at(secs(1)), 0);
    }
}
