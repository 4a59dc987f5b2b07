//! Ramp scheduler timing, run on tokio's paused clock.

mod common;

use common::RoutedClient;
use rampload::clock::TokioClock;
use rampload::collector::{names, MetricsCollector};
use rampload::engine::ScenarioEngine;
use rampload::ramp::{RampProfile, Stage};
use rampload::scenario::{RequestConfig, RunContext, Scenario, Step, ThinkTime};
use rampload::scheduler::RampScheduler;
use rampload::selector::ScenarioSelector;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn health_engine(pacing: Duration) -> (Arc<ScenarioEngine>, Arc<MetricsCollector>) {
    let client = RoutedClient::new().respond(Method::GET, "/api/auth/health", 200, "ok");
    let scenario = Scenario::new("health", 1.0)
        .with_step(Step::new("health check", RequestConfig::get("/auth/health")))
        .with_pacing(ThinkTime::Fixed(pacing));
    let collector = Arc::new(MetricsCollector::new());
    let engine = ScenarioEngine::new(
        "http://sut.local/api",
        Arc::new(client),
        Arc::new(TokioClock),
        Arc::clone(&collector),
        ScenarioSelector::new(vec![scenario]).unwrap(),
    );
    (Arc::new(engine), collector)
}

#[tokio::test(start_paused = true)]
async fn test_ramp_up_and_down_runs_for_profile_duration() {
    let profile = RampProfile::new(vec![Stage::new(secs(10), 5), Stage::new(secs(10), 0)]);
    let (engine, collector) = health_engine(Duration::from_millis(500));

    let summary = RampScheduler::new(profile.clone(), engine, Arc::new(RunContext::default()))
        .run()
        .await;

    // 20s of ramp plus at most one pacing interval of drain
    assert!(summary.elapsed >= secs(20), "elapsed {:?}", summary.elapsed);
    assert!(summary.elapsed <= secs(21), "elapsed {:?}", summary.elapsed);
    assert_eq!(summary.peak_vus, 5);
    assert_eq!(summary.final_live, 0);
    assert_eq!(summary.interrupted, 0);
    assert!(!summary.aborted);

    let peak_tick = summary
        .ticks
        .iter()
        .find(|t| t.elapsed == secs(10))
        .expect("tick at 10s");
    assert_eq!(peak_tick.live, 5);

    for tick in &summary.ticks {
        assert_eq!(tick.live, profile.workers_at(tick.elapsed), "at {:?}", tick.elapsed);
    }
    assert!(collector.counter(names::ITERATIONS) > 0);
}

#[tokio::test(start_paused = true)]
async fn test_school_profile_reaches_one_hundred() {
    let profile = RampProfile::new(vec![
        Stage::new(secs(30), 10),
        Stage::new(secs(60), 50),
        Stage::new(secs(30), 100),
        Stage::new(secs(60), 100),
        Stage::new(secs(30), 0),
    ]);
    let (engine, _) = health_engine(secs(1));

    let summary = RampScheduler::new(profile, engine, Arc::new(RunContext::default()))
        .with_tick(secs(5))
        .run()
        .await;

    assert_eq!(summary.peak_vus, 100);
    assert_eq!(summary.final_live, 0);

    let at = |elapsed: u64| {
        summary
            .ticks
            .iter()
            .find(|t| t.elapsed == secs(elapsed))
            .map(|t| t.live)
    };
    assert_eq!(at(30), Some(10));
    assert_eq!(at(60), Some(30));
    assert_eq!(at(90), Some(50));
    assert_eq!(at(150), Some(100));
    assert_eq!(at(195), Some(50));
}

#[tokio::test(start_paused = true)]
async fn test_live_count_never_exceeds_target_after_tick() {
    let profile = RampProfile::new(vec![
        Stage::new(secs(6), 6),
        Stage::new(secs(0), 2),
        Stage::new(secs(6), 2),
    ]);
    let (engine, _) = health_engine(Duration::from_millis(250));

    let summary = RampScheduler::new(profile, engine, Arc::new(RunContext::default()))
        .run()
        .await;

    for tick in &summary.ticks {
        assert!(tick.live <= tick.target, "tick {:?}", tick);
    }
    let after_drop = summary
        .ticks
        .iter()
        .find(|t| t.elapsed == secs(7))
        .expect("tick at 7s");
    assert_eq!(after_drop.live, 2);
}

fn engine_for(scenario: Scenario, client: RoutedClient) -> (Arc<ScenarioEngine>, Arc<MetricsCollector>) {
    let collector = Arc::new(MetricsCollector::new());
    let engine = ScenarioEngine::new(
        "http://sut.local/api",
        Arc::new(client),
        Arc::new(TokioClock),
        Arc::clone(&collector),
        ScenarioSelector::new(vec![scenario]).unwrap(),
    );
    (Arc::new(engine), collector)
}

#[tokio::test(start_paused = true)]
async fn test_idle_scenario_waits_between_passes() {
    let (engine, collector) = engine_for(Scenario::new("idle", 1.0), RoutedClient::new());
    let profile = RampProfile::new(vec![Stage::new(Duration::ZERO, 1), Stage::new(secs(1), 1)]);

    let summary = RampScheduler::new(profile, engine, Arc::new(RunContext::default()))
        .with_idle_interval(Duration::from_millis(100))
        .run()
        .await;

    let iterations = collector.counter(names::ITERATIONS);
    assert!((9..=11).contains(&iterations), "iterations {}", iterations);
    assert!(summary.elapsed <= Duration::from_millis(1_100), "elapsed {:?}", summary.elapsed);
    assert_eq!(summary.final_live, 0);
}

#[tokio::test(start_paused = true)]
async fn test_fully_skipped_pass_does_not_spin() {
    let client = RoutedClient::new().respond(Method::GET, "/api/students/1", 200, "{}");
    let scenario = Scenario::new("needs student", 1.0).with_step(
        Step::new("get student", RequestConfig::get("/students/${student_id}")).requires(&["student_id"]),
    );
    let (engine, collector) = engine_for(scenario, client);
    let profile = RampProfile::new(vec![Stage::new(Duration::ZERO, 2), Stage::new(secs(2), 2)]);

    let summary = RampScheduler::new(profile, engine, Arc::new(RunContext::default()))
        .with_idle_interval(Duration::from_millis(250))
        .run()
        .await;

    // 2 VUs for 2s at one pass per 250ms
    let iterations = collector.counter(names::ITERATIONS);
    assert!((14..=18).contains(&iterations), "iterations {}", iterations);
    assert_eq!(collector.counter(names::STEPS_SKIPPED), iterations);
    assert_eq!(collector.counter(names::HTTP_REQS), 0);
    assert_eq!(summary.final_live, 0);
}
