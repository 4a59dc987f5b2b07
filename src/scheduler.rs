//! Ramp scheduler: keeps the number of live virtual users on the ramp profile.
//!
//! Every tick the scheduler computes the rounded target for the elapsed time
//! and reconciles the live set, spawning new workers or retiring the most
//! recently admitted ones. Workers observe retirement only between scenario
//! passes; a pass in flight always completes unless the drain times out.

use crate::clock::Clock;
use crate::engine::ScenarioEngine;
use crate::metrics::{ACTIVE_VUS, TARGET_VUS};
use crate::ramp::RampProfile;
use crate::scenario::{RunContext, VirtualUser};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);

/// Pause after an unpaced pass that sent no request.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// State of the live set right after one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickSample {
    pub elapsed: Duration,

    /// Rounded ramp target
    pub target: usize,

    /// Worker tasks still running when the tick fired, retiring ones included
    pub running_before: usize,

    /// Admitted, non-retired workers after reconciliation
    pub live: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerSummary {
    pub peak_vus: usize,

    /// Worker tasks still running once the drain finished
    pub final_live: usize,

    pub ticks: Vec<TickSample>,

    /// Workers cancelled because they outlived the graceful stop
    pub interrupted: usize,

    /// The run was stopped before the profile ended
    pub aborted: bool,

    pub elapsed: Duration,
}

struct WorkerHandle {
    id: usize,
    retire: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Counts a worker as running for as long as it is alive.
struct RunningGuard {
    running: Arc<AtomicUsize>,
}

impl RunningGuard {
    fn new(running: Arc<AtomicUsize>) -> Self {
        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
        ACTIVE_VUS.set(now as i64);
        Self { running }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let now = self.running.fetch_sub(1, Ordering::SeqCst) - 1;
        ACTIVE_VUS.set(now as i64);
    }
}

pub struct RampScheduler {
    profile: RampProfile,
    engine: Arc<ScenarioEngine>,
    run: Arc<RunContext>,
    tick: Duration,
    graceful_stop: Duration,
    idle_interval: Duration,
    stop: Option<watch::Receiver<bool>>,
    running: Arc<AtomicUsize>,
}

impl RampScheduler {
    pub fn new(profile: RampProfile, engine: Arc<ScenarioEngine>, run: Arc<RunContext>) -> Self {
        Self {
            profile,
            engine,
            run,
            tick: DEFAULT_TICK,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            stop: None,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    pub fn with_graceful_stop(mut self, graceful_stop: Duration) -> Self {
        self.graceful_stop = graceful_stop;
        self
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval.max(Duration::from_millis(1));
        self
    }

    /// Drains early once `stop` turns true.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }


    pub async fn run(mut self) -> SchedulerSummary {
        let clock = Arc::clone(self.engine.clock());
        let start = clock.now();
        let total = self.profile.total_duration();
        let deadline = start + total;

        info!(
            stages = self.profile.stages().len(),
            total_secs = total.as_secs_f64(),
            max_vus = self.profile.max_target(),
            tick_ms = self.tick.as_millis() as u64,
            "Starting ramp"
        );

        let mut live: Vec<WorkerHandle> = Vec::new();
        let mut retiring: Vec<WorkerHandle> = Vec::new();
        let mut summary = SchedulerSummary::default();
        let mut next_id = 1;
        let mut tick_index: u32 = 0;
        let mut stop = self.stop.take();

        loop {
            let elapsed = clock.now() - start;
            retiring.retain(|w| !w.handle.is_finished());
            live.retain(|w| !w.handle.is_finished());

            let target = self.profile.workers_at(elapsed);
            let running_before = self.running.load(Ordering::SeqCst);

            while live.len() < target && elapsed < total {
                live.push(self.spawn_worker(next_id, deadline));
                next_id += 1;
            }
            while live.len() > target {
                if let Some(worker) = live.pop() {
                    debug!(vu = worker.id, "Retiring virtual user");
                    let _ = worker.retire.send(true);
                    retiring.push(worker);
                }
            }

            TARGET_VUS.set(target as i64);
            summary.peak_vus = summary.peak_vus.max(live.len());
            summary.ticks.push(TickSample {
                elapsed,
                target,
                running_before,
                live: live.len(),
            });

            debug!(
                elapsed_secs = elapsed.as_secs_f64(),
                target,
                running_before,
                live = live.len(),
                "Ramp tick"
            );

            if elapsed >= total {
                break;
            }

            tick_index += 1;
            let next_tick = (start + self.tick * tick_index).min(deadline);
            let wait = next_tick.saturating_duration_since(clock.now());

            tokio::select! {
                _ = clock.sleep(wait) => {}
                _ = stop_requested(&mut stop) => {
                    warn!(elapsed_secs = elapsed.as_secs_f64(), "Stop requested, draining early");
                    summary.aborted = true;
                    break;
                }
            }
        }

        for worker in live.drain(..) {
            let _ = worker.retire.send(true);
            retiring.push(worker);
        }
        summary.interrupted = self.drain(clock.as_ref(), retiring).await;
        summary.final_live = self.running.load(Ordering::SeqCst);
        summary.elapsed = clock.now() - start;
        TARGET_VUS.set(0);

        info!(
            peak_vus = summary.peak_vus,
            interrupted = summary.interrupted,
            aborted = summary.aborted,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "Ramp finished"
        );

        summary
    }

    fn spawn_worker(&self, id: usize, deadline: Instant) -> WorkerHandle {
        let (retire_tx, retire_rx) = watch::channel(false);
        let engine = Arc::clone(&self.engine);
        let run = Arc::clone(&self.run);
        let idle_interval = self.idle_interval;
        let guard = RunningGuard::new(Arc::clone(&self.running));

        debug!(vu = id, "Admitting virtual user");
        let handle = tokio::spawn(async move {
            let _guard = guard;
            run_worker(id, engine, run, retire_rx, deadline, idle_interval).await;
        });

        WorkerHandle {
            id,
            retire: retire_tx,
            handle,
        }
    }

    /// Waits for retired workers up to the graceful stop, then cancels the
    /// rest. Returns how many were cancelled.
    async fn drain(&self, clock: &dyn Clock, workers: Vec<WorkerHandle>) -> usize {
        if workers.is_empty() {
            return 0;
        }

        debug!(workers = workers.len(), "Draining virtual users");
        let drain_deadline = clock.now() + self.graceful_stop;
        let mut interrupted = 0;

        for mut worker in workers {
            let remaining = drain_deadline.saturating_duration_since(clock.now());
            tokio::select! {
                biased;
                _ = &mut worker.handle => {}
                _ = clock.sleep(remaining) => {
                    warn!(vu = worker.id, "Virtual user exceeded graceful stop, interrupting");
                    worker.handle.abort();
                    let _ = worker.handle.await;
                    interrupted += 1;
                }
            }
        }

        interrupted
    }
}

/// Waits for the flag to turn true. False if the sender went away first.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|flag| *flag).await.is_ok()
}

/// Resolves once `stop` is true. Never resolves without a stop source.
async fn stop_requested(stop: &mut Option<watch::Receiver<bool>>) {
    let stopped = match stop {
        Some(rx) => signalled(rx).await,
        None => false,
    };
    if !stopped {
        std::future::pending::<()>().await;
    }
}

async fn run_worker(
    id: usize,
    engine: Arc<ScenarioEngine>,
    run: Arc<RunContext>,
    mut retire: watch::Receiver<bool>,
    deadline: Instant,
    idle_interval: Duration,
) {
    let clock = Arc::clone(engine.clock());
    let mut vu = VirtualUser::new(id, run);

    loop {
        if *retire.borrow() || clock.now() >= deadline {
            break;
        }

        let scenario = engine.selector().select();
        let outcome = engine.execute(scenario, &mut vu).await;

        let delay = match &scenario.pacing {
            Some(pacing) => Some(pacing.calculate_delay()),
            None if outcome.requests_sent() == 0 => Some(idle_interval),
            None => None,
        };
        match delay {
            Some(delay) => {
                tokio::select! {
                    _ = clock.sleep(delay) => {}
                    _ = signalled(&mut retire) => break,
                }
            }
            None => tokio::task::yield_now().await,
        }
    }

    debug!(vu = id, iterations = vu.iteration, "Virtual user finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{HttpClient, HttpRequest, HttpResponse};
    use crate::clock::TokioClock;
    use crate::collector::{names, MetricsCollector};
    use crate::ramp::Stage;
    use crate::scenario::{RequestConfig, Scenario, Step, ThinkTime};
    use crate::selector::ScenarioSelector;
    use async_trait::async_trait;

    struct OkClient;

    #[async_trait]
    impl HttpClient for OkClient {
        async fn send(&self, _request: HttpRequest) -> HttpResponse {
            HttpResponse::new(200, "{}")
        }
    }

    fn engine_with_pacing(pacing: Duration) -> Arc<ScenarioEngine> {
        let scenario = Scenario::new("health", 1.0)
            .with_step(Step::new("health", RequestConfig::get("/health")))
            .with_pacing(ThinkTime::Fixed(pacing));
        Arc::new(ScenarioEngine::new(
            "http://sut.local",
            Arc::new(OkClient),
            Arc::new(TokioClock),
            Arc::new(MetricsCollector::new()),
            ScenarioSelector::new(vec![scenario]).unwrap(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn live_set_follows_rounded_target() {
        let profile = RampProfile::new(vec![
            Stage::new(Duration::from_secs(4), 4),
            Stage::new(Duration::from_secs(4), 0),
        ]);
        let engine = engine_with_pacing(Duration::from_millis(300));
        let summary = RampScheduler::new(profile.clone(), engine, Arc::new(RunContext::default()))
            .run()
            .await;

        assert_eq!(summary.ticks[0].live, 0);
        for tick in &summary.ticks {
            assert_eq!(tick.live, profile.workers_at(tick.elapsed));
            assert_eq!(tick.live, tick.target);
        }
        assert_eq!(summary.peak_vus, 4);
        assert_eq!(summary.final_live, 0);
        assert!(!summary.aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_drains_early() {
        let profile = RampProfile::new(vec![Stage::new(Duration::from_secs(60), 3)]);
        let engine = engine_with_pacing(Duration::from_secs(1));
        let collector = Arc::clone(engine.collector());
        let (tx, rx) = watch::channel(false);

        let scheduler = RampScheduler::new(profile, engine, Arc::new(RunContext::default()))
            .with_stop_signal(rx);
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_secs(10)).await;
        tx.send(true).unwrap();
        let summary = handle.await.unwrap();

        assert!(summary.aborted);
        assert!(summary.elapsed < Duration::from_secs(12));
        assert_eq!(summary.final_live, 0);
        assert!(collector.counter(names::ITERATIONS) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_workers_are_interrupted_after_graceful_stop() {
        struct SlowClient;

        #[async_trait]
        impl HttpClient for SlowClient {
            async fn send(&self, _request: HttpRequest) -> HttpResponse {
                tokio::time::sleep(Duration::from_secs(600)).await;
                HttpResponse::new(200, "")
            }
        }

        let scenario = Scenario::new("slow", 1.0).with_step(Step::new("slow", RequestConfig::get("/slow")));
        let engine = Arc::new(ScenarioEngine::new(
            "http://sut.local",
            Arc::new(SlowClient),
            Arc::new(TokioClock),
            Arc::new(MetricsCollector::new()),
            ScenarioSelector::new(vec![scenario]).unwrap(),
        ));
        let profile = RampProfile::new(vec![
            Stage::new(Duration::ZERO, 2),
            Stage::new(Duration::from_secs(2), 2),
        ]);

        let summary = RampScheduler::new(profile, engine, Arc::new(RunContext::default()))
            .with_graceful_stop(Duration::from_secs(5))
            .run()
            .await;

        assert_eq!(summary.interrupted, 2);
        assert_eq!(summary.final_live, 0);
        assert!(summary.elapsed <= Duration::from_secs(8));
    }
}
