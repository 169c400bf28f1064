use std::{future::Future, time::Duration};

use tokio::{
    sync::watch::{self, Receiver},
    time::Instant,
};
use typed_builder::TypedBuilder;

use super::{pool::VirtualUserPool, Executor};
use crate::{
    error::{ConfigError, Error},
    report::{RunResult, StopReason},
    scenario::{Scenario, VuContext},
    threshold::evaluate_all,
};
use internals::*;

/// A stage defines a target VU count and how long to ramp to that target.
///
/// Use `Stage::new(Duration::from_secs(30), 5)` to ramp to 5 VUs over 30s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    /// Virtual users
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Validated, piecewise-linear VU schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageSchedule {
    stages: Vec<Stage>,
    total: Duration,
}

impl StageSchedule {
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        let total: Duration = stages.iter().map(|s| s.duration).sum();
        if total.is_zero() {
            return Err(ConfigError::EmptySchedule);
        }
        Ok(Self { stages, total })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.total
    }

    /// Highest target across all stages.
    pub fn max_target(&self) -> usize {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Target VU count `elapsed` into the run, `None` once the schedule is over.
    ///
    /// At a stage's exact start the previous target still holds; zero-duration
    /// stages are skipped over, which makes them an instant jump.
    pub fn target_at(&self, elapsed: Duration) -> Option<usize> {
        if elapsed > self.total {
            return None;
        }
        let mut start = Duration::ZERO;
        let mut previous = 0;
        for stage in &self.stages {
            let end = start + stage.duration;
            if elapsed < end {
                let t = (elapsed - start).as_secs_f64() / stage.duration.as_secs_f64();
                return Some(interpolate(previous, stage.target, t));
            }
            start = end;
            previous = stage.target;
        }
        Some(previous)
    }

    /// Index of the stage running at `elapsed`, `None` once the schedule is over.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        if elapsed >= self.total {
            return None;
        }
        let mut end = Duration::ZERO;
        self.stages.iter().position(|stage| {
            end += stage.duration;
            elapsed < end
        })
    }
}

impl TryFrom<Vec<Stage>> for StageSchedule {
    type Error = ConfigError;

    fn try_from(stages: Vec<Stage>) -> Result<Self, Self::Error> {
        Self::new(stages)
    }
}

/// Executor that ramps a pool of virtual users along a [`StageSchedule`].
///
/// - A scheduler task publishes the interpolated target every `tick`.
/// - The pool is reconciled whenever that target changes, and on every `tick`.
/// - Abort-on-fail thresholds are checked every `threshold_interval`.
/// - On shutdown VUs get `graceful_stop` to finish their in-flight iteration.
#[derive(TypedBuilder)]
pub struct StageExecutor {
    pub schedule: StageSchedule,
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub graceful_stop: Duration,
    #[builder(default = Duration::from_secs(2))]
    pub threshold_interval: Duration,
    /// Ends the run early once it carries `true` (the CLI wires ctrl-c to it).
    #[builder(default, setter(strip_option))]
    pub stop_signal: Option<Receiver<bool>>,
}

impl<F, Fut> Executor<F, Fut> for StageExecutor
where
    Self: Send + Sync + Sized,
    F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Option<Duration>> + Send + 'static,
{
    type Error = Error;

    async fn exec(&self, scenario: &Scenario<F, Fut>) -> Result<RunResult, Error> {
        for (name, interval) in [
            ("tick", self.tick),
            ("threshold_interval", self.threshold_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name.to_string()).into());
            }
        }
        for threshold in &scenario.thresholds {
            threshold.bind(&scenario.metrics)?;
        }

        let (ctx, shutdown_tx) = ExecutionContext::new(scenario.metrics.clone());
        let mut pool = VirtualUserPool::new(
            ctx.clone(),
            scenario.action.clone(),
            scenario.think_time,
            scenario.seed,
        )?;

        tracing::info!(
            "Running scenario '{}': {} stages over {:?}, up to {} VUs.",
            scenario.name,
            self.schedule.stages().len(),
            self.schedule.total_duration(),
            self.schedule.max_target()
        );
        let started = Instant::now();
        let (target_tx, mut target_rx) = watch::channel(0usize);
        let scheduler = tokio::spawn(scheduler_task(
            ctx.clone(),
            self.schedule.clone(),
            self.tick,
            target_tx,
            started,
        ));
        let mut watcher = tokio::spawn(threshold_watch_task(
            ctx.clone(),
            scenario.thresholds.clone(),
            self.threshold_interval,
            started,
        ));
        let mut watching = true;
        let mut external = self.stop_signal.clone();
        // also reconciles between target changes, replacing VUs that died
        let mut refill = tokio::time::interval_at(started + self.tick, self.tick);
        refill.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let stop = loop {
            tokio::select! {
                changed = target_rx.changed() => match changed {
                    Ok(()) => {
                        let target = *target_rx.borrow_and_update();
                        pool.reconcile(target);
                    }
                    // the scheduler drops its sender once the last stage is over
                    Err(_) => break StopReason::Completed,
                },
                _ = refill.tick() => pool.reconcile(*target_rx.borrow()),
                result = &mut watcher, if watching => {
                    watching = false;
                    match result {
                        Ok(Some(failed)) => break StopReason::ThresholdAborted {
                            metric: failed.metric,
                            expression: failed.expression,
                        },
                        Ok(None) => {}
                        Err(e) => tracing::error!("Threshold watcher failed: {e}"),
                    }
                }
                _ = wait_for_stop(&mut external) => break StopReason::Interrupted,
            }
        };

        match &stop {
            StopReason::Completed => tracing::info!("All stages completed."),
            StopReason::Interrupted => tracing::warn!("Run interrupted, stopping VUs..."),
            StopReason::ThresholdAborted { metric, expression } => {
                tracing::warn!("Threshold '{expression}' on '{metric}' failed, aborting run.")
            }
        }

        shutdown_tx.send_replace(true);
        if let Err(e) = scheduler.await {
            tracing::error!("Scheduler task failed: {e}");
        }
        tracing::info!(
            "Waiting up to {:?} for {} VUs to finish...",
            self.graceful_stop,
            pool.running()
        );
        let interrupted_vus = pool.drain(self.graceful_stop).await;
        if watching {
            // returns on shutdown, the result no longer matters
            let _ = watcher.await;
        }

        let duration = started.elapsed();
        tracing::info!("Processing results...");
        let metrics = scenario.metrics.snapshot();
        let thresholds = evaluate_all(&scenario.thresholds, &metrics, duration);

        tracing::info!("Done running scenario: {}!", scenario.name);
        Ok(RunResult {
            scenario: scenario.name.clone(),
            duration,
            metrics,
            thresholds,
            stop,
            interrupted_vus,
        })
    }
}

/// Resolves once `stop` carries `true`; never when there is no signal or its
/// sender is gone.
async fn wait_for_stop(stop: &mut Option<Receiver<bool>>) {
    if let Some(rx) = stop {
        let stopped = rx.wait_for(|s| *s).await.is_ok();
        if stopped {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(feature = "internals")]
pub use internals::*;

pub(crate) mod internals {
    use tokio::sync::watch::Sender;

    use super::*;
    use crate::{
        metrics::MetricsAggregator,
        threshold::{Outcome, Threshold, ThresholdResult},
    };

    #[derive(Clone)]
    pub struct ExecutionContext {
        pub shutdown: Receiver<bool>,
        pub metrics: MetricsAggregator,
    }

    impl ExecutionContext {
        pub fn new(metrics: MetricsAggregator) -> (Self, Sender<bool>) {
            let (tx, rx) = watch::channel(false);
            (
                Self {
                    shutdown: rx,
                    metrics,
                },
                tx,
            )
        }
    }

    /// Pure linear interpolation between two VU counts, rounded to nearest.
    /// `t` is the elapsed fraction of the stage and is clamped to `[0, 1]`.
    pub fn interpolate(start: usize, end: usize, t: f64) -> usize {
        let t = t.clamp(0.0, 1.0);
        let vus = start as f64 + (end as f64 - start as f64) * t;
        vus.round() as usize
    }

    /// Publishes the schedule's target on `target` every `tick` until the schedule
    /// is over or shutdown fires. Dropping `target` on return tells the executor
    /// the run has completed.
    pub async fn scheduler_task(
        mut ctx: ExecutionContext,
        schedule: StageSchedule,
        tick: Duration,
        target: watch::Sender<usize>,
        started: Instant,
    ) {
        let deadline = started + schedule.total_duration();
        let stages = schedule.stages().len();
        let mut next_tick = started;
        let mut current_stage = None;

        loop {
            let elapsed = Instant::now().duration_since(started);
            let Some(vus) = schedule.target_at(elapsed) else {
                break;
            };

            let stage = schedule.stage_at(elapsed);
            if stage != current_stage {
                if let Some(i) = stage {
                    let s = schedule.stages()[i];
                    tracing::info!(
                        "Stage {}/{stages}: ramping to {} VUs over {:?}.",
                        i + 1,
                        s.target,
                        s.duration
                    );
                }
                current_stage = stage;
            }

            target.send_if_modified(|current| {
                if *current == vus {
                    return false;
                }
                *current = vus;
                true
            });
            if elapsed >= schedule.total_duration() {
                break;
            }

            next_tick += tick;
            // never oversleep the end of the schedule
            let wake = next_tick.min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = ctx.shutdown.wait_for(|s| *s) => break,
            }
        }
    }

    /// Re-evaluates the abort-on-fail thresholds every `interval` and returns the
    /// first one that fails. Thresholds without data are skipped, so a run is never
    /// aborted just because nothing was recorded yet. Returns `None` on shutdown
    /// or when there is nothing to watch.
    pub async fn threshold_watch_task(
        mut ctx: ExecutionContext,
        thresholds: Vec<Threshold>,
        interval: Duration,
        started: Instant,
    ) -> Option<ThresholdResult> {
        let watched: Vec<Threshold> = thresholds.into_iter().filter(|t| t.abort_on_fail).collect();
        if watched.is_empty() {
            return None;
        }

        let mut ticker = tokio::time::interval_at(started + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = ctx.shutdown.wait_for(|s| *s) => return None,
            }

            let elapsed = Instant::now().duration_since(started);
            let due: Vec<&Threshold> = watched
                .iter()
                .filter(|t| elapsed >= t.delay_abort_eval)
                .collect();
            if due.is_empty() {
                continue;
            }

            let snapshot = ctx.metrics.snapshot();
            for threshold in due {
                let result = threshold.evaluate(&snapshot, elapsed);
                if result.outcome == Outcome::Fail {
                    return Some(result);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        metric::{MetricKind, Observation},
        metrics::{MetricsAggregator, CHECKS, HTTP_REQ_DURATION, ITERATIONS},
        scenario::ThinkTime,
        threshold::{Outcome, Threshold},
    };

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn telemetry_schedule() -> StageSchedule {
        StageSchedule::new(vec![
            Stage::new(secs(30), 5),
            Stage::new(secs(39 * 60), 8),
            Stage::new(secs(30), 0),
        ])
        .unwrap()
    }

    #[test]
    fn schedule_hits_stage_endpoints() {
        let schedule = telemetry_schedule();
        assert_eq!(schedule.total_duration(), secs(40 * 60));
        assert_eq!(schedule.max_target(), 8);

        assert_eq!(schedule.target_at(Duration::ZERO), Some(0));
        assert_eq!(schedule.target_at(secs(15)), Some(3)); // 2.5 rounds up
        assert_eq!(schedule.target_at(secs(30)), Some(5));
        assert_eq!(schedule.target_at(secs(30 + 39 * 60)), Some(8));
        assert_eq!(schedule.target_at(secs(40 * 60)), Some(0));
        assert_eq!(schedule.target_at(secs(40 * 60) + Duration::from_millis(1)), None);
    }

    #[test]
    fn schedule_stays_within_stage_bounds() {
        let schedule = telemetry_schedule();
        let mut elapsed = Duration::ZERO;
        while let Some(vus) = schedule.target_at(elapsed) {
            if elapsed <= secs(30) {
                assert!(vus <= 5);
            } else if elapsed <= secs(30 + 39 * 60) {
                assert!((5..=8).contains(&vus), "{vus} at {elapsed:?}");
            }
            elapsed += Duration::from_millis(700);
        }
        assert!(elapsed > schedule.total_duration());
    }

    #[test]
    fn interpolation_rounds_to_nearest() {
        assert_eq!(interpolate(0, 5, 0.0), 0);
        assert_eq!(interpolate(0, 5, 0.29), 1);
        assert_eq!(interpolate(5, 8, 0.5), 7); // 6.5
        assert_eq!(interpolate(8, 0, 0.5), 4);
        assert_eq!(interpolate(8, 0, 1.0), 0);
        assert_eq!(interpolate(3, 9, 7.0), 9);
    }

    #[test]
    fn zero_duration_stage_jumps() {
        let schedule = StageSchedule::new(vec![
            Stage::new(Duration::ZERO, 10),
            Stage::new(secs(10), 10),
            Stage::new(Duration::ZERO, 2),
            Stage::new(secs(10), 2),
        ])
        .unwrap();
        assert_eq!(schedule.target_at(Duration::ZERO), Some(10));
        assert_eq!(schedule.target_at(secs(5)), Some(10));
        assert_eq!(schedule.target_at(secs(10)), Some(2));
        assert_eq!(schedule.target_at(secs(20)), Some(2));
        assert_eq!(schedule.stage_at(secs(5)), Some(1));
        assert_eq!(schedule.stage_at(secs(15)), Some(3));
    }

    #[test]
    fn empty_schedules_are_rejected() {
        assert!(matches!(
            StageSchedule::new(vec![]),
            Err(ConfigError::NoStages)
        ));
        assert!(matches!(
            StageSchedule::new(vec![Stage::new(Duration::ZERO, 3)]),
            Err(ConfigError::EmptySchedule)
        ));
    }

    async fn steady_request(ctx: VuContext) -> Option<Duration> {
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let latency = start.elapsed().as_secs_f64() * 1000.0;
        ctx.metrics
            .record(Observation::new(HTTP_REQ_DURATION, latency))
            .unwrap();
        ctx.metrics
            .record(Observation::new(CHECKS, true))
            .unwrap();
        None
    }

    async fn failing_request(ctx: VuContext) -> Option<Duration> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.metrics
            .record(Observation::new("errors", true).with_tag("status", "500"))
            .unwrap();
        ctx.metrics.record(Observation::new(CHECKS, false)).unwrap();
        None
    }

    #[tokio::test(start_paused = true)]
    async fn full_telemetry_profile_passes_latency_threshold() {
        let scenario = Scenario::builder()
            .name("telemetry")
            .action(steady_request)
            .think_time(ThinkTime::Fixed(secs(1)))
            .thresholds(vec![Threshold::parse(HTTP_REQ_DURATION, "p(95)<600").unwrap()])
            .metrics(MetricsAggregator::with_shards(4))
            .seed(Some(42))
            .build();
        let executor = StageExecutor::builder()
            .schedule(telemetry_schedule())
            .build();

        let result = scenario.run(&executor).await.unwrap();

        assert_eq!(result.stop, StopReason::Completed);
        assert_eq!(result.interrupted_vus, 0);
        assert!(result.duration >= secs(40 * 60));
        assert!(result.duration < secs(40 * 60 + 5));
        assert!(result.passed());

        let p95 = result.thresholds[0].observed.unwrap();
        assert!((p95 - 50.0).abs() <= 1.5, "p95 = {p95}");
        // up to 8 VUs at roughly one iteration per 1.05s for 40 minutes
        let iterations = result.metrics.count(ITERATIONS).unwrap();
        assert!(iterations > 10_000.0 && iterations < 8.0 * 2400.0, "{iterations}");
        let checks = result.metrics.rate(CHECKS).unwrap();
        assert_eq!(checks.falses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_service_breaks_error_threshold() {
        let metrics = MetricsAggregator::with_shards(2);
        metrics.declare("errors", MetricKind::Rate).unwrap();
        let scenario = Scenario::builder()
            .name("broken")
            .action(failing_request)
            .think_time(ThinkTime::Fixed(Duration::from_millis(500)))
            .thresholds(vec![
                Threshold::parse("errors", "rate<0.15").unwrap(),
                Threshold::parse("errors{status:500}", "rate>0.5").unwrap(),
            ])
            .metrics(metrics)
            .build();
        let executor = StageExecutor::builder()
            .schedule(StageSchedule::new(vec![Stage::new(secs(5), 3), Stage::new(secs(5), 0)]).unwrap())
            .build();

        let result = scenario.run(&executor).await.unwrap();

        assert_eq!(result.stop, StopReason::Completed);
        assert_eq!(result.metrics.rate("errors").unwrap().rate(), 1.0);
        assert_eq!(result.thresholds[0].outcome, Outcome::Fail);
        assert_eq!(result.thresholds[1].outcome, Outcome::Pass);
        assert!(!result.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_on_fail_ends_run_early() {
        let metrics = MetricsAggregator::with_shards(2);
        metrics.declare("errors", MetricKind::Rate).unwrap();
        let scenario = Scenario::builder()
            .name("abort")
            .action(failing_request)
            .think_time(ThinkTime::Fixed(Duration::from_millis(200)))
            .thresholds(vec![Threshold::parse("errors", "rate<0.15")
                .unwrap()
                .abort_on_fail(secs(3))])
            .metrics(metrics)
            .build();
        let executor = StageExecutor::builder()
            .schedule(
                StageSchedule::new(vec![Stage::new(Duration::ZERO, 4), Stage::new(secs(600), 4)])
                    .unwrap(),
            )
            .build();

        let result = scenario.run(&executor).await.unwrap();

        assert_eq!(
            result.stop,
            StopReason::ThresholdAborted {
                metric: "errors".into(),
                expression: "rate<0.15".into(),
            }
        );
        // first check at 2s is before the delay, the one at 4s aborts
        assert!(result.duration >= secs(4) && result.duration < secs(6));
        assert!(!result.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_data_never_aborts() {
        let scenario = Scenario::builder()
            .name("quiet")
            .action(|_: VuContext| async { Some(Duration::from_millis(100)) })
            .thresholds(vec![Threshold::parse(HTTP_REQ_DURATION, "p(95)<600")
                .unwrap()
                .abort_on_fail(Duration::ZERO)])
            .metrics(MetricsAggregator::with_shards(2))
            .build();
        let executor = StageExecutor::builder()
            .schedule(StageSchedule::new(vec![Stage::new(secs(10), 2)]).unwrap())
            .build();

        let result = scenario.run(&executor).await.unwrap();

        assert_eq!(result.stop, StopReason::Completed);
        assert_eq!(result.thresholds[0].outcome, Outcome::NoData);
        assert!(!result.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn external_stop_interrupts_run() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let started = Arc::new(AtomicUsize::new(0));
        let action = {
            let started = started.clone();
            move |_: VuContext| {
                started.fetch_add(1, Ordering::SeqCst);
                async { None::<Duration> }
            }
        };
        let scenario = Scenario::builder()
            .name("interrupted")
            .action(action)
            .think_time(ThinkTime::Fixed(secs(1)))
            .metrics(MetricsAggregator::with_shards(2))
            .build();
        let executor = StageExecutor::builder()
            .schedule(
                StageSchedule::new(vec![Stage::new(Duration::ZERO, 2), Stage::new(secs(3600), 2)])
                    .unwrap(),
            )
            .stop_signal(stop_rx)
            .build();

        tokio::spawn(async move {
            tokio::time::sleep(secs(5)).await;
            stop_tx.send_replace(true);
        });
        let result = scenario.run(&executor).await.unwrap();

        assert_eq!(result.stop, StopReason::Interrupted);
        assert!(result.duration < secs(10));
        assert!(started.load(Ordering::SeqCst) > 0);
        // no thresholds means a pass, even when interrupted
        assert!(result.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn tail_latency_fails_percentile_threshold() {
        // iteration i of every VU takes (i % 100 + 1) * 10ms: 10ms up to 1s
        let action = |ctx: VuContext| async move {
            let start = Instant::now();
            tokio::time::sleep(Duration::from_millis((ctx.iteration % 100 + 1) * 10)).await;
            let latency = start.elapsed().as_secs_f64() * 1000.0;
            ctx.metrics
                .record(Observation::new(HTTP_REQ_DURATION, latency))
                .unwrap();
            None
        };
        let scenario = Scenario::builder()
            .name("slow tail")
            .action(action)
            .think_time(ThinkTime::None)
            .thresholds(vec![
                Threshold::parse(HTTP_REQ_DURATION, "p(95)<600").unwrap(),
                Threshold::parse(HTTP_REQ_DURATION, "min<100").unwrap(),
            ])
            .metrics(MetricsAggregator::with_shards(4))
            .build();
        let executor = StageExecutor::builder()
            .schedule(
                StageSchedule::new(vec![Stage::new(Duration::ZERO, 4), Stage::new(secs(120), 4)])
                    .unwrap(),
            )
            .build();

        let result = scenario.run(&executor).await.unwrap();

        let p95 = result.thresholds[0].observed.unwrap();
        assert_eq!(result.thresholds[0].outcome, Outcome::Fail, "p95 = {p95}");
        assert!(p95 > 850.0 && p95 <= 1010.0, "p95 = {p95}");
        assert_eq!(result.thresholds[1].outcome, Outcome::Pass);
        let trend = result.metrics.trend(HTTP_REQ_DURATION).unwrap();
        let p50 = trend.median().unwrap();
        assert!(p50 > 300.0 && p50 < 700.0, "p50 = {p50}");
        assert!(!result.passed());
    }

    #[tokio::test(start_paused = true)]
    async fn dead_vus_are_replaced_on_a_plateau() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let action = {
            let seen = seen.clone();
            move |ctx: VuContext| {
                seen.lock().insert(ctx.vu);
                async move {
                    if ctx.vu == 1 {
                        panic!("scenario bug");
                    }
                    None::<Duration>
                }
            }
        };
        let scenario = Scenario::builder()
            .name("plateau")
            .action(action)
            .think_time(ThinkTime::Fixed(secs(1)))
            .metrics(MetricsAggregator::with_shards(2))
            .build();
        let executor = StageExecutor::builder()
            .schedule(
                StageSchedule::new(vec![Stage::new(Duration::ZERO, 2), Stage::new(secs(10), 2)])
                    .unwrap(),
            )
            .build();

        let result = scenario.run(&executor).await.unwrap();

        assert_eq!(result.stop, StopReason::Completed);
        // the target never changes after the jump, yet VU 1 gets a successor
        assert!(seen.lock().contains(&3));
        let iterations = result.metrics.count(ITERATIONS).unwrap();
        assert!(iterations >= 18.0, "{iterations}");
    }

    #[tokio::test]
    async fn zero_intervals_are_rejected() {
        let scenario = Scenario::builder()
            .name("spin")
            .action(|_: VuContext| async { None::<Duration> })
            .build();
        let schedule = StageSchedule::new(vec![Stage::new(secs(1), 1)]).unwrap();

        let executor = StageExecutor::builder()
            .schedule(schedule.clone())
            .tick(Duration::ZERO)
            .build();
        let err = scenario.run(&executor).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::ZeroInterval(ref name)) if name == "tick"
        ));

        let executor = StageExecutor::builder()
            .schedule(schedule)
            .threshold_interval(Duration::ZERO)
            .build();
        let err = scenario.run(&executor).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::ZeroInterval(ref name)) if name == "threshold_interval"
        ));
    }

    #[tokio::test]
    async fn unknown_threshold_metric_fails_before_run() {
        let scenario = Scenario::builder()
            .name("invalid")
            .action(|_: VuContext| async { None::<Duration> })
            .thresholds(vec![Threshold::parse("nope", "rate<0.1").unwrap()])
            .build();
        let executor = StageExecutor::builder()
            .schedule(StageSchedule::new(vec![Stage::new(secs(1), 1)]).unwrap())
            .build();

        let err = scenario.run(&executor).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnknownMetric(ref m)) if m == "nope"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_publishes_until_schedule_is_over() {
        let (ctx, _shutdown) = ExecutionContext::new(MetricsAggregator::with_shards(1));
        let schedule = StageSchedule::new(vec![
            Stage::new(secs(1), 10),
            Stage::new(secs(1), 0),
        ])
        .unwrap();
        let (tx, mut rx) = watch::channel(0);
        let task = tokio::spawn(scheduler_task(
            ctx,
            schedule,
            Duration::from_millis(100),
            tx,
            Instant::now(),
        ));

        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            seen.push(*rx.borrow_and_update());
        }
        task.await.unwrap();

        assert_eq!(seen.iter().max(), Some(&10));
        assert_eq!(seen.last(), Some(&0));
    }
}
