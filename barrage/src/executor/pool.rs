use std::{
    future::Future,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    sync::watch::{self, Receiver, Sender},
    task::JoinHandle,
    time::Instant,
};

use super::stage::internals::ExecutionContext;
use crate::{
    error::MetricError,
    metrics::{Counter, Trend, ITERATIONS, ITERATION_DURATION},
    scenario::{ThinkTime, VuContext},
};

/// Lifecycle of a virtual user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum VuState {
    /// Between iterations (thinking) or not started yet.
    Idle = 0,
    /// Inside the scenario action.
    Running = 1,
    /// Marked for retirement; finishes its current iteration and think time.
    Stopping = 2,
}

impl VuState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => VuState::Idle,
            1 => VuState::Running,
            _ => VuState::Stopping,
        }
    }
}

/// Move a VU between Idle and Running without ever leaving Stopping.
fn set_state(state: &AtomicU8, next: VuState) {
    let _ = state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        (current != VuState::Stopping as u8).then_some(next as u8)
    });
}

struct VuSlot {
    id: u64,
    state: Arc<AtomicU8>,
    retire: Sender<bool>,
    handle: JoinHandle<()>,
}

impl VuSlot {
    fn state(&self) -> VuState {
        VuState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn retire(&self) {
        self.state.store(VuState::Stopping as u8, Ordering::Release);
        self.retire.send_replace(true);
    }
}

#[derive(Clone)]
struct IterationMetrics {
    iterations: Counter,
    duration: Trend,
}

/// Dynamically sized set of virtual users running one scenario action.
///
/// The pool owns every VU's task handle and control channel. VUs are only ever
/// asked to stop between iterations; nothing here cancels an action mid-flight
/// except [`VirtualUserPool::drain`] once its grace period is exhausted.
pub struct VirtualUserPool<F, Fut> {
    ctx: ExecutionContext,
    action: F,
    think_time: ThinkTime,
    seed: Option<u64>,
    metrics: IterationMetrics,
    next_id: u64,
    vus: Vec<VuSlot>,
    future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> VirtualUserPool<F, Fut>
where
    F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Option<Duration>> + Send + 'static,
{
    pub fn new(
        ctx: ExecutionContext,
        action: F,
        think_time: ThinkTime,
        seed: Option<u64>,
    ) -> Result<Self, MetricError> {
        let metrics = IterationMetrics {
            iterations: ctx.metrics.counter(ITERATIONS)?,
            duration: ctx.metrics.trend(ITERATION_DURATION)?,
        };
        Ok(Self {
            ctx,
            action,
            think_time,
            seed,
            metrics,
            next_id: 1,
            vus: Vec::new(),
            future: PhantomData,
        })
    }

    /// Bring the number of active (non-retiring) VUs to exactly `target`.
    ///
    /// Surplus VUs are retired newest first. They keep running until their current
    /// iteration and think time are over, so [`Self::running`] converges to
    /// `target` within one iteration period.
    pub fn reconcile(&mut self, target: usize) {
        self.reap();
        let active = self.active();
        if active < target {
            for _ in active..target {
                self.spawn();
            }
            tracing::debug!("Scaled up from {active} to {target} VUs.");
        } else if active > target {
            let mut excess = active - target;
            for slot in self.vus.iter().rev() {
                if excess == 0 {
                    break;
                }
                if slot.state() != VuState::Stopping {
                    slot.retire();
                    excess -= 1;
                }
            }
            tracing::debug!("Retiring {} VUs down to {target}.", active - target);
        }
    }

    /// VUs that are alive and not retiring.
    pub fn active(&self) -> usize {
        self.vus
            .iter()
            .filter(|s| !s.handle.is_finished() && s.state() != VuState::Stopping)
            .count()
    }

    /// VUs whose task is still alive, retiring ones included.
    pub fn running(&self) -> usize {
        self.vus.iter().filter(|s| !s.handle.is_finished()).count()
    }

    /// `(id, state)` of every VU still tracked by the pool.
    pub fn states(&self) -> Vec<(u64, VuState)> {
        self.vus.iter().map(|s| (s.id, s.state())).collect()
    }

    /// Wait for every VU to stop, up to `grace`. VUs still busy afterwards are
    /// aborted; returns how many were.
    ///
    /// The shutdown signal must already have been sent, otherwise VUs keep
    /// iterating until the grace period runs out.
    pub async fn drain(&mut self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        let mut interrupted = 0;
        for mut slot in self.vus.drain(..) {
            match tokio::time::timeout_at(deadline, &mut slot.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("VU {} panicked: {e}", slot.id),
                Err(_) => {
                    tracing::warn!("VU {} did not finish within {grace:?}, interrupting.", slot.id);
                    slot.handle.abort();
                    interrupted += 1;
                }
            }
        }
        interrupted
    }

    fn spawn(&mut self) {
        let id = self.next_id;
        self.next_id += 1;

        let state = Arc::new(AtomicU8::new(VuState::Idle as u8));
        let (retire_tx, retire_rx) = watch::channel(false);
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => StdRng::from_entropy(),
        };
        let task = VuTask {
            id,
            action: self.action.clone(),
            think_time: self.think_time,
            state: Arc::clone(&state),
            retire: retire_rx,
            shutdown: self.ctx.shutdown.clone(),
            ctx: self.ctx.clone(),
            metrics: self.metrics.clone(),
            rng,
        };
        let handle = tokio::spawn(task.run::<Fut>());
        self.vus.push(VuSlot {
            id,
            state,
            retire: retire_tx,
            handle,
        });
    }

    /// Forget VUs whose task has ended, logging panics.
    fn reap(&mut self) {
        self.vus.retain_mut(|slot| {
            if !slot.handle.is_finished() {
                return true;
            }
            if let Some(Err(e)) = (&mut slot.handle).now_or_never() {
                tracing::error!("VU {} panicked: {e}", slot.id);
            }
            false
        });
    }
}

/// Everything one VU task owns.
struct VuTask<F> {
    id: u64,
    action: F,
    think_time: ThinkTime,
    state: Arc<AtomicU8>,
    retire: Receiver<bool>,
    shutdown: Receiver<bool>,
    ctx: ExecutionContext,
    metrics: IterationMetrics,
    rng: StdRng,
}

impl<F> VuTask<F> {
    async fn run<Fut>(mut self)
    where
        F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Option<Duration>> + Send + 'static,
    {
        let id = self.id;
        tracing::debug!("VU {id} started.");
        let mut iteration = 0;

        loop {
            if *self.retire.borrow() || *self.shutdown.borrow() {
                break;
            }

            set_state(&self.state, VuState::Running);
            let started = Instant::now();
            let vu_ctx = VuContext {
                vu: id,
                iteration,
                metrics: self.ctx.metrics.clone(),
                rng: StdRng::seed_from_u64(self.rng.gen()),
            };
            let pause = (self.action)(vu_ctx).await;
            self.metrics
                .duration
                .add(started.elapsed().as_secs_f64() * 1000.0);
            self.metrics.iterations.inc();
            iteration += 1;
            set_state(&self.state, VuState::Idle);

            // retirement waits out the think time, shutdown cuts it short
            let pause = pause.unwrap_or_else(|| self.think_time.sample(&mut self.rng));
            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.shutdown.wait_for(|s| *s) => break,
            }
        }

        tracing::debug!("VU {id} stopped after {iteration} iterations.");
    }
}
