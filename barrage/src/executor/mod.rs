//! Executor: orchestration of virtual users over time
//!
//! The `Executor` trait is the runtime hook that runs a [`Scenario`]. The built-in
//! [`StageExecutor`] drives a pool of virtual users along a list of [`Stage`]s:
//!
//! 1. A scheduler task wakes every `tick`, computes the target VU count for the
//!    elapsed time and publishes it on a `watch` channel.
//! 2. The executor loop reconciles the [`VirtualUserPool`] whenever the target
//!    changes: new VUs are spawned, surplus VUs are told to retire once their
//!    current iteration and think time are over.
//! 3. Each VU runs the scenario action, records the built-in iteration metrics and
//!    sleeps for its think time, until it is retired or the run shuts down.
//! 4. Abort-on-fail thresholds are re-evaluated on a separate interval and can end
//!    the run early; so can an external stop signal.
//! 5. On shutdown every VU finishes its in-flight iteration (bounded by
//!    `graceful_stop`), the registry is snapshotted and thresholds are evaluated
//!    into a [`RunResult`].
//!
//! # Mathematical behavior of the scheduler
//! For a stage with `start` (previous target, 0 for the first stage) and `end`
//! (stage target) over `duration`, the target at `elapsed` time into the stage is:
//!
//! ```text
//! t = elapsed / duration
//! vus(t) = round(start + (end - start) * t)
//! ```
//!
//! Zero-duration stages jump straight to their target.
pub mod pool;
pub mod stage;

pub use pool::{VirtualUserPool, VuState};
pub use stage::{Stage, StageExecutor, StageSchedule};

use std::{future::Future, time::Duration};

use crate::{
    report::RunResult,
    scenario::{Scenario, VuContext},
};

/// The runtime hook that executes a `Scenario`.
///
/// Executors own the whole run: spawning VUs, pacing them, deciding when the run
/// is over and turning the final metrics into a [`RunResult`].
pub trait Executor<F, Fut>
where
    Self: Send + Sync + Sized,
    F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Option<Duration>> + Send + 'static,
{
    type Error;

    /// Execute the scenario and return the final result.
    fn exec(
        &self,
        scenario: &Scenario<F, Fut>,
    ) -> impl Future<Output = Result<RunResult, Self::Error>> + Send;
}
