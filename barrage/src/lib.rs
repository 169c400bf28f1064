//! Barrage, a virtual-user load generator for Rust.
//!
//! Barrage ramps a pool of virtual users (VUs) up and down along a list of
//! stages. Every VU runs your scenario in a loop, records observations into a
//! shared metrics registry and pauses for a think time between iterations. At the
//! end of the run, k6-style thresholds turn the metrics into a pass/fail verdict.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Scenario`]: glue that ties everything together. It holds the action each VU
//!   runs, the think time, the thresholds and the metrics registry.
//! - [`Executor`]: responsible for actually running the scenario. The built-in
//!   [`StageExecutor`] interpolates the VU target from a [`StageSchedule`] and
//!   reconciles a pool of VU tasks towards it.
//! - [`MetricsAggregator`]: a sharded, thread-safe registry of Counter, Rate and
//!   Trend metrics shared by every VU through its [`VuContext`].
//! - [`Aggregate`]: the per-kind collectors behind the registry. Trends keep an
//!   HDR histogram, so memory never grows with the sample count.
//! - [`Threshold`]: an expression such as `p(95)<600` checked against a metric,
//!   optionally aborting the run as soon as it fails.
//! - [`Reporter`]: sends the final [`RunResult`] somewhere (stdout, a JSON file).
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::{Duration, Instant};
//!
//! use barrage::{
//!     metric::Observation,
//!     metrics::HTTP_REQ_DURATION,
//!     report::StdoutReporter,
//!     Reporter, Scenario, Stage, StageExecutor, StageSchedule, ThinkTime, Threshold,
//!     VuContext,
//! };
//! use reqwest::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // NEVER build heavy objects like clients inside the action.
//!     let client = Client::new();
//!     let scenario = Scenario::builder()
//!         .name("HTTP scenario")
//!         .action(move |ctx: VuContext| {
//!             let client = client.clone();
//!             async move {
//!                 let start = Instant::now();
//!                 let _ = client.get("http://localhost:3000").send().await;
//!                 let latency = start.elapsed().as_secs_f64() * 1000.0;
//!                 let _ = ctx.metrics.record(Observation::new(HTTP_REQ_DURATION, latency));
//!                 None
//!             }
//!         })
//!         .think_time(ThinkTime::Fixed(Duration::from_secs(1)))
//!         .thresholds(vec![Threshold::parse(HTTP_REQ_DURATION, "p(95)<600")?])
//!         .build();
//!
//!     let executor = StageExecutor::builder()
//!         .schedule(StageSchedule::new(vec![
//!             Stage::new(Duration::from_secs(10), 20),
//!             Stage::new(Duration::from_secs(30), 20),
//!             Stage::new(Duration::from_secs(10), 0),
//!         ])?)
//!         .build();
//!
//!     let result = scenario.run(&executor).await?;
//!     StdoutReporter::default().report(&result).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Feature flags
//!
//! - `macros`: the `#[weighted]` attribute that turns a unit-only enum into a
//!   [`Weighted`] type. (Enabled by default)
//! - `internals`: exposes the scheduler and threshold watcher tasks. Unstable.
//!
//! # Where to start
//!
//! - Read the docs for [`Scenario`], [`StageExecutor`] and [`Threshold`].
//! - The `barrage` binary runs the bundled HTTP workload from JSON options; see
//!   [`config::TestOptions`].
//! - See `examples/http.rs` for a library-only scenario.

/// Per-kind metric collectors
pub mod aggregate;
/// JSON test options
pub mod config;
pub mod error;
/// Orchestrators that define how things will actually run
pub mod executor;
/// Single observations
pub mod metric;
/// The shared metrics registry
pub mod metrics;
/// Run results, summaries and reporters
pub mod report;
/// Main module of the framework that glues everything together
pub mod scenario;
/// Pass/fail criteria
pub mod threshold;
/// Built-in weighted HTTP workload
pub mod workload;

pub use aggregate::Aggregate;
pub use error::{Error, Result};
pub use executor::{Executor, Stage, StageExecutor, StageSchedule};
pub use metric::Metric;
pub use metrics::MetricsAggregator;
pub use report::{Reporter, RunResult, StopReason};
pub use scenario::{Scenario, ThinkTime, VuContext, Weighted, WeightedTable};
pub use threshold::Threshold;

#[cfg(feature = "macros")]
/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use barrage_macros::*;
}
