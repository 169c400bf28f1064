use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use barrage::{
    config::{parse_interval, TestOptions},
    report::{JsonReporter, StdoutReporter, SummaryOptions},
    workload::HttpWorkload,
    MetricsAggregator, Reporter, Scenario, StageExecutor, VuContext,
};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code when the run finished but a threshold failed.
const THRESHOLD_FAILED: u8 = 99;

#[derive(Debug, Parser)]
#[command(name = "barrage", version, about = "Virtual-user HTTP load generator")]
struct Cli {
    /// JSON test options; the built-in telemetry profile when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target service, overrides the options' baseUrl
    #[arg(long, env = "BASE_URL")]
    base_url: Option<String>,

    /// Also write the full result as JSON to this file
    #[arg(long)]
    summary_export: Option<PathBuf>,

    /// Seed every VU's random generator for reproducible endpoint picks
    #[arg(long)]
    seed: Option<u64>,

    /// How often the VU target is recomputed
    #[arg(long, value_parser = parse_interval, default_value = "100ms")]
    tick: Duration,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.quiet { "barrage=warn" } else { "barrage=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(THRESHOLD_FAILED),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the test and report it; `Ok(false)` means thresholds failed.
async fn run(cli: Cli) -> Result<bool> {
    let options = match &cli.config {
        Some(path) => TestOptions::from_path(path)?,
        None => TestOptions::telemetry()?,
    };
    let mut plan = options
        .resolve(cli.base_url)
        .context("Invalid test options")?;
    plan.seed = cli.seed.or(plan.seed);
    tracing::info!("Target: {}", plan.base_url);

    let metrics = MetricsAggregator::new();
    let workload = HttpWorkload::new(&plan, &metrics)?;

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received ctrl-c, stopping...");
            stop_tx.send_replace(true);
        }
    });

    let scenario = Scenario::builder()
        .name(plan.name.clone())
        .action(move |ctx: VuContext| {
            let workload = workload.clone();
            async move { workload.iterate(ctx).await }
        })
        .think_time(plan.think_time)
        .thresholds(plan.thresholds.clone())
        .metrics(metrics)
        .seed(plan.seed)
        .build();
    let executor = StageExecutor::builder()
        .schedule(plan.schedule.clone())
        .tick(cli.tick)
        .graceful_stop(plan.graceful_stop)
        .stop_signal(stop_rx)
        .build();

    let result = scenario.run(&executor).await?;

    let stdout = StdoutReporter {
        options: SummaryOptions {
            title: format!("{} Complete", plan.name),
            ..SummaryOptions::default()
        },
    };
    stdout.report(&result).await?;
    if let Some(path) = cli.summary_export {
        JsonReporter::new(path).report(&result).await?;
    }

    Ok(result.passed())
}
