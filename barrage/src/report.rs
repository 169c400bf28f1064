use std::{fmt::Write as _, future::Future, path::PathBuf, time::Duration};

use serde::{Serialize, Serializer};
use tokio::io::AsyncWriteExt;

use crate::{
    aggregate::MetricAggregate,
    error::ReportError,
    metrics::{MetricsSnapshot, CHECKS, HTTP_REQS, HTTP_REQ_DURATION},
    threshold::{verdict, Outcome, ThresholdResult},
};

/// Why a run ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// Every stage ran to the end.
    Completed,
    /// The external stop signal fired.
    Interrupted,
    /// An abort-on-fail threshold failed mid-run.
    ThresholdAborted { metric: String, expression: String },
}

/// Final, immutable outcome of a run.
#[derive(Clone, Debug, Serialize)]
pub struct RunResult {
    pub scenario: String,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub metrics: MetricsSnapshot,
    pub thresholds: Vec<ThresholdResult>,
    pub stop: StopReason,
    /// VUs that had to be aborted after the graceful stop period.
    pub interrupted_vus: usize,
}

impl RunResult {
    /// Every threshold passed and none aborted the run.
    pub fn passed(&self) -> bool {
        verdict(&self.thresholds) && !matches!(self.stop, StopReason::ThresholdAborted { .. })
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u128(duration.as_millis())
}

/// Which metrics get dedicated summary lines, plus cosmetics.
#[derive(Clone, Debug)]
pub struct SummaryOptions {
    pub title: String,
    pub indent: String,
    /// Trend reported as "Request Metrics".
    pub latency_trend: String,
    /// Counter reported as "HTTP Reqs".
    pub request_counter: String,
    /// Rate reported as "Checks".
    pub checks_rate: String,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            title: "Load Test Complete".into(),
            indent: " ".into(),
            latency_trend: HTTP_REQ_DURATION.into(),
            request_counter: HTTP_REQS.into(),
            checks_rate: CHECKS.into(),
        }
    }
}

const SEPARATOR: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// Render the end-of-run text summary.
///
/// Line order is fixed: header, checks, requests, duration, stop reason, the latency
/// trend, every other Rate as a percentage, every other Counter, then thresholds.
/// Metrics missing from the snapshot render as zero or `n/a`.
pub fn render(result: &RunResult, options: &SummaryOptions) -> String {
    let i = options.indent.as_str();
    let metrics = &result.metrics;
    let mut out = String::from("\n");

    let mark = if result.passed() { '✓' } else { '✗' };
    // writing to a String never fails
    let _ = writeln!(out, "{i}{mark} {}", options.title);
    let _ = writeln!(out, "{i}{SEPARATOR}");
    let _ = writeln!(out, "{i}  Scenario:   {}", result.scenario);

    let (passes, fails) = metrics
        .rate(&options.checks_rate)
        .map(|r| (r.trues, r.falses()))
        .unwrap_or((0, 0));
    let _ = writeln!(out, "{i}  Checks:     {passes} passed, {fails} failed");
    let requests = metrics.count(&options.request_counter).unwrap_or(0.0);
    let _ = writeln!(out, "{i}  HTTP Reqs:  {requests} total");
    let _ = writeln!(out, "{i}  Duration:   {}s", result.duration.as_secs_f64().round());
    let _ = writeln!(out, "{i}  Stopped:    {}", stop_line(&result.stop, result.interrupted_vus));
    let _ = writeln!(out, "{i}{SEPARATOR}");

    let trend = metrics.trend(&options.latency_trend);
    let ms = |value: Option<f64>| match value {
        Some(v) => format!("{}ms", v.round()),
        None => "n/a".to_string(),
    };
    let _ = writeln!(out, "{i}  Request Metrics:");
    let _ = writeln!(out, "{i}    - Avg Duration: {}", ms(trend.and_then(|t| t.avg())));
    let _ = writeln!(out, "{i}    - P95 Duration: {}", ms(trend.and_then(|t| t.percentile(95.0))));
    let _ = writeln!(out, "{i}    - P99 Duration: {}", ms(trend.and_then(|t| t.percentile(99.0))));

    let rates: Vec<_> = metrics
        .iter()
        .filter(|(name, _)| *name != options.checks_rate)
        .filter_map(|(name, agg)| match agg {
            MetricAggregate::Rate(r) => Some((name, r.rate())),
            _ => None,
        })
        .collect();
    if !rates.is_empty() {
        let _ = writeln!(out, "{i}  Rates:");
        for (name, rate) in rates {
            let _ = writeln!(out, "{i}    - {name}: {:.2}%", rate * 100.0);
        }
    }

    let counters: Vec<_> = metrics
        .iter()
        .filter(|(name, _)| *name != options.request_counter)
        .filter_map(|(name, agg)| match agg {
            MetricAggregate::Counter(c) => Some((name, c.sum)),
            _ => None,
        })
        .collect();
    if !counters.is_empty() {
        let _ = writeln!(out, "{i}  Counters:");
        for (name, count) in counters {
            let _ = writeln!(out, "{i}    - {name}: {count}");
        }
    }

    if !result.thresholds.is_empty() {
        let _ = writeln!(out, "{i}  Thresholds:");
        for t in &result.thresholds {
            let mark = match t.outcome {
                Outcome::Pass => '✓',
                Outcome::Fail => '✗',
                Outcome::NoData => '?',
            };
            let observed = match t.observed {
                Some(v) => format!("{v:.2}"),
                None => "no data".to_string(),
            };
            let _ = writeln!(out, "{i}    {mark} {}: {} ({observed})", t.metric, t.expression);
        }
    }
    let _ = writeln!(out, "{i}{SEPARATOR}");

    out
}

fn stop_line(stop: &StopReason, interrupted_vus: usize) -> String {
    let reason = match stop {
        StopReason::Completed => "all stages completed".to_string(),
        StopReason::Interrupted => "interrupted".to_string(),
        StopReason::ThresholdAborted { metric, expression } => {
            format!("aborted by threshold {metric}: {expression}")
        }
    };
    if interrupted_vus > 0 {
        format!("{reason}, {interrupted_vus} VUs cut off")
    } else {
        reason
    }
}

/// Sends a finished run somewhere (stdout, file, database).
pub trait Reporter {
    fn report(&self, result: &RunResult) -> impl Future<Output = Result<(), ReportError>> + Send;
}

/// Prints the rendered summary on stdout.
#[derive(Clone, Debug, Default)]
pub struct StdoutReporter {
    pub options: SummaryOptions,
}

impl Reporter for StdoutReporter {
    async fn report(&self, result: &RunResult) -> Result<(), ReportError> {
        let summary = render(result, &self.options);
        let mut stdout = tokio::io::stdout();
        stdout.write_all(summary.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Writes the whole [`RunResult`] as pretty JSON to `path`.
#[derive(Clone, Debug)]
pub struct JsonReporter {
    pub path: PathBuf,
}

impl JsonReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Reporter for JsonReporter {
    async fn report(&self, result: &RunResult) -> Result<(), ReportError> {
        let json = serde_json::to_vec_pretty(result)?;
        tokio::fs::write(&self.path, json).await?;
        tracing::info!("Summary exported to {}", self.path.display());
        Ok(())
    }
}
