use std::path::PathBuf;

use thiserror::Error;

use crate::metric::MetricKind;

/// Result alias used by the executor and the library entry points.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while turning options into a runnable plan.
///
/// Every variant is raised before the first virtual user is spawned; a run
/// never starts with a partially valid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("stage list is empty")]
    NoStages,

    #[error("stages must span a non-zero duration")]
    EmptySchedule,

    #[error("stage {index}: target must be a non-negative VU count, got {target}")]
    NegativeTarget { index: usize, target: i64 },

    #[error("invalid duration '{0}' (expected e.g. 500ms, 30s, 39m, 1h, 1m30s)")]
    InvalidDuration(String),

    #[error("interval '{0}' must be greater than zero")]
    ZeroInterval(String),

    #[error("think time range is inverted: min {min:?} > max {max:?}")]
    InvertedRange {
        min: std::time::Duration,
        max: std::time::Duration,
    },

    #[error("weighted table has no entries")]
    EmptyWeights,

    #[error("weight #{index} is {weight}, weights must be finite and non-negative")]
    InvalidWeight { index: usize, weight: f64 },

    #[error("weights must sum to 1.0, got {0}")]
    WeightSum(f64),

    #[error("invalid threshold '{expression}' on '{metric}': {reason}")]
    InvalidThreshold {
        metric: String,
        expression: String,
        reason: String,
    },

    #[error("threshold references unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("'{aggregation}' is not available on {kind} metric '{metric}'")]
    UnsupportedAggregation {
        metric: String,
        kind: MetricKind,
        aggregation: String,
    },

    #[error("invalid base URL '{0}'")]
    InvalidBaseUrl(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed test options: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Metric(#[from] MetricError),
}

/// Errors raised by the metrics registry.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("metric '{0}' was never declared")]
    Undeclared(String),

    #[error("metric '{name}' is already declared as {declared}, not {requested}")]
    Redeclared {
        name: String,
        declared: MetricKind,
        requested: MetricKind,
    },

    #[error("metric '{name}' is a {kind} and cannot take a {sample} sample")]
    KindMismatch {
        name: String,
        kind: MetricKind,
        sample: &'static str,
    },

    #[error("invalid submetric selector '{0}' (expected name{{tag:value}})")]
    InvalidSubmetric(String),
}

/// Errors raised by [`crate::Reporter`] sinks.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("metric error: {0}")]
    Metric(#[from] MetricError),

    #[error("report error: {0}")]
    Report(#[from] ReportError),
}
