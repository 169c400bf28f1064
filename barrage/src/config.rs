//! JSON test options and their validation into a runnable [`RunPlan`].
//!
//! Options mirror the usual k6 layout (`stages`, `thresholds`, ...) plus the HTTP
//! workload: a weighted list of GET endpoints with their checks. Everything is
//! validated up front, so a [`RunPlan`] can always be run.
use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    executor::{Stage, StageSchedule},
    scenario::{ThinkTime, WeightedTable},
    threshold::Threshold,
    workload::Endpoint,
};

/// Base URL used when neither the CLI, the environment nor the options set one.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const TELEMETRY_PROFILE: &str = include_str!("../profiles/telemetry.json");

/// Parse durations such as `500ms`, `30s`, `39m`, `1h` or `1m30s`.
///
/// Anything [`humantime`] understands is accepted, plus a single fractional
/// value such as `1.5s`. A bare `0` is accepted, any other unit-less number is not.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if !s.contains('.') {
        return humantime::parse_duration(s).map_err(|_| invalid());
    }

    // humantime only takes integers
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(invalid)?;
    let (value, unit) = s.split_at(split);
    if !unit.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(invalid());
    }
    let value: f64 = value.parse().map_err(|_| invalid())?;
    let unit = humantime::parse_duration(&format!("1{unit}")).map_err(|_| invalid())?;
    Duration::try_from_secs_f64(unit.as_secs_f64() * value).map_err(|_| invalid())
}

/// Clap value parser for durations that must not be zero.
pub fn parse_interval(input: &str) -> Result<Duration, ConfigError> {
    let interval = parse_duration(input)?;
    if interval.is_zero() {
        return Err(ConfigError::ZeroInterval(input.trim().to_string()));
    }
    Ok(interval)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageOptions {
    pub duration: String,
    /// Signed so negative targets get a proper error instead of a serde one.
    pub target: i64,
}

/// One threshold, either as a bare expression or with abort settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdOptions {
    Expression(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
        delay_abort_eval: Option<String>,
    },
}

/// Think time as a fixed duration (`"1s"`) or a `{min, max}` range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThinkTimeOptions {
    Fixed(String),
    Range { min: String, max: String },
}

impl ThinkTimeOptions {
    fn resolve(&self) -> Result<ThinkTime, ConfigError> {
        match self {
            ThinkTimeOptions::Fixed(d) => Ok(ThinkTime::Fixed(parse_duration(d)?)),
            ThinkTimeOptions::Range { min, max } => {
                ThinkTime::uniform(parse_duration(min)?, parse_duration(max)?)
            }
        }
    }
}

/// Names of the workload's custom metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricNames {
    /// Rate of iterations where any check failed.
    pub errors: String,
    /// Counter of responses slower than the endpoint's `slowAfter`.
    pub slow: String,
    /// Counter of responses whose status is in the endpoint's `countStatus`.
    pub status: String,
    /// Trend of request latency, in milliseconds.
    pub latency: String,
}

impl Default for MetricNames {
    fn default() -> Self {
        Self {
            errors: "errors".into(),
            slow: "slow_requests".into(),
            status: "status_errors".into(),
            latency: "request_latency".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EndpointOptions {
    pub name: String,
    pub path: String,
    pub weight: f64,
    #[serde(default = "default_expect_status")]
    pub expect_status: Vec<u16>,
    /// Timing check: the response must arrive in under this long.
    pub max_duration: Option<String>,
    pub slow_after: Option<String>,
    #[serde(default)]
    pub count_status: Vec<u16>,
    /// Added on top of the regular think time after this endpoint.
    pub extra_think_time: Option<ThinkTimeOptions>,
}

fn default_expect_status() -> Vec<u16> {
    vec![200]
}

fn default_name() -> String {
    "default".into()
}

/// Test options as read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TestOptions {
    #[serde(default = "default_name")]
    pub name: String,
    pub stages: Vec<StageOptions>,
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<ThresholdOptions>>,
    pub think_time: Option<ThinkTimeOptions>,
    pub graceful_stop: Option<String>,
    pub request_timeout: Option<String>,
    pub base_url: Option<String>,
    pub seed: Option<u64>,
    #[serde(default)]
    pub metrics: MetricNames,
    #[serde(default)]
    pub endpoints: Vec<EndpointOptions>,
}

impl TestOptions {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Built-in 40 minute vessel telemetry profile.
    pub fn telemetry() -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(TELEMETRY_PROFILE)?)
    }

    /// Validate everything into a [`RunPlan`]. `base_url` (CLI flag or
    /// `BASE_URL`) wins over the options' own `baseUrl`.
    pub fn resolve(self, base_url: Option<String>) -> Result<RunPlan, ConfigError> {
        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, s)| -> Result<Stage, ConfigError> {
                let target =
                    usize::try_from(s.target).map_err(|_| ConfigError::NegativeTarget {
                        index,
                        target: s.target,
                    })?;
                Ok(Stage::new(parse_duration(&s.duration)?, target))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let schedule = StageSchedule::new(stages)?;

        let mut thresholds = Vec::new();
        for (metric, list) in &self.thresholds {
            for options in list {
                thresholds.push(match options {
                    ThresholdOptions::Expression(expr) => Threshold::parse(metric, expr)?,
                    ThresholdOptions::Detailed {
                        threshold,
                        abort_on_fail,
                        delay_abort_eval,
                    } => {
                        let parsed = Threshold::parse(metric, threshold)?;
                        if *abort_on_fail {
                            let delay = delay_abort_eval
                                .as_deref()
                                .map(parse_duration)
                                .transpose()?
                                .unwrap_or(Duration::ZERO);
                            parsed.abort_on_fail(delay)
                        } else {
                            parsed
                        }
                    }
                });
            }
        }

        let think_time = match &self.think_time {
            Some(t) => t.resolve()?,
            None => ThinkTime::None,
        };
        let graceful_stop = optional_duration(&self.graceful_stop, DEFAULT_GRACEFUL_STOP)?;
        let request_timeout = optional_duration(&self.request_timeout, DEFAULT_REQUEST_TIMEOUT)?;

        let base_url = base_url
            .or(self.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = validate_base_url(&base_url)?;

        let endpoints = self
            .endpoints
            .into_iter()
            .map(|e| -> Result<(Endpoint, f64), ConfigError> {
                let endpoint = Endpoint {
                    name: e.name,
                    path: e.path,
                    expect_status: e.expect_status,
                    max_duration: e.max_duration.as_deref().map(parse_duration).transpose()?,
                    slow_after: e.slow_after.as_deref().map(parse_duration).transpose()?,
                    count_status: e.count_status,
                    extra_think_time: match &e.extra_think_time {
                        Some(t) => t.resolve()?,
                        None => ThinkTime::None,
                    },
                };
                Ok((endpoint, e.weight))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let endpoints = WeightedTable::new(endpoints)?;

        Ok(RunPlan {
            name: self.name,
            schedule,
            thresholds,
            think_time,
            graceful_stop,
            request_timeout,
            base_url,
            seed: self.seed,
            metrics: self.metrics,
            endpoints,
        })
    }
}

fn optional_duration(value: &Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    value
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map(|d| d.unwrap_or(default))
}

/// Absolute http(s) URL, returned without its trailing slash.
fn validate_base_url(raw: &str) -> Result<String, ConfigError> {
    let url = reqwest::Url::parse(raw).map_err(|_| ConfigError::InvalidBaseUrl(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ConfigError::InvalidBaseUrl(raw.to_string()));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

/// Validated test options, ready to run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub name: String,
    pub schedule: StageSchedule,
    pub thresholds: Vec<Threshold>,
    pub think_time: ThinkTime,
    pub graceful_stop: Duration,
    pub request_timeout: Duration,
    pub base_url: String,
    pub seed: Option<u64>,
    pub metrics: MetricNames,
    pub endpoints: WeightedTable<Endpoint>,
}
