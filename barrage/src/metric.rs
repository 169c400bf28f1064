use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// A `Metric` is a single raw sample value that an [`crate::Aggregate`] knows how
/// to fold into its running state.
///
/// The built-in kinds only need two sample types: numbers (`f64`) for counters and
/// trends, and flags (`bool`) for rates. Custom aggregates can use their own sample
/// types as long as they are cheap to clone and safe to move between tasks.
///
/// ## Example
/// ```rust
/// use barrage::Metric;
///
/// #[derive(Clone, PartialOrd, PartialEq)]
/// struct Bytes(u64);
/// impl Metric for Bytes {}
/// ```
pub trait Metric
where
    Self: PartialOrd + PartialEq + Send + Sync + Clone,
{
}

impl Metric for f64 {}
impl Metric for bool {}

/// The three aggregation kinds a named metric can be declared as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Running sum of added values.
    Counter,
    /// Ratio of `true` observations over all observations.
    Rate,
    /// Distribution of numeric samples (min/max/avg/percentiles).
    Trend,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
        };
        f.write_str(name)
    }
}

/// Value carried by an [`Observation`].
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub enum Sample {
    Number(f64),
    Bool(bool),
}

impl Sample {
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Sample::Number(_) => "number",
            Sample::Bool(_) => "bool",
        }
    }
}

impl From<f64> for Sample {
    fn from(value: f64) -> Self {
        Sample::Number(value)
    }
}

impl From<bool> for Sample {
    fn from(value: bool) -> Self {
        Sample::Bool(value)
    }
}

/// Tags attached to an observation, kept sorted so submetric matching and any
/// rendering is deterministic.
pub type Tags = BTreeMap<String, String>;

/// One measurement emitted by a VU iteration.
///
/// Observations are immutable and are consumed exactly once by
/// [`crate::MetricsAggregator::record`].
#[derive(Clone, Debug)]
pub struct Observation {
    pub metric: String,
    pub value: Sample,
    pub tags: Tags,
    pub timestamp: Instant,
}

impl Observation {
    pub fn new(metric: impl Into<String>, value: impl Into<Sample>) -> Self {
        Self {
            metric: metric.into(),
            value: value.into(),
            tags: Tags::new(),
            timestamp: Instant::now(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_tags(mut self, tags: &Tags) -> Self {
        self.tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}
