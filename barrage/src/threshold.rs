//! Pass/fail rules over aggregated metrics.
//!
//! A threshold binds an expression such as `p(95)<600` or `rate<0.15` to a named
//! metric (or `metric{tag:value}` submetric). Expressions are parsed and checked
//! against the metric's kind before the run starts.
//!
//! Empty metrics: counters and rates read as `0`; a trend without samples has no
//! value at all and evaluates to [`Outcome::NoData`]. `NoData` never counts as a
//! pass in the final verdict, and the mid-run abort watcher ignores it.
use std::{fmt, time::Duration};

use serde::Serialize;

use crate::{
    aggregate::MetricAggregate,
    error::ConfigError,
    metric::MetricKind,
    metrics::{parse_submetric, MetricsAggregator, MetricsSnapshot},
};

/// Which statistic of a metric an expression reads.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Aggregation {
    /// Counter sum.
    Count,
    /// Rate ratio, or counter sum per second of run time.
    Rate,
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `[0, 100]`.
    Percentile(f64),
}

impl Aggregation {
    fn parse(selector: &str) -> Option<Self> {
        let aggregation = match selector {
            "count" => Aggregation::Count,
            "rate" => Aggregation::Rate,
            "avg" => Aggregation::Avg,
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "med" => Aggregation::Med,
            other => {
                let number = other
                    .strip_prefix("p(")
                    .and_then(|s| s.strip_suffix(')'))
                    .or_else(|| other.strip_prefix('p'))?;
                let p: f64 = number.trim().parse().ok()?;
                if !(0.0..=100.0).contains(&p) {
                    return None;
                }
                Aggregation::Percentile(p)
            }
        };
        Some(aggregation)
    }

    fn supported_by(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => matches!(self, Aggregation::Count | Aggregation::Rate),
            MetricKind::Rate => matches!(self, Aggregation::Rate),
            MetricKind::Trend => !matches!(self, Aggregation::Count | Aggregation::Rate),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Count => f.write_str("count"),
            Aggregation::Rate => f.write_str("rate"),
            Aggregation::Avg => f.write_str("avg"),
            Aggregation::Min => f.write_str("min"),
            Aggregation::Max => f.write_str("max"),
            Aggregation::Med => f.write_str("med"),
            Aggregation::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    /// Split `rest` into the leading operator and the remainder.
    fn split(rest: &str) -> Option<(Self, &str)> {
        const OPS: [(&str, Comparison); 6] = [
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ];
        OPS.iter()
            .find_map(|(sym, op)| rest.strip_prefix(sym).map(|tail| (*op, tail)))
    }

    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => (observed - bound).abs() < f64::EPSILON,
            Comparison::Ne => (observed - bound).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    /// The metric has no value to compare (trend without samples).
    NoData,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    pub aggregation: Aggregation,
    pub comparison: Comparison,
    pub bound: f64,
    /// Stop the run as soon as this threshold fails mid-run.
    pub abort_on_fail: bool,
    /// Time from run start before abort checks for this threshold begin.
    pub delay_abort_eval: Duration,
}

impl Threshold {
    /// Parse `<selector><op><value>`, whitespace allowed between tokens.
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            metric: metric.to_string(),
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = expression.trim();
        let op_start = trimmed
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| invalid("missing comparison operator"))?;
        let selector: String = trimmed[..op_start].split_whitespace().collect();
        let aggregation =
            Aggregation::parse(&selector).ok_or_else(|| invalid("unknown aggregation"))?;
        let (comparison, value) = Comparison::split(&trimmed[op_start..])
            .ok_or_else(|| invalid("unknown comparison operator"))?;
        let bound: f64 = value
            .trim()
            .parse()
            .map_err(|_| invalid("threshold value is not a number"))?;

        // submetrics are registered under `parent{key:value}` without spaces
        let metric = match parse_submetric(metric) {
            Some((parent, key, value)) => format!("{parent}{{{key}:{value}}}"),
            None => metric.trim().to_string(),
        };
        Ok(Self {
            metric,
            expression: trimmed.to_string(),
            aggregation,
            comparison,
            bound,
            abort_on_fail: false,
            delay_abort_eval: Duration::ZERO,
        })
    }

    pub fn abort_on_fail(mut self, delay: Duration) -> Self {
        self.abort_on_fail = true;
        self.delay_abort_eval = delay;
        self
    }

    /// Check the referenced metric exists (declaring submetrics on the way) and
    /// supports this threshold's aggregation.
    pub fn bind(&self, metrics: &MetricsAggregator) -> Result<(), ConfigError> {
        let kind = if self.metric.contains('{') {
            metrics.declare_submetric(&self.metric)?
        } else {
            metrics
                .kind_of(&self.metric)
                .ok_or_else(|| ConfigError::UnknownMetric(self.metric.clone()))?
        };
        if !self.aggregation.supported_by(kind) {
            return Err(ConfigError::UnsupportedAggregation {
                metric: self.metric.clone(),
                kind,
                aggregation: self.aggregation.to_string(),
            });
        }
        Ok(())
    }

    /// Value the expression compares, `None` when there is nothing to compare.
    pub fn observe(&self, snapshot: &MetricsSnapshot, elapsed: Duration) -> Option<f64> {
        match (snapshot.get(&self.metric)?, self.aggregation) {
            (MetricAggregate::Counter(c), Aggregation::Count) => Some(c.sum),
            (MetricAggregate::Counter(c), Aggregation::Rate) => {
                let secs = elapsed.as_secs_f64();
                Some(if secs > 0.0 { c.sum / secs } else { 0.0 })
            }
            (MetricAggregate::Rate(r), Aggregation::Rate) => Some(r.rate()),
            (MetricAggregate::Trend(t), Aggregation::Avg) => t.avg(),
            (MetricAggregate::Trend(t), Aggregation::Min) => t.min(),
            (MetricAggregate::Trend(t), Aggregation::Max) => t.max(),
            (MetricAggregate::Trend(t), Aggregation::Med) => t.median(),
            (MetricAggregate::Trend(t), Aggregation::Percentile(p)) => t.percentile(p),
            _ => None,
        }
    }

    pub fn evaluate(&self, snapshot: &MetricsSnapshot, elapsed: Duration) -> ThresholdResult {
        let observed = self.observe(snapshot, elapsed);
        let outcome = match observed {
            None => Outcome::NoData,
            Some(v) if self.comparison.holds(v, self.bound) => Outcome::Pass,
            Some(_) => Outcome::Fail,
        };
        ThresholdResult {
            metric: self.metric.clone(),
            expression: self.expression.clone(),
            outcome,
            observed,
            abort_on_fail: self.abort_on_fail,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub outcome: Outcome,
    pub observed: Option<f64>,
    pub abort_on_fail: bool,
}

impl ThresholdResult {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }
}

pub fn evaluate_all(
    thresholds: &[Threshold],
    snapshot: &MetricsSnapshot,
    elapsed: Duration,
) -> Vec<ThresholdResult> {
    thresholds
        .iter()
        .map(|t| t.evaluate(snapshot, elapsed))
        .collect()
}

/// Overall verdict: every threshold passed. No thresholds means a pass.
pub fn verdict(results: &[ThresholdResult]) -> bool {
    results.iter().all(ThresholdResult::passed)
}
