use std::fmt::Debug;

use hdrhistogram::Histogram;

use crate::{
    error::MetricError,
    metric::{Metric, MetricKind, Sample},
};

/// The `Aggregate` trait defines how raw [`Metric`] samples are folded into a
/// compact, mergeable representation.
///
/// Aggregates store only what is needed to derive statistics later (counts, sums,
/// histograms); derived values such as averages and percentiles are computed on
/// read. Every VU writes into one of several registry shards and the shards are
/// merged when a snapshot is taken, so `merge` must be **associative** and
/// **commutative**.
///
/// # Example
/// ```rust
/// use barrage::Aggregate;
///
/// #[derive(Clone, Debug, Default)]
/// struct Max(f64);
///
/// impl Aggregate for Max {
///     type Metric = f64;
///
///     fn new() -> Self {
///         Self(f64::MIN)
///     }
///
///     fn consume(&mut self, metric: &f64) {
///         self.0 = self.0.max(*metric);
///     }
///
///     fn merge(&mut self, other: Self) {
///         self.0 = self.0.max(other.0);
///     }
/// }
/// ```
pub trait Aggregate
where
    Self: Send + Sync + Debug + Clone,
{
    /// The sample type this aggregate summarizes.
    type Metric: Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Fold a batch of samples into the current instance.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Fold a single sample into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);

    /// Combine two aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Running sum of everything added to a counter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CounterAggregate {
    pub sum: f64,
    pub samples: u64,
}

impl Aggregate for CounterAggregate {
    type Metric = f64;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, metric: &f64) {
        self.sum += metric;
        self.samples += 1;
    }

    fn merge(&mut self, other: Self) {
        self.sum += other.sum;
        self.samples += other.samples;
    }
}

/// `(trues, total)` pair behind a rate metric.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RateAggregate {
    pub trues: u64,
    pub total: u64,
}

impl RateAggregate {
    /// `trues / total`, or 0 before the first observation.
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.trues as f64 / self.total as f64
        }
    }

    pub fn falses(&self) -> u64 {
        self.total - self.trues
    }
}

impl Aggregate for RateAggregate {
    type Metric = bool;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, metric: &bool) {
        self.total += 1;
        if *metric {
            self.trues += 1;
        }
    }

    fn merge(&mut self, other: Self) {
        self.trues += other.trues;
        self.total += other.total;
    }
}

/// Samples are stored in the histogram as `value * TREND_SCALE` so three decimal
/// digits of the original unit (usually milliseconds) survive the integer cast.
const TREND_SCALE: f64 = 1000.0;
/// Two significant digits bound the relative percentile error to 1% while keeping
/// each histogram at a few kilobytes, whatever the number of samples.
const TREND_SIGFIG: u8 = 2;

/// Distribution of numeric samples.
///
/// `min`, `max`, `sum` and `count` are exact. Percentiles come from an
/// auto-resizing HDR histogram: memory grows with the value *range* (logarithmically),
/// never with the sample count, and every percentile is within 1% of the true
/// sample value. Negative samples are exact in min/max/avg but enter the histogram
/// as 0. All read-outs are clamped to `[min, max]`, which keeps
/// `min <= avg <= max` and percentile monotonicity intact despite bucket rounding.
#[derive(Clone, Debug)]
pub struct TrendAggregate {
    histogram: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendAggregate {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.max)
    }

    pub fn avg(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.clamp(self.sum / self.count as f64))
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// Value at percentile `p` in `[0, 100]`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let quantile = (p / 100.0).clamp(0.0, 1.0);
        let raw = self.histogram.value_at_quantile(quantile) as f64 / TREND_SCALE;
        Some(self.clamp(raw))
    }

    fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

impl Aggregate for TrendAggregate {
    type Metric = f64;

    fn new() -> Self {
        Self {
            histogram: Histogram::new(TREND_SIGFIG)
                .expect("two significant figures is a valid histogram precision"),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn consume(&mut self, metric: &f64) {
        let value = *metric;
        if !value.is_finite() {
            tracing::debug!("Dropping non-finite trend sample {value}");
            return;
        }
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let scaled = (value.max(0.0) * TREND_SCALE).round() as u64;
        if let Err(e) = self.histogram.record(scaled) {
            tracing::warn!("Dropping trend sample {value} from the histogram: {e}");
        }
    }

    fn merge(&mut self, other: Self) {
        if other.is_empty() {
            return;
        }
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        if let Err(e) = self.histogram.add(&other.histogram) {
            tracing::warn!("Dropping trend histogram shard during merge: {e}");
        }
    }
}

/// Kind-erased aggregate stored in the registry.
#[derive(Clone, Debug)]
pub enum MetricAggregate {
    Counter(CounterAggregate),
    Rate(RateAggregate),
    Trend(TrendAggregate),
}

impl MetricAggregate {
    pub fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => MetricAggregate::Counter(CounterAggregate::new()),
            MetricKind::Rate => MetricAggregate::Rate(RateAggregate::new()),
            MetricKind::Trend => MetricAggregate::Trend(TrendAggregate::new()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricAggregate::Counter(_) => MetricKind::Counter,
            MetricAggregate::Rate(_) => MetricKind::Rate,
            MetricAggregate::Trend(_) => MetricKind::Trend,
        }
    }

    /// Check that `sample` can be consumed by a metric of `kind`.
    ///
    /// Rates accept numbers too: any non-zero number counts as `true`.
    pub fn accepts(kind: MetricKind, sample: &Sample) -> bool {
        matches!(
            (kind, sample),
            (MetricKind::Counter, Sample::Number(_))
                | (MetricKind::Trend, Sample::Number(_))
                | (MetricKind::Rate, _)
        )
    }

    pub fn consume(&mut self, name: &str, sample: &Sample) -> Result<(), MetricError> {
        match (self, sample) {
            (MetricAggregate::Counter(c), Sample::Number(v)) => c.consume(v),
            (MetricAggregate::Trend(t), Sample::Number(v)) => t.consume(v),
            (MetricAggregate::Rate(r), Sample::Bool(b)) => r.consume(b),
            (MetricAggregate::Rate(r), Sample::Number(v)) => r.consume(&(*v != 0.0)),
            (agg, sample) => {
                return Err(MetricError::KindMismatch {
                    name: name.to_string(),
                    kind: agg.kind(),
                    sample: sample.type_name(),
                });
            }
        }
        Ok(())
    }

    /// Merge another aggregate of the same kind. Mismatched kinds cannot occur
    /// inside one registry and are ignored.
    pub fn merge(&mut self, other: MetricAggregate) {
        match (self, other) {
            (MetricAggregate::Counter(a), MetricAggregate::Counter(b)) => a.merge(b),
            (MetricAggregate::Rate(a), MetricAggregate::Rate(b)) => a.merge(b),
            (MetricAggregate::Trend(a), MetricAggregate::Trend(b)) => a.merge(b),
            (a, b) => tracing::error!(
                "Refusing to merge a {} aggregate into a {} aggregate",
                b.kind(),
                a.kind()
            ),
        }
    }
}
