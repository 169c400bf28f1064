//! Concurrent metric registry shared by every virtual user.
//!
//! The registry is split into shards, each a `parking_lot::Mutex` around a map of
//! [`MetricAggregate`]s. A `record` call picks one shard round-robin and holds its
//! lock for the duration of a single `consume`, so every observation is applied
//! atomically and writers rarely contend. Snapshots lock one shard at a time,
//! clone it, and merge the clones outside the lock.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use serde::{ser::SerializeMap, Serialize, Serializer};

use crate::{
    aggregate::{MetricAggregate, RateAggregate, TrendAggregate},
    error::MetricError,
    metric::{MetricKind, Observation, Sample, Tags},
};

/// Checks performed by scenarios, as a rate of passing checks.
pub const CHECKS: &str = "checks";
/// Number of requests issued.
pub const HTTP_REQS: &str = "http_reqs";
/// Request latency in milliseconds.
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
/// Rate of requests that failed (transport error or unexpected status).
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
/// Completed VU iterations.
pub const ITERATIONS: &str = "iterations";
/// Wall time of a full VU iteration in milliseconds, think time excluded.
pub const ITERATION_DURATION: &str = "iteration_duration";

const BUILTINS: [(&str, MetricKind); 6] = [
    (CHECKS, MetricKind::Rate),
    (HTTP_REQS, MetricKind::Counter),
    (HTTP_REQ_DURATION, MetricKind::Trend),
    (HTTP_REQ_FAILED, MetricKind::Rate),
    (ITERATIONS, MetricKind::Counter),
    (ITERATION_DURATION, MetricKind::Trend),
];

type Registry = HashMap<String, MetricAggregate>;

/// A declared `parent{key:value}` restriction of a metric.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Submetric {
    name: String,
    key: String,
    value: String,
}

/// Parse `name{key:value}` into `(name, key, value)`.
pub(crate) fn parse_submetric(selector: &str) -> Option<(&str, &str, &str)> {
    let (parent, rest) = selector.split_once('{')?;
    let inner = rest.strip_suffix('}')?;
    let (key, value) = inner.split_once(':')?;
    let (parent, key, value) = (parent.trim(), key.trim(), value.trim());
    if parent.is_empty() || key.is_empty() {
        return None;
    }
    Some((parent, key, value))
}

#[derive(Default)]
struct Catalog {
    kinds: HashMap<String, MetricKind>,
    submetrics: HashMap<String, Vec<Submetric>>,
}

struct Inner {
    catalog: RwLock<Catalog>,
    shards: Vec<Mutex<Registry>>,
    next_shard: AtomicUsize,
}

/// Shared, thread-safe metric registry.
///
/// Cloning is cheap and every clone writes into the same registry; the executor
/// hands one to each VU through [`crate::VuContext`].
#[derive(Clone)]
pub struct MetricsAggregator {
    inner: Arc<Inner>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator")
            .field("shards", &self.inner.shards.len())
            .field("metrics", &self.inner.catalog.read().kinds.len())
            .finish()
    }
}

impl MetricsAggregator {
    /// Registry with one shard per CPU and the built-in metrics declared.
    pub fn new() -> Self {
        Self::with_shards(num_cpus::get())
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        let catalog = Catalog {
            kinds: BUILTINS
                .iter()
                .map(|(name, kind)| (name.to_string(), *kind))
                .collect(),
            submetrics: HashMap::new(),
        };
        Self {
            inner: Arc::new(Inner {
                catalog: RwLock::new(catalog),
                shards: (0..shards).map(|_| Mutex::new(Registry::new())).collect(),
                next_shard: AtomicUsize::new(0),
            }),
        }
    }

    /// Declare `name` as a metric of `kind`. Declaring the same name twice with the
    /// same kind is a no-op.
    pub fn declare(&self, name: &str, kind: MetricKind) -> Result<(), MetricError> {
        if name.contains('{') {
            return self.declare_submetric(name).and_then(|declared| {
                if declared == kind {
                    Ok(())
                } else {
                    Err(MetricError::Redeclared {
                        name: name.to_string(),
                        declared,
                        requested: kind,
                    })
                }
            });
        }
        let mut catalog = self.inner.catalog.write();
        match catalog.kinds.get(name) {
            Some(declared) if *declared != kind => Err(MetricError::Redeclared {
                name: name.to_string(),
                declared: *declared,
                requested: kind,
            }),
            Some(_) => Ok(()),
            None => {
                tracing::debug!("Declared {kind} metric '{name}'");
                catalog.kinds.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    /// Declare a `parent{key:value}` submetric and return its kind, inherited
    /// from the parent.
    pub fn declare_submetric(&self, selector: &str) -> Result<MetricKind, MetricError> {
        let (parent, key, value) = parse_submetric(selector)
            .ok_or_else(|| MetricError::InvalidSubmetric(selector.to_string()))?;
        let name = format!("{parent}{{{key}:{value}}}");

        let mut catalog = self.inner.catalog.write();
        let kind = *catalog
            .kinds
            .get(parent)
            .ok_or_else(|| MetricError::Undeclared(parent.to_string()))?;
        if catalog.kinds.contains_key(&name) {
            return Ok(kind);
        }
        catalog.kinds.insert(name.clone(), kind);
        catalog
            .submetrics
            .entry(parent.to_string())
            .or_default()
            .push(Submetric {
                name,
                key: key.to_string(),
                value: value.to_string(),
            });
        Ok(kind)
    }

    /// Kind of a declared metric or submetric.
    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.inner.catalog.read().kinds.get(name).copied()
    }

    pub fn counter(&self, name: &str) -> Result<Counter, MetricError> {
        self.declare(name, MetricKind::Counter)?;
        Ok(Counter(self.handle(name)))
    }

    pub fn rate(&self, name: &str) -> Result<Rate, MetricError> {
        self.declare(name, MetricKind::Rate)?;
        Ok(Rate(self.handle(name)))
    }

    pub fn trend(&self, name: &str) -> Result<Trend, MetricError> {
        self.declare(name, MetricKind::Trend)?;
        Ok(Trend(self.handle(name)))
    }

    fn handle(&self, name: &str) -> Handle {
        Handle {
            name: Arc::from(name),
            metrics: self.clone(),
        }
    }

    /// Apply one observation to its metric (and to every matching submetric).
    ///
    /// Fails if the metric was never declared or the sample does not fit its kind.
    pub fn record(&self, observation: Observation) -> Result<(), MetricError> {
        self.apply(&observation.metric, &observation.value, &observation.tags)
    }

    fn apply(&self, name: &str, sample: &Sample, tags: &Tags) -> Result<(), MetricError> {
        let (kind, targets) = {
            let catalog = self.inner.catalog.read();
            let kind = *catalog
                .kinds
                .get(name)
                .ok_or_else(|| MetricError::Undeclared(name.to_string()))?;
            let targets: Vec<String> = catalog
                .submetrics
                .get(name)
                .map(|subs| {
                    subs.iter()
                        .filter(|s| tags.get(&s.key).is_some_and(|v| *v == s.value))
                        .map(|s| s.name.clone())
                        .collect()
                })
                .unwrap_or_default();
            (kind, targets)
        };

        if !MetricAggregate::accepts(kind, sample) {
            return Err(MetricError::KindMismatch {
                name: name.to_string(),
                kind,
                sample: sample.type_name(),
            });
        }

        let idx = self.inner.next_shard.fetch_add(1, Ordering::Relaxed) % self.inner.shards.len();
        let mut shard = self.inner.shards[idx].lock();
        for target in std::iter::once(name).chain(targets.iter().map(String::as_str)) {
            shard
                .entry(target.to_string())
                .or_insert_with(|| MetricAggregate::empty(kind))
                .consume(target, sample)?;
        }
        Ok(())
    }

    /// Merge every shard into an immutable view of all declared metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut metrics: BTreeMap<String, MetricAggregate> = self
            .inner
            .catalog
            .read()
            .kinds
            .iter()
            .map(|(name, kind)| (name.clone(), MetricAggregate::empty(*kind)))
            .collect();

        for shard in &self.inner.shards {
            let copy = shard.lock().clone();
            for (name, agg) in copy {
                match metrics.get_mut(&name) {
                    Some(existing) => existing.merge(agg),
                    None => {
                        metrics.insert(name, agg);
                    }
                }
            }
        }
        MetricsSnapshot { metrics }
    }
}

#[derive(Clone)]
struct Handle {
    name: Arc<str>,
    metrics: MetricsAggregator,
}

impl Handle {
    fn emit(&self, sample: Sample, tags: &Tags) {
        if let Err(e) = self.metrics.apply(&self.name, &sample, tags) {
            // handles are only created for declared metrics of the right kind
            tracing::error!("Failed to record into '{}': {e}", self.name);
        }
    }
}

/// Handle to a declared counter.
#[derive(Clone)]
pub struct Counter(Handle);

impl Counter {
    pub fn inc(&self) {
        self.add(1.0);
    }

    pub fn add(&self, value: f64) {
        self.0.emit(Sample::Number(value), &Tags::new());
    }

    pub fn add_tagged(&self, value: f64, tags: &Tags) {
        self.0.emit(Sample::Number(value), tags);
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }
}

/// Handle to a declared rate.
#[derive(Clone)]
pub struct Rate(Handle);

impl Rate {
    pub fn add(&self, value: bool) {
        self.0.emit(Sample::Bool(value), &Tags::new());
    }

    pub fn add_tagged(&self, value: bool, tags: &Tags) {
        self.0.emit(Sample::Bool(value), tags);
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }
}

/// Handle to a declared trend.
#[derive(Clone)]
pub struct Trend(Handle);

impl Trend {
    pub fn add(&self, value: f64) {
        self.0.emit(Sample::Number(value), &Tags::new());
    }

    pub fn add_tagged(&self, value: f64, tags: &Tags) {
        self.0.emit(Sample::Number(value), tags);
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }
}

/// Immutable, merged view of every metric at one point in time.
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    metrics: BTreeMap<String, MetricAggregate>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<&MetricAggregate> {
        self.metrics.get(name)
    }

    pub fn rate(&self, name: &str) -> Option<&RateAggregate> {
        match self.metrics.get(name)? {
            MetricAggregate::Rate(r) => Some(r),
            _ => None,
        }
    }

    pub fn trend(&self, name: &str) -> Option<&TrendAggregate> {
        match self.metrics.get(name)? {
            MetricAggregate::Trend(t) => Some(t),
            _ => None,
        }
    }

    /// Counter sum, `None` when `name` is not a counter.
    pub fn count(&self, name: &str) -> Option<f64> {
        match self.metrics.get(name)? {
            MetricAggregate::Counter(c) => Some(c.sum),
            _ => None,
        }
    }

    /// Metrics in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricAggregate)> {
        self.metrics.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Serialized shape of one metric in the exported summary.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum MetricSummary {
    Counter {
        count: f64,
    },
    Rate {
        rate: f64,
        passes: u64,
        fails: u64,
    },
    Trend {
        count: u64,
        avg: Option<f64>,
        min: Option<f64>,
        med: Option<f64>,
        max: Option<f64>,
        #[serde(rename = "p(90)")]
        p90: Option<f64>,
        #[serde(rename = "p(95)")]
        p95: Option<f64>,
        #[serde(rename = "p(99)")]
        p99: Option<f64>,
    },
}

impl From<&MetricAggregate> for MetricSummary {
    fn from(agg: &MetricAggregate) -> Self {
        match agg {
            MetricAggregate::Counter(c) => MetricSummary::Counter { count: c.sum },
            MetricAggregate::Rate(r) => MetricSummary::Rate {
                rate: r.rate(),
                passes: r.trues,
                fails: r.falses(),
            },
            MetricAggregate::Trend(t) => MetricSummary::Trend {
                count: t.count(),
                avg: t.avg(),
                min: t.min(),
                med: t.median(),
                max: t.max(),
                p90: t.percentile(90.0),
                p95: t.percentile(95.0),
                p99: t.percentile(99.0),
            },
        }
    }
}

impl Serialize for MetricsSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.metrics.len()))?;
        for (name, agg) in &self.metrics {
            map.serialize_entry(name, &MetricSummary::from(agg))?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_declared() {
        let metrics = MetricsAggregator::with_shards(2);
        assert_eq!(metrics.kind_of(HTTP_REQ_DURATION), Some(MetricKind::Trend));
        assert_eq!(metrics.kind_of(CHECKS), Some(MetricKind::Rate));
        assert_eq!(metrics.kind_of("nope"), None);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.count(HTTP_REQS), Some(0.0));
        assert!(snapshot.trend(HTTP_REQ_DURATION).unwrap().is_empty());
    }

    #[test]
    fn undeclared_metric_is_rejected() {
        let metrics = MetricsAggregator::with_shards(1);
        let err = metrics.record(Observation::new("ghost", 1.0)).unwrap_err();
        assert!(matches!(err, MetricError::Undeclared(name) if name == "ghost"));
    }

    #[test]
    fn redeclaring_with_another_kind_fails() {
        let metrics = MetricsAggregator::with_shards(1);
        metrics.counter("slow").unwrap();
        assert!(metrics.counter("slow").is_ok());
        assert!(matches!(
            metrics.rate("slow"),
            Err(MetricError::Redeclared { .. })
        ));
    }

    #[test]
    fn wrong_sample_type_is_rejected() {
        let metrics = MetricsAggregator::with_shards(1);
        let err = metrics
            .record(Observation::new(HTTP_REQ_DURATION, true))
            .unwrap_err();
        assert!(matches!(err, MetricError::KindMismatch { .. }));
        assert_eq!(metrics.snapshot().trend(HTTP_REQ_DURATION).unwrap().count(), 0);
    }

    #[test]
    fn shards_merge_into_one_view() {
        let metrics = MetricsAggregator::with_shards(4);
        let hits = metrics.counter("hits").unwrap();
        for _ in 0..10 {
            hits.inc();
        }
        hits.add(2.5);
        assert_eq!(metrics.snapshot().count("hits"), Some(12.5));
    }

    #[test]
    fn submetrics_only_see_matching_tags() {
        let metrics = MetricsAggregator::with_shards(2);
        metrics
            .declare_submetric("http_req_duration{name:engine}")
            .unwrap();
        metrics
            .record(Observation::new(HTTP_REQ_DURATION, 10.0).with_tag("name", "engine"))
            .unwrap();
        metrics
            .record(Observation::new(HTTP_REQ_DURATION, 90.0).with_tag("name", "alerts"))
            .unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.trend(HTTP_REQ_DURATION).unwrap().count(), 2);
        let engine = snapshot.trend("http_req_duration{name:engine}").unwrap();
        assert_eq!(engine.count(), 1);
        assert_eq!(engine.max(), Some(10.0));
    }

    #[test]
    fn submetric_needs_declared_parent() {
        let metrics = MetricsAggregator::with_shards(1);
        assert!(matches!(
            metrics.declare_submetric("latency{name:x}"),
            Err(MetricError::Undeclared(_))
        ));
        assert!(matches!(
            metrics.declare_submetric("latency"),
            Err(MetricError::InvalidSubmetric(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_rate_updates_are_not_lost() {
        let metrics = MetricsAggregator::with_shards(3);
        let errors = metrics.rate("errors").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|task| {
                let errors = errors.clone();
                tokio::spawn(async move {
                    for i in 0..1000 {
                        errors.add((i + task) % 4 == 0);
                        if i % 100 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let rate = metrics.snapshot().rate("errors").unwrap().clone();
        assert_eq!(rate.total, 8000);
        assert_eq!(rate.trues, 2000);
        assert_eq!(rate.rate(), 0.25);
    }

    #[test]
    fn snapshot_serializes_summaries() {
        let metrics = MetricsAggregator::with_shards(1);
        let latency = metrics.trend("latency").unwrap();
        latency.add(5.0);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["latency"]["type"], "trend");
        assert_eq!(json["latency"]["count"], 1);
        assert_eq!(json["http_reqs"]["count"], 0.0);
    }
}
