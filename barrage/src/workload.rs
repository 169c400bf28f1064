use std::{sync::Arc, time::Duration};

use reqwest::Client;
use tokio::time::Instant;

use crate::{
    config::{MetricNames, RunPlan},
    error::{ConfigError, MetricError},
    metric::Tags,
    metrics::{
        Counter, MetricsAggregator, Rate, Trend, CHECKS, HTTP_REQS, HTTP_REQ_DURATION,
        HTTP_REQ_FAILED,
    },
    scenario::{ThinkTime, VuContext, WeightedTable},
};

/// One weighted GET target and the checks applied to its responses.
#[derive(Clone, Debug, PartialEq)]
pub struct Endpoint {
    pub name: String,
    /// Appended to the base URL.
    pub path: String,
    /// Statuses that count as success.
    pub expect_status: Vec<u16>,
    /// When set, responses must arrive in under this long to pass.
    pub max_duration: Option<Duration>,
    /// Responses slower than this bump the slow counter.
    pub slow_after: Option<Duration>,
    /// Statuses that bump the status counter.
    pub count_status: Vec<u16>,
    /// Extra pause after this endpoint, on top of the regular think time.
    pub extra_think_time: ThinkTime,
}

struct WorkloadMetrics {
    reqs: Counter,
    duration: Trend,
    failed: Rate,
    checks: Rate,
    errors: Rate,
    latency: Trend,
    slow: Counter,
    status: Counter,
}

impl WorkloadMetrics {
    fn declare(metrics: &MetricsAggregator, names: &MetricNames) -> Result<Self, MetricError> {
        Ok(Self {
            reqs: metrics.counter(HTTP_REQS)?,
            duration: metrics.trend(HTTP_REQ_DURATION)?,
            failed: metrics.rate(HTTP_REQ_FAILED)?,
            checks: metrics.rate(CHECKS)?,
            errors: metrics.rate(&names.errors)?,
            latency: metrics.trend(&names.latency)?,
            slow: metrics.counter(&names.slow)?,
            status: metrics.counter(&names.status)?,
        })
    }
}

struct Inner {
    client: Client,
    base_url: String,
    endpoints: WeightedTable<Endpoint>,
    think_time: ThinkTime,
    metrics: WorkloadMetrics,
}

/// Weighted HTTP GET workload.
///
/// Each iteration picks one endpoint, issues a single GET and records the
/// response against the built-in HTTP metrics and the workload's own error rate,
/// latency trend and slow/status counters. Network errors are recorded as failed
/// checks; they never stop the VU. Clones share one client.
#[derive(Clone)]
pub struct HttpWorkload {
    inner: Arc<Inner>,
}

impl HttpWorkload {
    /// Build the client and declare every metric the workload writes to.
    pub fn new(plan: &RunPlan, metrics: &MetricsAggregator) -> Result<Self, ConfigError> {
        // one pooled client for every VU, never one per request
        let client = Client::builder()
            .timeout(plan.request_timeout)
            .build()
            .map_err(ConfigError::HttpClient)?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url: plan.base_url.clone(),
                endpoints: plan.endpoints.clone(),
                think_time: plan.think_time,
                metrics: WorkloadMetrics::declare(metrics, &plan.metrics)?,
            }),
        })
    }

    /// Run one iteration. Returns a think time override when the picked
    /// endpoint asks for extra pause.
    pub async fn iterate(&self, mut ctx: VuContext) -> Option<Duration> {
        let inner = &self.inner;
        let endpoint = inner.endpoints.choose(&mut ctx.rng);
        let url = format!("{}{}", inner.base_url, endpoint.path);

        let started = Instant::now();
        let status = match inner.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                // drain the body so the connection can be reused
                if let Err(e) = response.bytes().await {
                    tracing::debug!("VU {}: reading {url} failed: {e}", ctx.vu);
                }
                Some(status)
            }
            Err(e) => {
                tracing::debug!("VU {}: GET {url} failed: {e}", ctx.vu);
                None
            }
        };
        let success = self.record(endpoint, status, started.elapsed());
        tracing::trace!(vu = ctx.vu, iteration = ctx.iteration, endpoint = %endpoint.name, success);

        match endpoint.extra_think_time {
            ThinkTime::None => None,
            extra => Some(inner.think_time.sample(&mut ctx.rng) + extra.sample(&mut ctx.rng)),
        }
    }

    /// Record one response (`status` is `None` on transport errors) and return
    /// whether every check passed.
    fn record(&self, endpoint: &Endpoint, status: Option<u16>, elapsed: Duration) -> bool {
        let m = &self.inner.metrics;
        let ms = elapsed.as_secs_f64() * 1000.0;

        let mut tags = Tags::new();
        tags.insert("name".into(), endpoint.name.clone());
        if let Some(code) = status {
            tags.insert("status".into(), code.to_string());
        }

        m.reqs.add_tagged(1.0, &tags);
        m.duration.add_tagged(ms, &tags);
        m.latency.add_tagged(ms, &tags);

        let status_ok = status.is_some_and(|code| endpoint.expect_status.contains(&code));
        m.failed.add_tagged(!status_ok, &tags);
        m.checks.add_tagged(status_ok, &check_tags(&tags, &endpoint.name, "status"));

        let mut success = status_ok;
        if let Some(max) = endpoint.max_duration {
            let fast_enough = elapsed < max;
            m.checks
                .add_tagged(fast_enough, &check_tags(&tags, &endpoint.name, "duration"));
            success &= fast_enough;
        }
        m.errors.add_tagged(!success, &tags);

        if endpoint.slow_after.is_some_and(|limit| elapsed > limit) {
            m.slow.add_tagged(1.0, &tags);
        }
        if status.is_some_and(|code| endpoint.count_status.contains(&code)) {
            m.status.add_tagged(1.0, &tags);
        }
        success
    }
}

fn check_tags(tags: &Tags, endpoint: &str, check: &str) -> Tags {
    let mut tags = tags.clone();
    tags.insert("check".into(), format!("{endpoint} {check}"));
    tags
}
