use std::{future::Future, marker::PhantomData, time::Duration};

use rand::{rngs::StdRng, Rng};
use typed_builder::TypedBuilder;

use crate::{
    error::ConfigError, executor::Executor, metrics::MetricsAggregator, report::RunResult,
    threshold::Threshold,
};

/// Everything a VU hands to the scenario action for one iteration.
///
/// The context is owned by the iteration's future, so actions can move it into an
/// `async move` block freely.
pub struct VuContext {
    /// Id of the virtual user running this iteration.
    pub vu: u64,
    /// Zero-based iteration number within this VU.
    pub iteration: u64,
    /// Registry every observation should go to.
    pub metrics: MetricsAggregator,
    /// Per-iteration random source, derived from the VU's own generator.
    pub rng: StdRng,
}

/// Pause a VU takes between two iterations.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum ThinkTime {
    #[default]
    None,
    Fixed(Duration),
    /// Uniformly distributed in `[min, max)`.
    Uniform { min: Duration, max: Duration },
}

impl ThinkTime {
    pub fn uniform(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvertedRange { min, max });
        }
        Ok(ThinkTime::Uniform { min, max })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match *self {
            ThinkTime::None => Duration::ZERO,
            ThinkTime::Fixed(d) => d,
            ThinkTime::Uniform { min, max } if min >= max => min,
            ThinkTime::Uniform { min, max } => rng.gen_range(min..max),
        }
    }
}

/// Types that know their own weighted alternatives.
///
/// Usually derived with the `#[weighted]` attribute macro on a unit-only enum.
pub trait Weighted: Sized + Clone {
    fn weights() -> Vec<(Self, f64)>;
}

/// Weighted alternatives with cumulative bounds, picked by one uniform draw.
///
/// Entries are kept as `(upper_bound, item)` with strictly increasing bounds and
/// the last bound pinned to exactly `1.0`, so every draw in `[0, 1)` maps to one
/// entry with positive weight.
#[derive(Clone, Debug)]
pub struct WeightedTable<T> {
    entries: Vec<(f64, T)>,
}

/// Accepted distance between the weight sum and 1.0.
const WEIGHT_TOLERANCE: f64 = 1e-6;

impl<T> WeightedTable<T> {
    pub fn new(items: impl IntoIterator<Item = (T, f64)>) -> Result<Self, ConfigError> {
        let items: Vec<(T, f64)> = items.into_iter().collect();
        if items.is_empty() {
            return Err(ConfigError::EmptyWeights);
        }
        if let Some((index, (_, weight))) = items
            .iter()
            .enumerate()
            .find(|(_, (_, w))| !w.is_finite() || *w < 0.0)
        {
            return Err(ConfigError::InvalidWeight {
                index,
                weight: *weight,
            });
        }
        let total: f64 = items.iter().map(|(_, w)| w).sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::WeightSum(total));
        }

        let mut cumulative = 0.0;
        let mut entries: Vec<(f64, T)> = items
            .into_iter()
            .filter(|(_, w)| *w > 0.0)
            .map(|(item, w)| {
                cumulative += w;
                (cumulative, item)
            })
            .collect();
        if let Some(last) = entries.last_mut() {
            last.0 = 1.0;
        }
        Ok(Self { entries })
    }

    /// Table from a [`Weighted`] type's declared weights.
    pub fn from_weighted() -> Result<Self, ConfigError>
    where
        T: Weighted,
    {
        Self::new(T::weights())
    }

    /// Entry whose cumulative range contains `draw`. Draws outside `[0, 1)` are
    /// clamped to the first/last entry.
    pub fn pick(&self, draw: f64) -> &T {
        let idx = self
            .entries
            .partition_point(|(bound, _)| *bound <= draw)
            .min(self.entries.len() - 1);
        &self.entries[idx].1
    }

    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> &T {
        self.pick(rng.gen::<f64>())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, item)| item)
    }
}

/// A load test: what each VU runs, how it paces itself, and what must hold at the
/// end of the run.
///
/// The action receives a [`VuContext`] and returns an optional think time that
/// replaces the configured [`ThinkTime`] for that iteration.
#[derive(TypedBuilder)]
pub struct Scenario<F, Fut>
where
    F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Option<Duration>> + Send + 'static,
{
    #[builder(setter(into))]
    pub name: String,
    pub action: F,
    #[builder(default)]
    pub think_time: ThinkTime,
    #[builder(default)]
    pub thresholds: Vec<Threshold>,
    #[builder(default)]
    pub metrics: MetricsAggregator,
    /// Seed for every VU's random generator; entropy when unset.
    #[builder(default)]
    pub seed: Option<u64>,
    #[builder(default, setter(skip))]
    future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Scenario<F, Fut>
where
    F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Option<Duration>> + Send + 'static,
{
    /// Run the scenario on `executor`.
    pub async fn run<E>(&self, executor: &E) -> Result<RunResult, E::Error>
    where
        E: Executor<F, Fut>,
    {
        executor.exec(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum Pattern {
        Engine,
        Navigation,
        Diagnostics,
        Alerts,
    }

    fn telemetry_table() -> WeightedTable<Pattern> {
        WeightedTable::new([
            (Pattern::Engine, 0.5),
            (Pattern::Navigation, 0.3),
            (Pattern::Diagnostics, 0.12),
            (Pattern::Alerts, 0.08),
        ])
        .unwrap()
    }

    #[test]
    fn pick_follows_cumulative_ranges() {
        let table = telemetry_table();
        assert_eq!(*table.pick(0.0), Pattern::Engine);
        assert_eq!(*table.pick(0.4999), Pattern::Engine);
        assert_eq!(*table.pick(0.5), Pattern::Navigation);
        assert_eq!(*table.pick(0.7999), Pattern::Navigation);
        assert_eq!(*table.pick(0.8), Pattern::Diagnostics);
        assert_eq!(*table.pick(0.95), Pattern::Alerts);
        assert_eq!(*table.pick(0.999_999_9), Pattern::Alerts);
        assert_eq!(*table.pick(1.5), Pattern::Alerts);
    }

    #[test]
    fn draws_converge_to_weights() {
        let table = telemetry_table();
        let mut rng = StdRng::seed_from_u64(7);
        let draws = 10_000;
        let mut counts = std::collections::HashMap::new();
        for _ in 0..draws {
            *counts.entry(*table.choose(&mut rng)).or_insert(0usize) += 1;
        }

        for (pattern, expected) in [
            (Pattern::Engine, 0.5),
            (Pattern::Navigation, 0.3),
            (Pattern::Diagnostics, 0.12),
            (Pattern::Alerts, 0.08),
        ] {
            let share = counts[&pattern] as f64 / draws as f64;
            assert!(
                (share - expected).abs() <= 0.03,
                "{pattern:?}: {share} vs {expected}"
            );
        }
    }

    #[test]
    fn zero_weights_are_never_picked() {
        let table = WeightedTable::new([("a", 0.0), ("b", 1.0), ("c", 0.0)]).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(*table.pick(0.0), "b");
        assert_eq!(*table.pick(0.99), "b");
    }

    #[test]
    fn weights_must_sum_to_one() {
        assert!(matches!(
            WeightedTable::new([("a", 0.5), ("b", 0.3)]),
            Err(ConfigError::WeightSum(_))
        ));
        assert!(matches!(
            WeightedTable::new([("a", 1.5), ("b", -0.5)]),
            Err(ConfigError::InvalidWeight { index: 1, .. })
        ));
        assert!(matches!(
            WeightedTable::<&str>::new([]),
            Err(ConfigError::EmptyWeights)
        ));
        // floating point noise is tolerated
        assert!(WeightedTable::new([("a", 0.1), ("b", 0.2), ("c", 0.7)]).is_ok());
    }

    #[test]
    fn think_time_sampling_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(1);
        let think = ThinkTime::uniform(Duration::from_millis(500), Duration::from_millis(2500)).unwrap();
        for _ in 0..1000 {
            let d = think.sample(&mut rng);
            assert!(d >= Duration::from_millis(500) && d < Duration::from_millis(2500));
        }
        assert_eq!(ThinkTime::None.sample(&mut rng), Duration::ZERO);
        assert_eq!(
            ThinkTime::Fixed(Duration::from_secs(1)).sample(&mut rng),
            Duration::from_secs(1)
        );
        assert!(ThinkTime::uniform(Duration::from_secs(2), Duration::from_secs(1)).is_err());
    }

    #[cfg(feature = "macros")]
    mod derived {
        use super::*;
        use crate::macros::weighted;

        #[weighted]
        enum Probe {
            #[weight(0.75)]
            Fast,
            #[weight(0.25)]
            Slow,
        }

        #[test]
        fn macro_builds_weighted_table() {
            assert_eq!(Probe::weights(), vec![(Probe::Fast, 0.75), (Probe::Slow, 0.25)]);
            let table = WeightedTable::<Probe>::from_weighted().unwrap();
            assert_eq!(*table.pick(0.7), Probe::Fast);
            assert_eq!(*table.pick(0.8), Probe::Slow);
        }
    }
}
