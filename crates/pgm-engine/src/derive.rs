//! Derivative cache: turns cumulative counters into per-second rates.
//!
//! Each [`SeriesKey`] remembers the last `(timestamp, value)` observation.
//! The first observation of a series yields no rate. Later observations yield
//! `(value - last.value) / (timestamp - last.timestamp)`, or `0` when the two
//! timestamps are equal. The stored sample is always overwritten.
//!
//! Negative rates are returned as-is: a counter reset shows up as a negative
//! delta and the decision to clamp belongs to the metric that reads it.

use std::collections::HashMap;

use tracing::trace;

use crate::types::{Scope, SeriesKey};

/// Last raw observation of a cumulative counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Timestamp supplied by the observation, in seconds.
    pub timestamp: f64,
    /// Cumulative counter value.
    pub value: f64,
}

/// Mapping from series to its last sample.
#[derive(Debug, Default)]
pub struct DerivativeCache {
    samples: HashMap<SeriesKey, Sample>,
}

impl DerivativeCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observation and returns the per-second rate since the last one.
    ///
    /// Returns `None` on the first observation of `key`.
    #[allow(clippy::float_cmp)] // Only an exactly repeated timestamp is a zero interval
    pub fn rate(&mut self, key: &SeriesKey, timestamp: f64, value: f64) -> Option<f64> {
        let previous = self.samples.insert(key.clone(), Sample { timestamp, value })?;

        let dt = timestamp - previous.timestamp;
        let dv = value - previous.value;
        let rate = if dt == 0.0 { 0.0 } else { dv / dt };

        trace!(series = %key, dt, dv, rate, "derived rate");
        Some(rate)
    }

    /// Returns the last sample recorded for `key`.
    #[must_use]
    pub fn last_sample(&self, key: &SeriesKey) -> Option<Sample> {
        self.samples.get(key).copied()
    }

    /// Returns the number of tracked series.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if no series has been observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The derivative cache bound to one scope for the duration of a producer call.
///
/// Producers name series only; the orchestrator decides the scope.
#[derive(Debug)]
pub struct RateContext<'a> {
    scope: Scope,
    cache: &'a mut DerivativeCache,
}

impl<'a> RateContext<'a> {
    /// Binds `cache` to `scope`.
    pub fn new(scope: Scope, cache: &'a mut DerivativeCache) -> Self {
        Self { scope, cache }
    }

    /// Returns the scope series are recorded under.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Records an observation of `series` and returns its rate, if any.
    ///
    /// See [`DerivativeCache::rate`].
    pub fn rate(&mut self, series: &str, timestamp: f64, value: f64) -> Option<f64> {
        let key = SeriesKey::new(self.scope.clone(), series);
        self.cache.rate(&key, timestamp, value)
    }

    /// Like [`RateContext::rate`], but a negative rate is reported as `0`.
    ///
    /// For counters where a decrease can only mean a statistics reset.
    pub fn non_negative_rate(&mut self, series: &str, timestamp: f64, value: f64) -> Option<f64> {
        self.rate(series, timestamp, value).map(|rate| rate.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tx_key() -> SeriesKey {
        SeriesKey::new(Scope::Target("db1".into()), "tx")
    }

    #[test]
    fn first_observation_has_no_rate() {
        let mut cache = DerivativeCache::new();
        assert_eq!(cache.rate(&tx_key(), 100.0, 1_000.0), None);
        assert_eq!(
            cache.last_sample(&tx_key()),
            Some(Sample { timestamp: 100.0, value: 1_000.0 })
        );
    }

    #[test]
    fn transaction_counter_scenario() {
        let mut cache = DerivativeCache::new();
        let key = tx_key();

        assert_eq!(cache.rate(&key, 100.0, 1_000.0), None);
        assert_eq!(cache.rate(&key, 110.0, 1_050.0), Some(5.0));
        // Same timestamp again: no observable change, never a division by zero.
        assert_eq!(cache.rate(&key, 110.0, 1_050.0), Some(0.0));
    }

    #[test]
    fn equal_timestamps_with_changed_value_is_zero() {
        let mut cache = DerivativeCache::new();
        let key = tx_key();
        cache.rate(&key, 50.0, 1.0);
        assert_eq!(cache.rate(&key, 50.0, 99.0), Some(0.0));
        assert_eq!(cache.last_sample(&key).map(|s| s.value), Some(99.0));
    }

    #[test]
    fn counter_reset_is_not_clamped() {
        let mut cache = DerivativeCache::new();
        let key = tx_key();
        cache.rate(&key, 190.0, 500.0);
        assert_eq!(cache.rate(&key, 200.0, 10.0), Some(-49.0));
    }

    #[test]
    fn fractional_intervals_are_kept() {
        let mut cache = DerivativeCache::new();
        let key = tx_key();
        cache.rate(&key, 10.0, 0.0);
        let rate = cache.rate(&key, 10.5, 1.0).expect("second observation");
        assert!((rate - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn series_are_partitioned_by_scope() {
        let mut cache = DerivativeCache::new();
        let db1 = SeriesKey::new(Scope::Target("db1".into()), "tx");
        let db2 = SeriesKey::new(Scope::Target("db2".into()), "tx");

        assert_eq!(cache.rate(&db1, 0.0, 0.0), None);
        assert_eq!(cache.rate(&db2, 5.0, 100.0), None);
        assert_eq!(cache.rate(&db1, 10.0, 10.0), Some(1.0));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn rate_context_uses_bound_scope() {
        let mut cache = DerivativeCache::new();
        {
            let mut rates = RateContext::new(Scope::Target("db1".into()), &mut cache);
            assert_eq!(rates.rate("tx", 0.0, 0.0), None);
            assert_eq!(rates.scope().as_str(), "db1");
        }
        assert!(cache.last_sample(&tx_key()).is_some());
    }

    #[test]
    fn non_negative_rate_clamps_resets() {
        let mut cache = DerivativeCache::new();
        let mut rates = RateContext::new(Scope::Global, &mut cache);
        assert_eq!(rates.non_negative_rate("rollbacks", 0.0, 100.0), None);
        assert_eq!(rates.non_negative_rate("rollbacks", 10.0, 0.0), Some(0.0));
        assert_eq!(rates.non_negative_rate("rollbacks", 20.0, 50.0), Some(5.0));
    }

    proptest! {
        #[test]
        fn prop_rate_matches_formula(
            t1 in 0.0f64..1e9,
            dt in 0.001f64..1e6,
            v1 in -1e12f64..1e12,
            v2 in -1e12f64..1e12,
        ) {
            let mut cache = DerivativeCache::new();
            let key = tx_key();
            let t2 = t1 + dt;

            prop_assert_eq!(cache.rate(&key, t1, v1), None);
            let rate = cache.rate(&key, t2, v2);
            prop_assert_eq!(rate, Some((v2 - v1) / (t2 - t1)));
        }

        #[test]
        fn prop_cache_holds_latest_sample(
            observations in proptest::collection::vec((0.0f64..1e6, 0.0f64..1e9), 1..50),
        ) {
            let mut cache = DerivativeCache::new();
            let key = tx_key();
            for (t, v) in &observations {
                cache.rate(&key, *t, *v);
            }
            let (t, v) = observations[observations.len() - 1];
            prop_assert_eq!(cache.last_sample(&key), Some(Sample { timestamp: t, value: v }));
        }
    }
}
