//! Statistic producers and the registry that resolves them from configuration.
//!
//! A producer is a named function that, given a target handle, yields zero or
//! more [`MetricRecord`]s. Producers are registered once at startup under a
//! stable name; configuration refers to them by that name together with a run
//! interval. Resolving configuration against the registry turns an unknown
//! name into a startup error instead of a runtime surprise.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::derive::RateContext;
use crate::error::{EngineError, Result};
use crate::types::MetricRecord;

/// Boxed future returned by [`StatisticProducer::produce`].
pub type ProduceFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<MetricRecord>>> + Send + 'a>>;

/// Trait for statistic producers.
///
/// Implement this trait to gather one statistic from a target of type `T`.
pub trait StatisticProducer<T>: Send + Sync {
    /// Stable name used in configuration and schedule keys.
    fn name(&self) -> &str;

    /// Collects the statistic from `target`.
    ///
    /// Producers reporting rates of cumulative counters record their raw
    /// observations through `rates`.
    ///
    /// # Errors
    ///
    /// Returns an error if the statistic could not be obtained.
    fn produce<'a>(&'a self, target: &'a mut T, rates: RateContext<'a>) -> ProduceFuture<'a>;
}

/// One configured producer entry: a name and its run interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerSpec {
    /// Registered producer name.
    pub name: String,
    /// Minimum seconds between two runs for the same scope.
    pub interval_secs: u64,
}

impl ProducerSpec {
    /// Creates a new entry.
    #[must_use]
    pub fn new(name: impl Into<String>, interval_secs: u64) -> Self {
        Self {
            name: name.into(),
            interval_secs,
        }
    }
}

/// A resolved producer together with its configured interval.
pub struct ScheduledProducer<T> {
    producer: Arc<dyn StatisticProducer<T>>,
    interval_secs: u64,
}

impl<T> ScheduledProducer<T> {
    /// Pairs a producer with its interval.
    #[must_use]
    pub fn new(producer: Arc<dyn StatisticProducer<T>>, interval_secs: u64) -> Self {
        Self {
            producer,
            interval_secs,
        }
    }

    /// Returns the producer name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.producer.name()
    }

    /// Returns the configured interval.
    #[must_use]
    pub const fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    /// Returns the underlying producer.
    #[must_use]
    pub fn producer(&self) -> &dyn StatisticProducer<T> {
        self.producer.as_ref()
    }
}

impl<T> Clone for ScheduledProducer<T> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
            interval_secs: self.interval_secs,
        }
    }
}

impl<T> fmt::Debug for ScheduledProducer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledProducer")
            .field("name", &self.name())
            .field("interval_secs", &self.interval_secs)
            .finish()
    }
}

/// Static mapping from producer name to implementation.
pub struct ProducerRegistry<T> {
    producers: BTreeMap<String, Arc<dyn StatisticProducer<T>>>,
}

impl<T> Default for ProducerRegistry<T> {
    fn default() -> Self {
        Self {
            producers: BTreeMap::new(),
        }
    }
}

impl<T> fmt::Debug for ProducerRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerRegistry")
            .field("names", &self.producers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T> ProducerRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a producer under its own name.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DuplicateProducer` if the name is taken.
    pub fn register(&mut self, producer: impl StatisticProducer<T> + 'static) -> Result<()> {
        self.register_arc(Arc::new(producer))
    }

    /// Registers an already shared producer.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DuplicateProducer` if the name is taken.
    pub fn register_arc(&mut self, producer: Arc<dyn StatisticProducer<T>>) -> Result<()> {
        let name = producer.name().to_string();
        if self.producers.contains_key(&name) {
            return Err(EngineError::DuplicateProducer { name });
        }
        self.producers.insert(name, producer);
        Ok(())
    }

    /// Returns `true` if a producer is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.producers.contains_key(name)
    }

    /// Returns the registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.producers.keys().map(String::as_str).collect()
    }

    /// Returns the number of registered producers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Resolves configured entries into scheduled producers, keeping their order.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownProducer` for the first name that is not
    /// registered.
    pub fn resolve(&self, specs: &[ProducerSpec]) -> Result<Vec<ScheduledProducer<T>>> {
        specs
            .iter()
            .map(|spec| {
                let producer = self.producers.get(&spec.name).ok_or_else(|| {
                    EngineError::UnknownProducer {
                        name: spec.name.clone(),
                        known: self.names().join(", "),
                    }
                })?;
                debug!(producer = %spec.name, interval_secs = spec.interval_secs, "resolved producer");
                Ok(ScheduledProducer::new(Arc::clone(producer), spec.interval_secs))
            })
            .collect()
    }
}
