//! Core types for the collection engine.
//!
//! - [`Scope`]: partition of scheduling and derivative state
//! - [`ScheduleKey`]: identifies one last-run timestamp
//! - [`SeriesKey`]: identifies one cumulative counter stream
//! - [`MetricRecord`]: a finished metric, opaque to the orchestrator

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Logical partition for scheduling and derivative state.
///
/// Either a specific monitored target or the reserved global sentinel. Target
/// names are validated against the sentinel, so the two can never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Cluster-wide scope used by global producers.
    Global,
    /// A single monitored target, by logical name.
    Target(String),
}

impl Scope {
    /// Identifier reserved for the global scope.
    pub const GLOBAL_ID: &'static str = "__cluster_global__";

    /// Creates a target scope.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidScope` if the name is empty or equals
    /// [`Scope::GLOBAL_ID`].
    pub fn target(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        Self::validate_target_name(&name)?;
        Ok(Self::Target(name))
    }

    /// Checks that `name` can be used as a target scope.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidScope` if the name is empty or reserved.
    pub fn validate_target_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidScope {
                reason: "target name cannot be empty".to_string(),
            });
        }
        if name == Self::GLOBAL_ID {
            return Err(EngineError::InvalidScope {
                reason: format!("target name '{name}' is reserved for the global scope"),
            });
        }
        Ok(())
    }

    /// Returns the scope identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Global => Self::GLOBAL_ID,
            Self::Target(name) => name,
        }
    }

    /// Returns `true` for the global scope.
    #[must_use]
    pub const fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of one last-run timestamp in the run registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScheduleKey {
    /// Scope the producer runs under.
    pub scope: Scope,
    /// Name of the producer.
    pub producer: String,
}

impl ScheduleKey {
    /// Creates a new schedule key.
    #[must_use]
    pub fn new(scope: Scope, producer: impl Into<String>) -> Self {
        Self {
            scope,
            producer: producer.into(),
        }
    }
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.producer)
    }
}

/// Key of one cumulative counter stream in the derivative cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    /// Scope the counter belongs to.
    pub scope: Scope,
    /// Name of the counter, e.g. `transactions`.
    pub series: String,
}

impl SeriesKey {
    /// Creates a new series key.
    #[must_use]
    pub fn new(scope: Scope, series: impl Into<String>) -> Self {
        Self {
            scope,
            series: series.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.series)
    }
}

/// A finished metric in Metrics 2.0 shape.
///
/// The engine passes records through unmodified; only producers and the
/// transport look inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Record type, always `metric` for records built with [`MetricRecord::new`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Metric namespace key.
    pub key: String,
    /// The measured value.
    pub value: f64,
    /// Dimensional attributes (`what`, `unit`, `database`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl MetricRecord {
    /// Record type used for all gauge-like records.
    pub const DEFAULT_KIND: &'static str = "metric";

    /// Creates a record under the given namespace key.
    #[must_use]
    pub fn new(key: impl Into<String>, value: f64) -> Self {
        Self {
            kind: Self::DEFAULT_KIND.to_string(),
            key: key.into(),
            value,
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute and returns self for chaining.
    #[must_use]
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Returns the value of an attribute, if set.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}
