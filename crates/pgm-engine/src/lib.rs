//! Scheduling and derivative engine for periodic database statistics.
#![forbid(unsafe_code)]
//!
//! `pgm-engine` decides which statistic producers run on each polling tick
//! and turns cumulative counters into per-second rates. It knows nothing
//! about PostgreSQL: targets, producers and records are abstract, and the
//! agent crate plugs in the real connections and queries.
//!
//! # Overview
//!
//! - [`RunScheduler`]: one last-run timestamp per `(scope, producer)`
//! - [`DerivativeCache`]: one last sample per `(scope, series)`
//! - [`ProducerRegistry`]: resolves configured names into producers
//! - [`TargetHealth`]: replaces closed target handles before a pass
//! - [`Orchestrator`]: runs one pass over all targets
//!
//! # Example
//!
//! ```rust
//! use pgm_engine::{RunScheduler, ScheduleKey, Scope};
//!
//! let mut scheduler = RunScheduler::new();
//! let key = ScheduleKey::new(Scope::target("db1").unwrap(), "tx_rate");
//!
//! assert!(scheduler.is_due(&key, 60, 1_000.0));
//! assert!(!scheduler.is_due(&key, 60, 1_030.0));
//! assert!(scheduler.is_due(&key, 60, 1_061.0));
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod clock;
pub mod derive;
pub mod error;
pub mod orchestrator;
pub mod producer;
pub mod scheduler;
pub mod target;
pub mod types;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use derive::{DerivativeCache, RateContext, Sample};
pub use error::{EngineError, Result};
pub use orchestrator::{Orchestrator, PassMode, PassOutcome};
pub use producer::{ProduceFuture, ProducerRegistry, ProducerSpec, ScheduledProducer, StatisticProducer};
pub use scheduler::RunScheduler;
pub use target::{ConnectFuture, Connector, Target, TargetHealth};
pub use types::{MetricRecord, ScheduleKey, Scope, SeriesKey};
