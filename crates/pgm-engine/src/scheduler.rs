//! Run scheduler: decides whether a producer is due for a scope.
//!
//! The registry holds one last-run timestamp per [`ScheduleKey`]. A key that
//! has never run is due; afterwards it is due when strictly more than its
//! interval has elapsed since the last run.
//! The timestamp is updated as soon as a run is judged due, before the
//! producer executes, so a slow or failing producer is never retried on the
//! next tick.

use std::collections::HashMap;

use tracing::trace;

use crate::types::ScheduleKey;

/// Last-run registry and due-ness decision.
#[derive(Debug, Default)]
pub struct RunScheduler {
    last_run: HashMap<ScheduleKey, f64>,
}

impl RunScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `key` is due at `now` and records `now` as its last run.
    ///
    /// A key absent from the registry is always due. Otherwise due iff
    /// `now - last_run > interval_secs`; a clock moving backwards keeps the key
    /// not-due until the interval has elapsed again.
    pub fn is_due(&mut self, key: &ScheduleKey, interval_secs: u64, now: f64) -> bool {
        let due = match self.last_run.get(key) {
            None => true,
            Some(&last_run) => now - last_run > interval_secs as f64,
        };

        if due {
            trace!(key = %key, now, interval_secs, "schedule key is due");
            self.last_run.insert(key.clone(), now);
            true
        } else {
            false
        }
    }

    /// Returns the recorded last-run timestamp for `key`.
    #[must_use]
    pub fn last_run(&self, key: &ScheduleKey) -> Option<f64> {
        self.last_run.get(key).copied()
    }

    /// Returns the number of keys that have run at least once.
    #[must_use]
    pub fn len(&self) -> usize {
        self.last_run.len()
    }

    /// Returns `true` if no key has run yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_run.is_empty()
    }
}
