//! Collection orchestrator: drives one polling pass.
//!
//! A pass runs the global producers once, against the first usable target and
//! under the global scope, then the per-target producers once for every usable
//! target under that target's own scope. In [`PassMode::Scheduled`] each
//! `(scope, producer)` pair is first checked against the [`RunScheduler`]; in
//! [`PassMode::Immediate`] every producer runs.
//!
//! A failing producer is logged and contributes nothing; the pass always
//! completes. Scheduling state was already advanced before the call, so a
//! failure does not make the producer due again on the next tick.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::clock::{Clock, SystemClock};
use crate::derive::{DerivativeCache, RateContext};
use crate::producer::ScheduledProducer;
use crate::scheduler::RunScheduler;
use crate::target::Target;
use crate::types::{MetricRecord, ScheduleKey, Scope};

/// How a pass treats scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    /// Only run producers whose interval has elapsed for their scope.
    Scheduled,
    /// Run every producer, ignoring and not touching scheduling state.
    Immediate,
}

/// Result of one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassOutcome {
    /// Records in pass order: global producers first, then per target.
    pub records: Vec<MetricRecord>,
    /// Number of producer invocations.
    pub dispatched: usize,
    /// Number of invocations that returned an error.
    pub failed: usize,
    /// Number of targets skipped because their handle was not usable.
    pub skipped_targets: usize,
}

/// Owns scheduling and derivative state and runs passes over targets.
pub struct Orchestrator<T> {
    scheduler: RunScheduler,
    cache: DerivativeCache,
    clock: Arc<dyn Clock>,
    global: Vec<ScheduledProducer<T>>,
    per_target: Vec<ScheduledProducer<T>>,
}

impl<T> std::fmt::Debug for Orchestrator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("global", &self.global)
            .field("per_target", &self.per_target)
            .field("schedule_keys", &self.scheduler.len())
            .field("series", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl<T: Target> Orchestrator<T> {
    /// Creates an orchestrator with fresh state and the system clock.
    #[must_use]
    pub fn new(global: Vec<ScheduledProducer<T>>, per_target: Vec<ScheduledProducer<T>>) -> Self {
        Self {
            scheduler: RunScheduler::new(),
            cache: DerivativeCache::new(),
            clock: Arc::new(SystemClock),
            global,
            per_target,
        }
    }

    /// Replaces the scheduling and derivative state.
    #[must_use]
    pub fn with_state(mut self, scheduler: RunScheduler, cache: DerivativeCache) -> Self {
        self.scheduler = scheduler;
        self.cache = cache;
        self
    }

    /// Replaces the clock used for scheduling decisions.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the run scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &RunScheduler {
        &self.scheduler
    }

    /// Returns the derivative cache.
    #[must_use]
    pub const fn cache(&self) -> &DerivativeCache {
        &self.cache
    }

    /// Returns the configured global producers.
    #[must_use]
    pub fn global_producers(&self) -> &[ScheduledProducer<T>] {
        &self.global
    }

    /// Returns the configured per-target producers.
    #[must_use]
    pub fn per_target_producers(&self) -> &[ScheduledProducer<T>] {
        &self.per_target
    }

    /// Runs one pass over `targets`.
    ///
    /// Targets are visited in slice order. If no target is usable the global
    /// phase is skipped without consulting the scheduler.
    pub async fn run_pass(&mut self, targets: &mut [T], mode: PassMode) -> PassOutcome {
        let mut outcome = PassOutcome::default();

        match targets.iter_mut().find(|t| t.is_usable()) {
            Some(representative) => {
                run_phase(
                    &mut self.scheduler,
                    &mut self.cache,
                    self.clock.as_ref(),
                    &self.global,
                    &Scope::Global,
                    representative,
                    mode,
                    &mut outcome,
                )
                .await;
            }
            None if !self.global.is_empty() => {
                warn!("no usable target for global producers, skipping global phase");
            }
            None => {}
        }

        for target in targets.iter_mut() {
            if !target.is_usable() {
                warn!(scope = target.scope_name(), "target not usable, skipping");
                outcome.skipped_targets += 1;
                continue;
            }
            let scope = match Scope::target(target.scope_name()) {
                Ok(scope) => scope,
                Err(e) => {
                    error!(scope = target.scope_name(), error = %e, "invalid target scope, skipping");
                    outcome.skipped_targets += 1;
                    continue;
                }
            };
            run_phase(
                &mut self.scheduler,
                &mut self.cache,
                self.clock.as_ref(),
                &self.per_target,
                &scope,
                target,
                mode,
                &mut outcome,
            )
            .await;
        }

        debug!(
            ?mode,
            records = outcome.records.len(),
            dispatched = outcome.dispatched,
            failed = outcome.failed,
            skipped_targets = outcome.skipped_targets,
            "pass complete"
        );
        outcome
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_phase<T>(
    scheduler: &mut RunScheduler,
    cache: &mut DerivativeCache,
    clock: &dyn Clock,
    producers: &[ScheduledProducer<T>],
    scope: &Scope,
    target: &mut T,
    mode: PassMode,
    outcome: &mut PassOutcome,
) {
    for scheduled in producers {
        if mode == PassMode::Scheduled {
            let key = ScheduleKey::new(scope.clone(), scheduled.name());
            if !scheduler.is_due(&key, scheduled.interval_secs(), clock.now()) {
                continue;
            }
        }

        debug!(producer = scheduled.name(), %scope, "calling statistic producer");
        outcome.dispatched += 1;

        let rates = RateContext::new(scope.clone(), &mut *cache);
        match scheduled.producer().produce(&mut *target, rates).await {
            Ok(records) => outcome.records.extend(records),
            Err(e) => {
                outcome.failed += 1;
                error!(producer = scheduled.name(), %scope, error = %e, "statistic producer failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::EngineError;
    use crate::producer::{ProduceFuture, StatisticProducer};

    #[derive(Debug)]
    struct FakeTarget {
        name: String,
        usable: bool,
        calls: Vec<String>,
    }

    impl FakeTarget {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                usable: true,
                calls: Vec::new(),
            }
        }
    }

    impl Target for FakeTarget {
        fn scope_name(&self) -> &str {
            &self.name
        }

        fn is_usable(&self) -> bool {
            self.usable
        }
    }

    /// Emits one record tagged with the producer and target names.
    struct Echo(&'static str);

    impl StatisticProducer<FakeTarget> for Echo {
        fn name(&self) -> &str {
            self.0
        }

        fn produce<'a>(
            &'a self,
            target: &'a mut FakeTarget,
            _rates: RateContext<'a>,
        ) -> ProduceFuture<'a> {
            Box::pin(async move {
                target.calls.push(self.0.to_string());
                Ok(vec![
                    MetricRecord::new("test", 1.0)
                        .attr("producer", self.0)
                        .attr("target", target.name.clone()),
                ])
            })
        }
    }

    struct Failing;

    impl StatisticProducer<FakeTarget> for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn produce<'a>(
            &'a self,
            _target: &'a mut FakeTarget,
            _rates: RateContext<'a>,
        ) -> ProduceFuture<'a> {
            Box::pin(async { Err(EngineError::collection("query failed")) })
        }
    }

    fn scheduled(producer: impl StatisticProducer<FakeTarget> + 'static, interval: u64) -> ScheduledProducer<FakeTarget> {
        ScheduledProducer::new(Arc::new(producer), interval)
    }

    fn labels(outcome: &PassOutcome) -> Vec<(String, String)> {
        outcome
            .records
            .iter()
            .map(|r| {
                (
                    r.attribute("producer").unwrap_or_default().to_string(),
                    r.attribute("target").unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    fn pair(producer: &str, target: &str) -> (String, String) {
        (producer.to_string(), target.to_string())
    }

    #[tokio::test]
    async fn global_output_precedes_per_target_output() {
        let mut orchestrator = Orchestrator::new(
            vec![scheduled(Echo("locks"), 60)],
            vec![scheduled(Echo("tx_rate"), 60), scheduled(Echo("disk_usage"), 60)],
        )
        .with_clock(Arc::new(ManualClock::new(1_000.0)));
        let mut targets = vec![FakeTarget::new("db1"), FakeTarget::new("db2")];

        let outcome = orchestrator.run_pass(&mut targets, PassMode::Scheduled).await;

        assert_eq!(
            labels(&outcome),
            vec![
                pair("locks", "db1"),
                pair("tx_rate", "db1"),
                pair("disk_usage", "db1"),
                pair("tx_rate", "db2"),
                pair("disk_usage", "db2"),
            ]
        );
        assert_eq!(outcome.dispatched, 5);
        assert_eq!(outcome.failed, 0);
    }

    #[tokio::test]
    async fn scheduled_pass_respects_intervals_per_scope() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let mut orchestrator = Orchestrator::new(
            vec![scheduled(Echo("locks"), 60)],
            vec![scheduled(Echo("tx_rate"), 30)],
        )
        .with_clock(clock.clone());
        let mut targets = vec![FakeTarget::new("db1"), FakeTarget::new("db2")];

        assert_eq!(orchestrator.run_pass(&mut targets, PassMode::Scheduled).await.dispatched, 3);

        clock.advance(5.0);
        assert!(orchestrator.run_pass(&mut targets, PassMode::Scheduled).await.records.is_empty());

        clock.advance(30.0);
        let outcome = orchestrator.run_pass(&mut targets, PassMode::Scheduled).await;
        assert_eq!(labels(&outcome), vec![pair("tx_rate", "db1"), pair("tx_rate", "db2")]);

        clock.advance(30.0);
        let outcome = orchestrator.run_pass(&mut targets, PassMode::Scheduled).await;
        assert_eq!(
            labels(&outcome),
            vec![pair("locks", "db1"), pair("tx_rate", "db1"), pair("tx_rate", "db2")]
        );
    }

    #[tokio::test]
    async fn global_producers_are_rate_limited_once_overall() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let mut orchestrator =
            Orchestrator::new(vec![scheduled(Echo("locks"), 60)], vec![]).with_clock(clock.clone());
        let mut targets = vec![FakeTarget::new("db1"), FakeTarget::new("db2")];

        orchestrator.run_pass(&mut targets, PassMode::Scheduled).await;
        assert_eq!(
            orchestrator
                .scheduler()
                .last_run(&ScheduleKey::new(Scope::Global, "locks")),
            Some(1_000.0)
        );
        assert_eq!(orchestrator.scheduler().len(), 1);
        assert_eq!(targets[0].calls, vec!["locks"]);
        assert!(targets[1].calls.is_empty());
    }

    #[tokio::test]
    async fn immediate_pass_ignores_and_keeps_scheduling_state() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let mut orchestrator = Orchestrator::new(
            vec![scheduled(Echo("locks"), 3_600)],
            vec![scheduled(Echo("tx_rate"), 3_600)],
        )
        .with_clock(clock);
        let mut targets = vec![FakeTarget::new("db1")];

        for _ in 0..3 {
            let outcome = orchestrator.run_pass(&mut targets, PassMode::Immediate).await;
            assert_eq!(outcome.dispatched, 2);
        }
        assert!(orchestrator.scheduler().is_empty());
        assert_eq!(targets[0].calls.len(), 6);
    }

    #[tokio::test]
    async fn failing_producer_is_isolated_and_not_retried() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let mut orchestrator = Orchestrator::new(
            vec![scheduled(Failing, 60), scheduled(Echo("locks"), 60)],
            vec![scheduled(Failing, 60), scheduled(Echo("tx_rate"), 60)],
        )
        .with_clock(clock.clone());
        let mut targets = vec![FakeTarget::new("db1")];

        let outcome = orchestrator.run_pass(&mut targets, PassMode::Scheduled).await;
        assert_eq!(labels(&outcome), vec![pair("locks", "db1"), pair("tx_rate", "db1")]);
        assert_eq!(outcome.failed, 2);

        clock.advance(5.0);
        let outcome = orchestrator.run_pass(&mut targets, PassMode::Scheduled).await;
        assert_eq!(outcome.dispatched, 0);
        assert_eq!(
            orchestrator
                .scheduler()
                .last_run(&ScheduleKey::new(Scope::Target("db1".into()), "failing")),
            Some(1_000.0)
        );
    }

    #[tokio::test]
    async fn unusable_targets_are_skipped() {
        let mut orchestrator = Orchestrator::new(
            vec![scheduled(Echo("locks"), 60)],
            vec![scheduled(Echo("tx_rate"), 60)],
        );
        let mut first = FakeTarget::new("db1");
        first.usable = false;
        let mut targets = vec![first, FakeTarget::new("db2")];

        let outcome = orchestrator.run_pass(&mut targets, PassMode::Immediate).await;

        assert_eq!(labels(&outcome), vec![pair("locks", "db2"), pair("tx_rate", "db2")]);
        assert_eq!(outcome.skipped_targets, 1);
    }

    #[tokio::test]
    async fn global_phase_waits_when_nothing_is_usable() {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let mut orchestrator =
            Orchestrator::new(vec![scheduled(Echo("locks"), 60)], vec![]).with_clock(clock.clone());
        let mut closed = FakeTarget::new("db1");
        closed.usable = false;
        let mut targets = vec![closed];

        let outcome = orchestrator.run_pass(&mut targets, PassMode::Scheduled).await;
        assert!(outcome.records.is_empty());
        assert!(orchestrator.scheduler().is_empty());

        targets[0].usable = true;
        clock.advance(1.0);
        let outcome = orchestrator.run_pass(&mut targets, PassMode::Scheduled).await;
        assert_eq!(labels(&outcome), vec![pair("locks", "db1")]);
    }

    #[tokio::test]
    async fn target_named_like_sentinel_is_skipped() {
        let mut orchestrator = Orchestrator::new(vec![], vec![scheduled(Echo("tx_rate"), 0)]);
        let mut targets = vec![FakeTarget::new(Scope::GLOBAL_ID)];

        let outcome = orchestrator.run_pass(&mut targets, PassMode::Immediate).await;
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.skipped_targets, 1);
    }
}
