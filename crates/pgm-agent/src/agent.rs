//! The driving loop: connects to the databases, runs passes and ships records.

use std::path::PathBuf;
use std::time::Duration;

use pgm_engine::{MetricRecord, Orchestrator, PassMode, PassOutcome, Target, TargetHealth};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::ffwd::FfwdSink;
use crate::postgres::{PgConnector, PgTarget};
use crate::producers;
use crate::shutdown::Shutdown;
use crate::wal;

/// Pause between the two passes of `all`, so rates have a previous sample.
pub const PRIME_DELAY: Duration = Duration::from_secs(5);

/// Builds the orchestrator for the producer lists in `config`.
///
/// Data directory producers join the cluster-wide list after the global
/// database producers.
///
/// # Errors
///
/// Returns `AgentError::Engine` if a configured producer name is unknown.
pub fn build_orchestrator(config: &Config, data_dir: Option<PathBuf>) -> Result<Orchestrator<PgTarget>> {
    let registry = producers::registry(data_dir)?;

    let mut global = registry.resolve(&config.global_db_functions)?;
    global.extend(registry.resolve(&config.data_dir_functions)?);
    let per_target = registry.resolve(&config.db_functions)?;

    debug!(
        global = global.len(),
        per_database = per_target.len(),
        "resolved configured producers"
    );
    Ok(Orchestrator::new(global, per_target))
}

/// Checks every configured producer name before any connection is opened.
///
/// # Errors
///
/// Returns `AgentError::Engine` naming the first unknown producer.
pub fn check_producer_names(config: &Config) -> Result<()> {
    build_orchestrator(config, None).map(|_| ())
}

/// Long-lived agent state: connections, schedule and rate history.
pub struct Agent {
    health: TargetHealth<PgConnector>,
    targets: Vec<PgTarget>,
    orchestrator: Orchestrator<PgTarget>,
    tick: Duration,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("targets", &self.targets)
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Connects to every configured database and prepares the producers.
    ///
    /// # Errors
    ///
    /// Returns an error if a producer name is unknown or a database cannot be
    /// reached.
    pub async fn connect(config: &Config) -> Result<Self> {
        check_producer_names(config)?;

        let health = TargetHealth::new(PgConnector::from_config(&config.postgres));
        let targets: Vec<PgTarget> = health
            .connect_all(&config.postgres.target_databases())
            .await?;

        let server_version = targets
            .first()
            .map(PgTarget::server_version)
            .ok_or_else(|| AgentError::Config("no databases to monitor".to_string()))?;
        let data_dir = wal::resolve_data_dir(config.postgres.data_dir.as_deref(), server_version);
        if data_dir.is_none() && !config.data_dir_functions.is_empty() {
            warn!("postgres data directory not found, data directory metrics will report zero");
        }

        let orchestrator = build_orchestrator(config, data_dir)?;
        info!(databases = targets.len(), server_version, "connected to postgres");

        Ok(Self {
            health,
            targets,
            orchestrator,
            tick: Duration::from_secs(config.agent.tick_secs),
        })
    }

    /// Returns the database handles, in configured order.
    #[must_use]
    pub fn targets(&self) -> &[PgTarget] {
        &self.targets
    }

    /// Runs every producer twice, [`PRIME_DELAY`] apart, and returns the
    /// records of the second pass.
    pub async fn collect_all(&mut self) -> Vec<MetricRecord> {
        self.orchestrator
            .run_pass(&mut self.targets, PassMode::Immediate)
            .await;
        info!(
            secs = PRIME_DELAY.as_secs(),
            "sleeping to get diffs on derivative metrics"
        );
        tokio::time::sleep(PRIME_DELAY).await;
        self.orchestrator
            .run_pass(&mut self.targets, PassMode::Immediate)
            .await
            .records
    }

    /// Reconnects closed handles, then runs the producers that are due.
    pub async fn tick(&mut self) -> PassOutcome {
        let failures = self.health.refresh_all(&mut self.targets).await;
        if !failures.is_empty() {
            warn!(count = failures.len(), "some databases are still unreachable");
        }
        self.orchestrator
            .run_pass(&mut self.targets, PassMode::Scheduled)
            .await
    }

    /// Polls until `shutdown` fires, sending each non-empty batch to `sink`.
    ///
    /// Shutdown is only observed between passes; a running pass finishes and
    /// its batch is sent first. Send failures are logged and the loop goes on.
    pub async fn run_long_running(mut self, sink: &FfwdSink, mut shutdown: Shutdown) {
        info!(
            databases = self.targets.len(),
            tick_secs = self.tick.as_secs(),
            ffwd = sink.address(),
            "starting a long running statistics polling loop"
        );

        loop {
            if shutdown.sleep(self.tick).await {
                break;
            }

            let outcome = self.tick().await;
            if outcome.failed > 0 {
                debug!(failed = outcome.failed, "some producers failed this pass");
            }
            if outcome.records.is_empty() {
                continue;
            }

            info!(count = outcome.records.len(), "sending metrics to ffwd");
            if let Err(e) = sink.send(&outcome.records).await {
                error!(error = %e, "metrics check failed");
            }
        }

        self.shutdown().await;
    }

    /// Closes every database handle.
    pub async fn shutdown(self) {
        for target in self.targets {
            if target.is_usable() {
                target.close().await;
            }
        }
        info!("database connections closed");
    }
}
