//! Statistic producers backed by PostgreSQL queries and the data directory.
//!
//! Every producer is registered under the name used in configuration. The
//! per-database ones are meant for `db_functions`, the cluster-wide ones for
//! `global_db_functions`, and `wal_file_amount` for `data_dir_functions`.

use std::path::{Path, PathBuf};

use pgm_engine::{
    EngineError, MetricRecord, ProduceFuture, ProducerRegistry, RateContext, StatisticProducer,
    Target,
};
use tracing::{error, warn};

use crate::metrics;
use crate::postgres::PgTarget;
use crate::queries::{self, HeapBlocks, LockSummary, TransactionCounters};
use crate::wal::count_wal_files;

/// Producer names meant for `db_functions`.
pub const DB_PRODUCERS: [&str; 7] = [
    "disk_usage",
    "tx_rate",
    "seconds_since_last_vacuum",
    "heap_hit_statistics",
    "oldest_transaction",
    "table_bloat",
    "index_hit_rates",
];

/// Producer names meant for `global_db_functions`.
pub const GLOBAL_PRODUCERS: [&str; 6] = [
    "client_connections",
    "lock_statistics",
    "replication_delays",
    "incoming_replication_status",
    "xid_remaining",
    "mxid_remaining",
];

/// Producer names meant for `data_dir_functions`.
pub const DATA_DIR_PRODUCERS: [&str; 1] = ["wal_file_amount"];

type CollectFn = for<'a> fn(&'a mut PgTarget, RateContext<'a>) -> ProduceFuture<'a>;

/// A producer that runs queries through the target connection.
#[derive(Clone, Copy)]
pub struct PgProducer {
    name: &'static str,
    collect: CollectFn,
}

impl std::fmt::Debug for PgProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgProducer").field("name", &self.name).finish()
    }
}

impl StatisticProducer<PgTarget> for PgProducer {
    fn name(&self) -> &str {
        self.name
    }

    fn produce<'a>(&'a self, target: &'a mut PgTarget, rates: RateContext<'a>) -> ProduceFuture<'a> {
        (self.collect)(target, rates)
    }
}

/// Counts WAL segment files; ignores the target connection.
#[derive(Debug, Clone)]
pub struct WalFileProducer {
    data_dir: Option<PathBuf>,
}

impl WalFileProducer {
    /// Creates the producer for an already resolved data directory.
    #[must_use]
    pub const fn new(data_dir: Option<PathBuf>) -> Self {
        Self { data_dir }
    }
}

impl StatisticProducer<PgTarget> for WalFileProducer {
    fn name(&self) -> &str {
        "wal_file_amount"
    }

    fn produce<'a>(&'a self, _target: &'a mut PgTarget, _rates: RateContext<'a>) -> ProduceFuture<'a> {
        Box::pin(async move { Ok(wal_file_records(self.data_dir.as_deref())) })
    }
}

/// Builds the registry of every producer this agent knows.
///
/// # Errors
///
/// Returns `EngineError::DuplicateProducer` if two producers share a name.
pub fn registry(data_dir: Option<PathBuf>) -> Result<ProducerRegistry<PgTarget>, EngineError> {
    let producers: [(&'static str, CollectFn); 13] = [
        ("disk_usage", disk_usage),
        ("tx_rate", tx_rate),
        ("seconds_since_last_vacuum", seconds_since_last_vacuum),
        ("heap_hit_statistics", heap_hit_statistics),
        ("oldest_transaction", oldest_transaction),
        ("table_bloat", table_bloat),
        ("index_hit_rates", index_hit_rates),
        ("client_connections", client_connections),
        ("lock_statistics", lock_statistics),
        ("replication_delays", replication_delays),
        ("incoming_replication_status", incoming_replication_status),
        ("xid_remaining", xid_remaining),
        ("mxid_remaining", mxid_remaining),
    ];

    let mut registry = ProducerRegistry::new();
    for (name, collect) in producers {
        registry.register(PgProducer { name, collect })?;
    }
    registry.register(WalFileProducer::new(data_dir))?;
    Ok(registry)
}

// ============================================================================
// Per-database producers
// ============================================================================

fn disk_usage<'a>(target: &'a mut PgTarget, _rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move {
        Ok(queries::disk_usage(target)
            .await?
            .map(|(database, size)| metrics::database_size(&database, size as f64))
            .into_iter()
            .collect())
    })
}

fn tx_rate<'a>(target: &'a mut PgTarget, mut rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move {
        Ok(queries::transaction_counters(target)
            .await?
            .map(|counters| transaction_rate_records(&counters, &mut rates))
            .unwrap_or_default())
    })
}

/// Transaction and rollback rates; empty on the first observation.
///
/// A decreasing counter can only mean a statistics reset, so negative rates
/// are reported as zero.
pub fn transaction_rate_records(
    counters: &TransactionCounters,
    rates: &mut RateContext<'_>,
) -> Vec<MetricRecord> {
    let at = queries::epoch_seconds(counters.observed_at);
    let transactions = rates.non_negative_rate("transactions", at, counters.transactions);
    let rollbacks = rates.non_negative_rate("rollbacks", at, counters.rollbacks);
    match (transactions, rollbacks) {
        (Some(tx), Some(rb)) => vec![
            metrics::transaction_rate(&counters.database, tx),
            metrics::rollbacks_rate(&counters.database, rb),
        ],
        _ => Vec::new(),
    }
}

fn seconds_since_last_vacuum<'a>(target: &'a mut PgTarget, _rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move {
        Ok(queries::seconds_since_last_vacuum(target)
            .await?
            .into_iter()
            .map(|(database, table, seconds)| {
                metrics::seconds_since_last_vacuum(&database, &table, seconds as f64)
            })
            .collect())
    })
}

fn heap_hit_statistics<'a>(target: &'a mut PgTarget, mut rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move {
        Ok(queries::heap_blocks(target)
            .await?
            .map(|blocks| heap_hit_records(&blocks, &mut rates))
            .unwrap_or_default())
    })
}

/// Heap read rates and the buffer hit ratio; empty on the first observation.
pub fn heap_hit_records(blocks: &HeapBlocks, rates: &mut RateContext<'_>) -> Vec<MetricRecord> {
    let at = queries::epoch_seconds(blocks.observed_at);
    let read = rates.rate("heap_read", at, blocks.read);
    let hit = rates.rate("heap_hit", at, blocks.hit);
    match (read, hit) {
        (Some(read), Some(hit)) => vec![
            metrics::blocks_read_from_disk(&blocks.database, read),
            metrics::blocks_read_from_buffer(&blocks.database, hit),
            metrics::blocks_heap_hit_ratio(&blocks.database, queries::heap_hit_ratio(read, hit)),
        ],
        _ => Vec::new(),
    }
}

fn oldest_transaction<'a>(target: &'a mut PgTarget, _rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move {
        Ok(queries::oldest_transaction(target)
            .await?
            .map(|(database, seconds)| metrics::sec_since_oldest_xact_start(&database, seconds as f64))
            .into_iter()
            .collect())
    })
}

fn table_bloat<'a>(target: &'a mut PgTarget, _rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move {
        let tables = queries::user_tables(target).await?;
        let mut records = Vec::with_capacity(tables.len());
        for (oid, table) in tables {
            match queries::table_bloat(target, oid).await {
                Ok(Some((database, bloat))) => {
                    records.push(metrics::table_bloat(&database, &table, bloat));
                }
                Ok(None) => {}
                Err(e) if target.is_usable() => {
                    warn!(database = target.database(), table = %table, error = %e, "table bloat query failed");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    })
}

fn index_hit_rates<'a>(target: &'a mut PgTarget, _rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move {
        Ok(queries::index_hit_rates(target)
            .await?
            .into_iter()
            .filter_map(|(database, table, ratio)| {
                ratio.map(|ratio| metrics::index_hit_ratio(&database, &table, ratio))
            })
            .collect())
    })
}

// ============================================================================
// Cluster-wide producers
// ============================================================================

fn client_connections<'a>(target: &'a mut PgTarget, _rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move {
        let count = queries::client_connections(target).await?;
        Ok(vec![metrics::client_connections(count as f64)])
    })
}

fn lock_statistics<'a>(target: &'a mut PgTarget, _rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move { Ok(lock_records(&queries::lock_statistics(target).await?)) })
}

/// Granted and waiting counts per lock type, followed by the totals.
pub fn lock_records(summary: &LockSummary) -> Vec<MetricRecord> {
    let mut records = Vec::with_capacity(summary.by_type.len() * 2 + 2);
    for (locktype, counts) in &summary.by_type {
        records.push(metrics::locks_granted(locktype, counts.granted as f64));
        records.push(metrics::locks_waiting(locktype, counts.waiting as f64));
    }
    records.push(metrics::locks_granted("total", summary.total.granted as f64));
    records.push(metrics::locks_waiting("total", summary.total.waiting as f64));
    records
}

fn replication_delays<'a>(target: &'a mut PgTarget, _rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move {
        Ok(queries::replication_delays(target)
            .await?
            .into_iter()
            .map(|(addr, bytes)| metrics::replication_delay_bytes(addr.as_deref(), bytes))
            .collect())
    })
}

fn incoming_replication_status<'a>(target: &'a mut PgTarget, _rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move {
        Ok(queries::wal_receiver_status(target)
            .await?
            .into_iter()
            .map(|(host, streaming)| metrics::incoming_replication_running(&host, f64::from(streaming)))
            .collect())
    })
}

fn xid_remaining<'a>(target: &'a mut PgTarget, _rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move {
        Ok(queries::max_xid_age(target)
            .await?
            .map(|age| metrics::xid_remaining(queries::wraparound_remaining_percent(age)))
            .into_iter()
            .collect())
    })
}

fn mxid_remaining<'a>(target: &'a mut PgTarget, _rates: RateContext<'a>) -> ProduceFuture<'a> {
    Box::pin(async move {
        Ok(queries::max_mxid_age(target)
            .await?
            .map(|age| metrics::mxid_remaining(queries::wraparound_remaining_percent(age)))
            .into_iter()
            .collect())
    })
}

// ============================================================================
// Data directory producer
// ============================================================================

/// One `wal-file-amount` record; `0` when the directory is unknown or unreadable.
pub fn wal_file_records(data_dir: Option<&Path>) -> Vec<MetricRecord> {
    let count = match data_dir {
        Some(dir) => count_wal_files(dir).unwrap_or_else(|e| {
            error!(data_dir = %dir.display(), error = %e, "failed accessing WAL files, is the data directory readable?");
            0
        }),
        None => 0,
    };
    vec![metrics::wal_file_amount(count as f64)]
}
