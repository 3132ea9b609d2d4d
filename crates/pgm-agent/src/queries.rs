//! Statistics queries against a monitored database.
//!
//! Each query casts its columns to types that decode without extra features
//! (`text`, `int8`, `float8`, `timestamptz`). The computations on the fetched
//! values are plain functions so they can be tested without a server.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error};

use crate::error::Result;
use crate::postgres::{PG_VERSION_10, PG_VERSION_9_5, PgTarget};

/// Transaction id space before wraparound.
pub const WRAPAROUND_HORIZON: f64 = 2_147_483_648.0;

const CLIENT_CONNECTIONS_SQL: &str = "SELECT count(*)::int8 FROM pg_stat_activity";

const DISK_USAGE_SQL: &str = "SELECT datname::text, pg_database_size(datname)::int8 \
     FROM pg_database WHERE datname = current_database()";

const TRANSACTION_COUNTERS_SQL: &str = "SELECT datname::text, now(), \
     (xact_commit + xact_rollback)::float8, xact_rollback::float8 \
     FROM pg_stat_database WHERE datname = current_database()";

const LAST_VACUUM_SQL: &str = "SELECT current_database()::text, relname::text, now(), \
     last_vacuum, last_autovacuum FROM pg_stat_user_tables";

const HEAP_BLOCKS_SQL: &str = "SELECT current_database()::text, now(), \
     sum(heap_blks_read)::float8, sum(heap_blks_hit)::float8 FROM pg_statio_user_tables";

const LOCKS_SQL: &str =
    "SELECT locktype::text, granted, count(*)::int8 FROM pg_locks GROUP BY locktype, granted";

const OLDEST_TRANSACTION_SQL: &str = "SELECT datname::text, now(), xact_start \
     FROM pg_stat_activity WHERE xact_start IS NOT NULL AND datname = current_database() \
     ORDER BY xact_start ASC LIMIT 1";

const USER_TABLES_SQL: &str = "SELECT oid::int8, relname::text FROM pg_class \
     WHERE relkind = 'r' AND relname NOT LIKE 'pg_%' AND relname NOT LIKE 'sql_%'";

const TABLE_BLOAT_SQL: &str = "SELECT current_database::text, dead_tuple_percent::float8 \
     FROM pgstattuple_for_table_oid($1)";

const INDEX_SCANS_SQL: &str = "SELECT current_database()::text, relname::text, \
     idx_scan::float8, seq_scan::float8 FROM pg_stat_user_tables";

const REPLICATION_DELAY_SQL: &str = "SELECT host(client_addr), \
     pg_xlog_location_diff(pg_current_xlog_location(), replay_location)::float8 \
     FROM public.pg_stat_repl";

const WAL_RECEIVER_SQL: &str = "SELECT conninfo::text, \
     (CASE WHEN status = 'streaming' THEN 1 ELSE 0 END)::int4 \
     FROM public.stat_incoming_replication";

const MAX_XID_AGE_SQL: &str = "SELECT max(age(datfrozenxid))::int8 FROM pg_database";

const MAX_MXID_AGE_SQL: &str =
    "SELECT max(mxid_age(relminmxid))::int8 FROM pg_class WHERE relminmxid <> '0'";

static CONNINFO_HOST_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)host=(\S+)").unwrap_or_else(|_| unreachable!()));

/// Cumulative transaction counters of the current database.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionCounters {
    /// Database name.
    pub database: String,
    /// Server time of the observation.
    pub observed_at: DateTime<Utc>,
    /// Commits plus rollbacks.
    pub transactions: f64,
    /// Rollbacks.
    pub rollbacks: f64,
}

/// Cumulative heap block counters of the current database.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapBlocks {
    /// Database name.
    pub database: String,
    /// Server time of the observation.
    pub observed_at: DateTime<Utc>,
    /// Blocks read from disk.
    pub read: f64,
    /// Blocks found in the buffer cache.
    pub hit: f64,
}

/// Waiting and granted lock counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockCounts {
    /// Locks not yet granted.
    pub waiting: i64,
    /// Granted locks.
    pub granted: i64,
}

/// Lock counts per lock type plus the overall total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSummary {
    /// Counts keyed by lock type.
    pub by_type: BTreeMap<String, LockCounts>,
    /// Sum over all lock types.
    pub total: LockCounts,
}

/// Converts a server timestamp to fractional epoch seconds.
#[must_use]
pub fn epoch_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

/// Number of client connections to the cluster.
pub async fn client_connections(target: &mut PgTarget) -> Result<i64> {
    let (count,): (i64,) = target
        .fetch_optional(sqlx::query_as(CLIENT_CONNECTIONS_SQL))
        .await?
        .unwrap_or((0,));
    Ok(count)
}

/// Name and size in bytes of the current database.
pub async fn disk_usage(target: &mut PgTarget) -> Result<Option<(String, i64)>> {
    let row: Option<(String, Option<i64>)> =
        target.fetch_optional(sqlx::query_as(DISK_USAGE_SQL)).await?;
    Ok(row.and_then(|(database, size)| size.map(|size| (database, size))))
}

/// Cumulative transaction counters, or `None` if a counter is NULL.
pub async fn transaction_counters(target: &mut PgTarget) -> Result<Option<TransactionCounters>> {
    let row: Option<(String, DateTime<Utc>, Option<f64>, Option<f64>)> = target
        .fetch_optional(sqlx::query_as(TRANSACTION_COUNTERS_SQL))
        .await?;
    match row {
        Some((database, observed_at, Some(transactions), Some(rollbacks))) => {
            Ok(Some(TransactionCounters {
                database,
                observed_at,
                transactions,
                rollbacks,
            }))
        }
        other => {
            error!(database = target.database(), row = ?other, "transaction counters missing");
            Ok(None)
        }
    }
}

/// Seconds since the latest manual or automatic vacuum, per user table.
pub async fn seconds_since_last_vacuum(target: &mut PgTarget) -> Result<Vec<(String, String, i64)>> {
    type Row = (String, String, DateTime<Utc>, Option<DateTime<Utc>>, Option<DateTime<Utc>>);
    let rows: Vec<Row> = target.fetch_all(sqlx::query_as(LAST_VACUUM_SQL)).await?;
    Ok(rows
        .into_iter()
        .map(|(database, table, now, vacuum, autovacuum)| {
            let seconds = seconds_since_latest(now, vacuum, autovacuum);
            (database, table, seconds)
        })
        .collect())
}

/// Whole seconds between `now` and the later of two optional events.
///
/// `0` when neither event happened.
#[must_use]
pub fn seconds_since_latest(
    now: DateTime<Utc>,
    first: Option<DateTime<Utc>>,
    second: Option<DateTime<Utc>>,
) -> i64 {
    first
        .into_iter()
        .chain(second)
        .max()
        .map_or(0, |latest| (now - latest).num_seconds())
}

/// Cumulative heap block counters, or `None` if a sum is NULL.
pub async fn heap_blocks(target: &mut PgTarget) -> Result<Option<HeapBlocks>> {
    let row: Option<(String, DateTime<Utc>, Option<f64>, Option<f64>)> =
        target.fetch_optional(sqlx::query_as(HEAP_BLOCKS_SQL)).await?;
    match row {
        Some((database, observed_at, Some(read), Some(hit))) => Ok(Some(HeapBlocks {
            database,
            observed_at,
            read,
            hit,
        })),
        other => {
            error!(database = target.database(), row = ?other, "heap block counters missing");
            Ok(None)
        }
    }
}

/// Share of block reads served from the buffer cache.
///
/// `0` when nothing was served from the cache.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn heap_hit_ratio(read: f64, hit: f64) -> f64 {
    let total = hit + read;
    if hit == 0.0 || total == 0.0 {
        0.0
    } else {
        hit / total
    }
}

/// Lock counts grouped by type.
pub async fn lock_statistics(target: &mut PgTarget) -> Result<LockSummary> {
    let rows: Vec<(String, bool, i64)> = target.fetch_all(sqlx::query_as(LOCKS_SQL)).await?;
    Ok(summarize_locks(rows))
}

/// Folds `(locktype, granted, count)` rows into a [`LockSummary`].
#[must_use]
pub fn summarize_locks(rows: impl IntoIterator<Item = (String, bool, i64)>) -> LockSummary {
    let mut summary = LockSummary::default();
    for (locktype, granted, count) in rows {
        let entry = summary.by_type.entry(locktype).or_default();
        if granted {
            entry.granted += count;
            summary.total.granted += count;
        } else {
            entry.waiting += count;
            summary.total.waiting += count;
        }
    }
    summary
}

/// Database name and age in seconds of the oldest open transaction.
pub async fn oldest_transaction(target: &mut PgTarget) -> Result<Option<(String, i64)>> {
    let row: Option<(String, DateTime<Utc>, Option<DateTime<Utc>>)> = target
        .fetch_optional(sqlx::query_as(OLDEST_TRANSACTION_SQL))
        .await?;
    Ok(row.map(|(database, now, xact_start)| {
        (database, seconds_since_latest(now, xact_start, None))
    }))
}

/// Oids and names of ordinary user tables.
pub async fn user_tables(target: &mut PgTarget) -> Result<Vec<(i64, String)>> {
    target.fetch_all(sqlx::query_as(USER_TABLES_SQL)).await
}

/// Database name and dead tuple share (0..1) of one table.
pub async fn table_bloat(target: &mut PgTarget, table_oid: i64) -> Result<Option<(String, f64)>> {
    let row: Option<(String, Option<f64>)> = target
        .fetch_optional(sqlx::query_as(TABLE_BLOAT_SQL).bind(table_oid))
        .await?;
    Ok(row.and_then(|(database, percent)| percent.map(|p| (database, p / 100.0))))
}

/// Index hit ratio per user table; `None` when the scan counters are NULL.
pub async fn index_hit_rates(target: &mut PgTarget) -> Result<Vec<(String, String, Option<f64>)>> {
    let rows: Vec<(String, String, Option<f64>, Option<f64>)> =
        target.fetch_all(sqlx::query_as(INDEX_SCANS_SQL)).await?;
    Ok(rows
        .into_iter()
        .map(|(database, table, idx, seq)| (database, table, index_hit_ratio(idx, seq)))
        .collect())
}

/// Share of scans that used an index.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn index_hit_ratio(index_scans: Option<f64>, seq_scans: Option<f64>) -> Option<f64> {
    let (idx, seq) = (index_scans?, seq_scans?);
    if idx == 0.0 {
        Some(0.0)
    } else {
        Some(idx / (idx + seq))
    }
}

/// Builds the replication delay query for a server.
///
/// A standby measures against its receive location; PostgreSQL 10 renamed
/// the `xlog`/`location` functions to `wal`/`lsn`.
#[must_use]
pub fn replication_delay_sql(in_recovery: bool, server_version: i32) -> String {
    let mut sql = REPLICATION_DELAY_SQL.to_string();
    if in_recovery {
        sql = sql.replace("pg_current_xlog_location", "pg_last_xlog_receive_location");
    }
    if server_version >= PG_VERSION_10 {
        sql = sql.replace("_xlog", "_wal").replace("_location", "_lsn");
    }
    sql
}

/// Replay lag in bytes per replica address.
pub async fn replication_delays(target: &mut PgTarget) -> Result<Vec<(Option<String>, f64)>> {
    let in_recovery = target.is_in_recovery().await?;
    let sql = replication_delay_sql(in_recovery, target.server_version());
    let rows: Vec<(Option<String>, Option<f64>)> =
        target.fetch_all(sqlx::query_as(&sql)).await?;
    Ok(rows
        .into_iter()
        .filter_map(|(addr, bytes)| bytes.map(|b| (addr, b)))
        .collect())
}

/// Upstream host and streaming flag of each WAL receiver.
pub async fn wal_receiver_status(target: &mut PgTarget) -> Result<Vec<(String, i32)>> {
    let rows: Vec<(Option<String>, i32)> =
        target.fetch_all(sqlx::query_as(WAL_RECEIVER_SQL)).await?;
    Ok(rows
        .into_iter()
        .map(|(conninfo, streaming)| (conninfo_host(conninfo.as_deref().unwrap_or("")), streaming))
        .collect())
}

/// Extracts the `host=` value from a libpq conninfo string.
#[must_use]
pub fn conninfo_host(conninfo: &str) -> String {
    CONNINFO_HOST_REGEX
        .captures(conninfo)
        .and_then(|c| c.get(1))
        .map_or_else(|| "UNKNOWN".to_string(), |m| m.as_str().to_string())
}

/// Oldest frozen transaction id age across databases.
pub async fn max_xid_age(target: &mut PgTarget) -> Result<Option<i64>> {
    let row: Option<(Option<i64>,)> = target.fetch_optional(sqlx::query_as(MAX_XID_AGE_SQL)).await?;
    Ok(row.and_then(|(age,)| age))
}

/// Oldest multixact id age across tables; `None` before PostgreSQL 9.5.
pub async fn max_mxid_age(target: &mut PgTarget) -> Result<Option<i64>> {
    if target.server_version() < PG_VERSION_9_5 {
        error!(
            server_version = target.server_version(),
            "mxid_age needs PostgreSQL 9.5 or newer"
        );
        return Ok(None);
    }
    let row: Option<(Option<i64>,)> = target.fetch_optional(sqlx::query_as(MAX_MXID_AGE_SQL)).await?;
    debug!(row = ?row, "max mxid age");
    Ok(row.and_then(|(age,)| age))
}

/// Percentage of the wraparound horizon still available at `age`.
#[must_use]
pub fn wraparound_remaining_percent(age: i64) -> f64 {
    ((WRAPAROUND_HORIZON - age as f64) / WRAPAROUND_HORIZON * 100.0).max(0.0)
}
