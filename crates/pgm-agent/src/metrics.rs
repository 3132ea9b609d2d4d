//! Metric record constructors.
//!
//! Every record lives under the `postgresql` key and carries a `what` and a
//! `unit` attribute, plus whatever dimensions identify the series.

use pgm_engine::MetricRecord;

/// Namespace key of every record.
pub const METRIC_KEY: &str = "postgresql";

fn metric(what: &str, unit: &str, value: f64) -> MetricRecord {
    MetricRecord::new(METRIC_KEY, value)
        .attr("what", what)
        .attr("unit", unit)
}

/// Number of client connections.
pub fn client_connections(value: f64) -> MetricRecord {
    metric("client-connections", "connection", value)
}

/// Database size in bytes.
pub fn database_size(database: &str, value: f64) -> MetricRecord {
    metric("database-size", "B", value).attr("database", database)
}

/// Transactions per second.
pub fn transaction_rate(database: &str, value: f64) -> MetricRecord {
    metric("transaction-rate", "transaction", value)
        .attr("type", "transactions")
        .attr("database", database)
}

/// Rollbacks per second.
pub fn rollbacks_rate(database: &str, value: f64) -> MetricRecord {
    metric("transaction-rollbacks", "transaction", value)
        .attr("type", "transactions")
        .attr("database", database)
}

/// Seconds since the table was last vacuumed.
pub fn seconds_since_last_vacuum(database: &str, table: &str, value: f64) -> MetricRecord {
    metric("last-vacuum", "s", value)
        .attr("database", database)
        .attr("table", table)
}

/// Heap blocks read from disk per second.
pub fn blocks_read_from_disk(database: &str, value: f64) -> MetricRecord {
    metric("blocks-read-from-disk", "blocks", value)
        .attr("type", "heap-reads")
        .attr("database", database)
}

/// Heap blocks found in the buffer cache per second.
pub fn blocks_read_from_buffer(database: &str, value: f64) -> MetricRecord {
    metric("blocks-read-from-buffer", "blocks", value)
        .attr("type", "heap-reads")
        .attr("database", database)
}

/// Share of heap block reads served from the buffer cache.
pub fn blocks_heap_hit_ratio(database: &str, value: f64) -> MetricRecord {
    metric("blocks-heap-hit-ratio", "buffer_hit%", value).attr("database", database)
}

/// Granted locks of one lock type, or `total`.
pub fn locks_granted(locktype: &str, value: f64) -> MetricRecord {
    metric("locks_granted", "lock", value)
        .attr("type", "locks")
        .attr("locktype", locktype)
}

/// Waiting locks of one lock type, or `total`.
pub fn locks_waiting(locktype: &str, value: f64) -> MetricRecord {
    metric("locks_waiting", "lock", value)
        .attr("type", "locks")
        .attr("locktype", locktype)
}

/// Age of the oldest open transaction in seconds.
pub fn sec_since_oldest_xact_start(database: &str, value: f64) -> MetricRecord {
    metric("sec-since-oldest-xact-start", "s", value).attr("database", database)
}

/// Percentage of transaction ids left before wraparound.
pub fn xid_remaining(value: f64) -> MetricRecord {
    metric("xid-remaining", "%", value)
}

/// Percentage of multixact ids left before wraparound.
pub fn mxid_remaining(value: f64) -> MetricRecord {
    metric("mxid-remaining", "%", value)
}

/// Number of WAL segment files in the data directory.
pub fn wal_file_amount(value: f64) -> MetricRecord {
    metric("wal-file-amount", "file", value)
}

/// Dead tuple share of a table.
pub fn table_bloat(database: &str, table: &str, value: f64) -> MetricRecord {
    metric("table-bloat", "bloat%", value)
        .attr("database", database)
        .attr("table", table)
}

/// Share of scans on a table that used an index.
pub fn index_hit_ratio(database: &str, table: &str, value: f64) -> MetricRecord {
    metric("index-hit", "index_hit%", value)
        .attr("database", database)
        .attr("table", table)
}

/// Replay lag of one replica in bytes. Replicas connected over a local
/// socket have no address and no `slave` attribute.
pub fn replication_delay_bytes(client_addr: Option<&str>, value: f64) -> MetricRecord {
    let record = metric("replication-delay-bytes", "B", value);
    match client_addr {
        Some(addr) => record.attr("slave", addr),
        None => record,
    }
}

/// `1` while the WAL receiver streams from `master`, else `0`.
pub fn incoming_replication_running(master: &str, value: f64) -> MetricRecord {
    metric("incoming-replication-running", "msg", value).attr("master", master)
}
