//! PostgreSQL connections used as collection targets.
//!
//! A [`PgTarget`] owns one connection to one database. Queries go through the
//! target so that connection-level failures flip its usable flag; the engine's
//! target health check then asks the [`PgConnector`] for a fresh connection
//! before the next pass.

use std::time::Duration;

use pgm_engine::{ConnectFuture, Connector, EngineError, Target};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgRow};
use sqlx::query::QueryAs;
use sqlx::{ConnectOptions, Connection, FromRow, PgConnection, Postgres};
use tracing::{debug, info, warn};

use crate::config::PostgresConfig;
use crate::error::{AgentError, Result};

/// Server version from which WAL functions use the `_wal`/`_lsn` names.
pub const PG_VERSION_10: i32 = 100_000;
/// Server version that added `pg_stat_wal_receiver`.
pub const PG_VERSION_9_6: i32 = 90_600;
/// Server version that added `mxid_age`.
pub const PG_VERSION_9_5: i32 = 90_500;

/// An open connection to one monitored database.
pub struct PgTarget {
    database: String,
    server_version: i32,
    conn: PgConnection,
    usable: bool,
}

impl std::fmt::Debug for PgTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTarget")
            .field("database", &self.database)
            .field("server_version", &self.server_version)
            .field("usable", &self.usable)
            .finish_non_exhaustive()
    }
}

impl PgTarget {
    /// Returns the database name.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns `server_version_num` as read at connect time, e.g. `160002`.
    #[must_use]
    pub const fn server_version(&self) -> i32 {
        self.server_version
    }

    /// Runs `query` and returns all rows.
    ///
    /// # Errors
    ///
    /// Returns the database error; connection-level errors also mark the
    /// target unusable.
    pub async fn fetch_all<'q, O>(&mut self, query: QueryAs<'q, Postgres, O, PgArguments>) -> Result<Vec<O>>
    where
        O: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        let result = query.fetch_all(&mut self.conn).await;
        self.observe(result)
    }

    /// Runs `query` and returns the first row, if any.
    ///
    /// # Errors
    ///
    /// See [`PgTarget::fetch_all`].
    pub async fn fetch_optional<'q, O>(
        &mut self,
        query: QueryAs<'q, Postgres, O, PgArguments>,
    ) -> Result<Option<O>>
    where
        O: Send + Unpin + for<'r> FromRow<'r, PgRow>,
    {
        let result = query.fetch_optional(&mut self.conn).await;
        self.observe(result)
    }

    /// Executes one or more statements without parameters.
    ///
    /// # Errors
    ///
    /// See [`PgTarget::fetch_all`].
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        debug!(database = %self.database, sql, "execute");
        let result = sqlx::raw_sql(sql).execute(&mut self.conn).await.map(|_| ());
        self.observe(result)
    }

    /// Returns `true` if the server is a standby in recovery.
    ///
    /// # Errors
    ///
    /// See [`PgTarget::fetch_all`].
    pub async fn is_in_recovery(&mut self) -> Result<bool> {
        let row: Option<(bool,)> = self
            .fetch_optional(sqlx::query_as("SELECT pg_is_in_recovery()"))
            .await?;
        Ok(row.is_some_and(|(in_recovery,)| in_recovery))
    }

    /// Closes the connection.
    pub async fn close(self) {
        let database = self.database;
        if let Err(e) = self.conn.close().await {
            debug!(database = %database, error = %e, "error while closing connection");
        }
    }

    fn observe<T>(&mut self, result: std::result::Result<T, sqlx::Error>) -> Result<T> {
        result.map_err(|e| {
            if is_connection_error(&e) {
                warn!(database = %self.database, error = %e, "connection lost");
                self.usable = false;
            }
            AgentError::Database(e)
        })
    }
}

impl Target for PgTarget {
    fn scope_name(&self) -> &str {
        &self.database
    }

    fn is_usable(&self) -> bool {
        self.usable
    }
}

/// Returns `true` for errors that leave the connection itself broken.
#[must_use]
pub fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
    )
}

/// Returns the major version as used in data directory paths.
///
/// `90624` becomes `9.6`, `160002` becomes `16`.
#[must_use]
pub fn major_version(server_version: i32) -> String {
    if server_version >= PG_VERSION_10 {
        (server_version / 10_000).to_string()
    } else {
        format!("{}.{}", server_version / 10_000, (server_version / 100) % 100)
    }
}

/// Opens [`PgTarget`]s with fixed server and credential settings.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    timeout: Duration,
}

impl PgConnector {
    /// Creates a connector for the metrics role described by `config`.
    #[must_use]
    pub fn from_config(config: &PostgresConfig) -> Self {
        Self::with_credentials(config, &config.user, &config.password)
    }

    /// Creates a connector for `config`'s server using other credentials.
    #[must_use]
    pub fn with_credentials(config: &PostgresConfig, user: &str, password: &str) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(user)
            .password(password)
            .application_name("postgresql-metrics");
        Self {
            options,
            timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    /// Opens a connection to `database`.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Timeout` if the server does not answer in time, or
    /// the database error if the connection or version query fails.
    pub async fn open(&self, database: &str) -> Result<PgTarget> {
        info!(
            host = self.options.get_host(),
            port = self.options.get_port(),
            user = self.options.get_username(),
            database,
            "opening database connection"
        );
        let options = self.options.clone().database(database);
        let mut conn = tokio::time::timeout(self.timeout, options.connect())
            .await
            .map_err(|_| AgentError::Timeout {
                operation: format!("connect to database '{database}'"),
                secs: self.timeout.as_secs(),
            })??;

        let (server_version,): (i32,) =
            sqlx::query_as("SELECT current_setting('server_version_num')::int4")
                .fetch_one(&mut conn)
                .await?;
        debug!(database, server_version, "connected");

        Ok(PgTarget {
            database: database.to_string(),
            server_version,
            conn,
            usable: true,
        })
    }
}

impl Connector<PgTarget> for PgConnector {
    fn connect<'a>(&'a self, scope_name: &'a str) -> ConnectFuture<'a, PgTarget> {
        Box::pin(async move {
            self.open(scope_name)
                .await
                .map_err(|e| EngineError::connection(scope_name, e.to_string()))
        })
    }
}
