//! `prepare-db`: one-time setup of the monitored databases.
//!
//! Run with superuser credentials. For every configured database this makes
//! sure the metrics role exists and can connect, and installs the
//! security-definer views and functions the unprivileged role queries
//! through. Every step checks first, so running it again is harmless.

use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::postgres::{PG_VERSION_9_6, PgConnector, PgTarget};

/// View exposing `pg_stat_replication` to the metrics role.
pub const REPLICATION_STATS_VIEW: &str = "pg_stat_repl";
/// View exposing `pg_stat_wal_receiver` to the metrics role.
pub const INCOMING_REPLICATION_VIEW: &str = "stat_incoming_replication";
/// Wrapper around `pgstattuple` callable by the metrics role.
pub const PGSTATTUPLE_FUNCTION: &str = "pgstattuple_for_table_oid";

const REPLICATION_STATS_SQL: &str = r"
CREATE OR REPLACE FUNCTION public.pg_stat_repl()
RETURNS SETOF pg_catalog.pg_stat_replication AS $$
BEGIN
RETURN QUERY(SELECT * FROM pg_catalog.pg_stat_replication);
END$$ LANGUAGE plpgsql SECURITY DEFINER;
CREATE OR REPLACE VIEW public.pg_stat_repl AS SELECT * FROM public.pg_stat_repl();
";

const PGSTATTUPLE_SQL: &str = r"
CREATE EXTENSION IF NOT EXISTS pgstattuple;
CREATE OR REPLACE FUNCTION public.pgstattuple_for_table_oid(BIGINT)
RETURNS TABLE (current_database NAME, table_len BIGINT, tuple_count BIGINT,
               tuple_len BIGINT, tuple_percent FLOAT, dead_tuple_count BIGINT,
               dead_tuple_len BIGINT, dead_tuple_percent FLOAT, free_space BIGINT,
               free_percent FLOAT) AS $$
BEGIN
  RETURN QUERY(SELECT current_database(), * FROM pgstattuple($1::regclass));
END$$ LANGUAGE plpgsql SECURITY DEFINER;
";

const INCOMING_REPLICATION_SQL: &str = r"
CREATE OR REPLACE FUNCTION public.stat_incoming_replication()
RETURNS SETOF pg_catalog.pg_stat_wal_receiver AS $$
BEGIN
RETURN QUERY(SELECT * FROM pg_catalog.pg_stat_wal_receiver);
END$$ LANGUAGE plpgsql SECURITY DEFINER;
CREATE OR REPLACE VIEW public.stat_incoming_replication AS SELECT * FROM public.stat_incoming_replication();
";

/// Credentials of a role allowed to create roles, extensions and functions.
#[derive(Clone)]
pub struct SuperuserCredentials {
    /// Role name.
    pub user: String,
    /// Password of `user`.
    pub password: String,
}

impl std::fmt::Debug for SuperuserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperuserCredentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Prepares every configured database for the metrics role.
///
/// Stops at the first standby, since the primary's setup replicates to it.
///
/// # Errors
///
/// Returns the first connection or statement failure.
pub async fn prepare_databases(config: &Config, credentials: &SuperuserCredentials) -> Result<()> {
    let metrics_user = &config.postgres.user;
    info!(user = %metrics_user, "preparing databases for metrics user");

    let connector = PgConnector::with_credentials(&config.postgres, &credentials.user, &credentials.password);
    for database in config.postgres.target_databases() {
        info!(database = %database, superuser = %credentials.user, "connecting as superuser");
        let mut target = connector.open(&database).await?;

        if target.is_in_recovery().await? {
            info!(database = %database, "database is a standby, run prepare-db on the primary");
            target.close().await;
            break;
        }

        let result = prepare_database(&mut target, metrics_user, &config.postgres.password).await;
        target.close().await;
        result?;
        info!(database = %database, user = %metrics_user, "database prepared for metrics user");
    }
    Ok(())
}

async fn prepare_database(target: &mut PgTarget, user: &str, password: &str) -> Result<()> {
    let database = target.database().to_string();

    if check(target, "SELECT EXISTS(SELECT 1 FROM pg_roles WHERE rolname = $1)", &[user]).await? {
        info!(user, "role already exists");
    } else {
        info!(user, "creating role with login privilege");
        target
            .execute(&format!(
                "CREATE ROLE {} WITH PASSWORD {} LOGIN",
                quote_ident(user),
                quote_literal(password)
            ))
            .await?;
    }

    if check(
        target,
        "SELECT has_database_privilege($1, $2, 'connect')",
        &[user, &database],
    )
    .await?
    {
        info!(user, database = %database, "role already has connect privilege");
    } else {
        info!(user, database = %database, "granting connect privilege");
        target
            .execute(&format!(
                "GRANT CONNECT ON DATABASE {} TO {}",
                quote_ident(&database),
                quote_ident(user)
            ))
            .await?;
    }

    ensure_view(target, REPLICATION_STATS_VIEW, REPLICATION_STATS_SQL).await?;
    ensure_select(target, user, REPLICATION_STATS_VIEW).await?;

    if check(target, "SELECT EXISTS(SELECT 1 FROM pg_proc WHERE proname = $1)", &[PGSTATTUPLE_FUNCTION]).await? {
        info!("pgstattuple access function already exists");
    } else {
        info!(function = PGSTATTUPLE_FUNCTION, "creating extension pgstattuple with access function");
        target.execute(PGSTATTUPLE_SQL).await?;
    }

    let signature = format!("public.{PGSTATTUPLE_FUNCTION}(bigint)");
    if check(target, "SELECT has_function_privilege($1, $2, 'execute')", &[user, &signature]).await? {
        info!(user, function = %signature, "role already has execute privilege");
    } else {
        info!(user, function = %signature, "granting execute privilege");
        target
            .execute(&format!("GRANT EXECUTE ON FUNCTION {signature} TO {}", quote_ident(user)))
            .await?;
    }

    if target.server_version() >= PG_VERSION_9_6 {
        ensure_view(target, INCOMING_REPLICATION_VIEW, INCOMING_REPLICATION_SQL).await?;
        ensure_select(target, user, INCOMING_REPLICATION_VIEW).await?;
    } else {
        info!(
            server_version = target.server_version(),
            "skipping incoming replication view, requires PostgreSQL 9.6 or newer"
        );
    }

    Ok(())
}

async fn ensure_view(target: &mut PgTarget, view: &str, create_sql: &str) -> Result<()> {
    let exists = check(
        target,
        "SELECT EXISTS(SELECT 1 FROM information_schema.tables \
         WHERE table_schema = 'public' AND table_name = $1)",
        &[view],
    )
    .await?;
    if exists {
        info!(view, "view already exists");
        Ok(())
    } else {
        info!(view, "creating view");
        target.execute(create_sql).await
    }
}

async fn ensure_select(target: &mut PgTarget, user: &str, view: &str) -> Result<()> {
    let relation = format!("public.{view}");
    if check(target, "SELECT has_table_privilege($1, $2, 'select')", &[user, &relation]).await? {
        info!(user, relation = %relation, "role already has select privilege");
        Ok(())
    } else {
        info!(user, relation = %relation, "granting select privilege");
        target
            .execute(&format!("GRANT SELECT ON {relation} TO {}", quote_ident(user)))
            .await
    }
}

async fn check(target: &mut PgTarget, sql: &str, params: &[&str]) -> Result<bool> {
    let mut query = sqlx::query_as::<_, (Option<bool>,)>(sql);
    for param in params {
        query = query.bind(*param);
    }
    let row = target.fetch_optional(query).await?;
    Ok(matches!(row, Some((Some(true),))))
}

/// Quotes an SQL identifier.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes an SQL string literal.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
