//! Agent configuration.
//!
//! Configuration for the PostgreSQL metrics agent, including:
//! - Connection settings and the list of monitored databases
//! - FFWD transport address
//! - Logging outputs
//! - Producer lists with their run intervals
//!
//! [`Config::load`] also reads `default/<file name>` next to the given file
//! when present. The given file wins; producer lists are merged by name so a
//! deployment can override one interval without repeating the whole list.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use pgm_engine::{ProducerSpec, Scope};
use serde::{Deserialize, Serialize};
use toml::Value;
use tracing::debug;

use crate::error::{AgentError, Result};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/postgresql-metrics/postgresql-metrics.toml";

/// Name of the directory holding default values, next to the config file.
pub const DEFAULT_DIR_NAME: &str = "default";

/// PostgreSQL connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PostgresConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Role used for statistics queries.
    pub user: String,
    /// Password of `user`.
    pub password: String,
    /// Databases to monitor, in order.
    pub databases: Vec<String>,
    /// Single database, for configurations written before `databases` existed.
    pub database: Option<String>,
    /// Postgres data directory; derived from the server version when unset.
    pub data_dir: Option<PathBuf>,
    /// Upper bound for opening one connection.
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            user: "postgresql_metrics_user".to_string(),
            password: String::new(),
            databases: Vec::new(),
            database: None,
            data_dir: None,
            connect_timeout_secs: 10,
        }
    }
}

impl PostgresConfig {
    /// Returns the databases to monitor, honoring the legacy `database` key.
    #[must_use]
    pub fn target_databases(&self) -> Vec<String> {
        if self.databases.is_empty() {
            self.database.iter().cloned().collect()
        } else {
            self.databases.clone()
        }
    }
}

/// FFWD transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FfwdConfig {
    /// FFWD host.
    pub host: String,
    /// FFWD UDP port.
    pub port: u16,
}

impl Default for FfwdConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 19000,
        }
    }
}

impl FfwdConfig {
    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, e.g. `info` or `pgm_agent=debug`.
    pub level: String,
    /// Write log lines to stderr.
    pub log_to_stderr: bool,
    /// Append log lines to `filename`.
    pub log_to_file: bool,
    /// Log file path; rotated files get a date suffix.
    pub filename: PathBuf,
    /// Roll the log file over on `file_rotation` boundaries.
    pub rotate_file_log: bool,
    /// How often a new log file is started.
    pub file_rotation: LogRotation,
    /// Rotated files kept; older ones are deleted.
    pub max_log_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_stderr: true,
            log_to_file: false,
            filename: PathBuf::from("/var/log/postgresql-metrics/postgresql-metrics.log"),
            rotate_file_log: true,
            file_rotation: LogRotation::Daily,
            max_log_files: 5,
        }
    }
}

/// Log file rotation period.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// One file per minute.
    Minutely,
    /// One file per hour.
    Hourly,
    /// One file per day.
    #[default]
    Daily,
    /// A single file with no date suffix.
    Never,
}

impl LogConfig {
    /// Returns a copy that logs to stderr only, for interactive commands.
    #[must_use]
    pub fn stderr_only(&self) -> Self {
        Self {
            log_to_stderr: true,
            log_to_file: false,
            ..self.clone()
        }
    }
}

/// Driving loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSettings {
    /// Seconds slept between two scheduled passes.
    pub tick_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self { tick_secs: 5 }
    }
}

/// Main agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// PostgreSQL settings.
    pub postgres: PostgresConfig,
    /// FFWD settings.
    #[serde(default)]
    pub ffwd: FfwdConfig,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
    /// Driving loop settings.
    #[serde(default)]
    pub agent: AgentSettings,
    /// Producers run once per monitored database.
    #[serde(default)]
    pub db_functions: Vec<ProducerSpec>,
    /// Producers run once per pass for the whole cluster.
    #[serde(default)]
    pub global_db_functions: Vec<ProducerSpec>,
    /// Producers reading the local data directory.
    #[serde(default)]
    pub data_dir_functions: Vec<ProducerSpec>,
}

impl Config {
    /// Load configuration from `path`, merged over `default/<file name>` if present.
    ///
    /// # Errors
    ///
    /// Returns an error if no file can be read or the merged result is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut merged: Option<Value> = None;

        if let Some(default_path) = default_path_for(path) {
            if default_path.is_file() {
                debug!(path = %default_path.display(), "reading default configuration");
                merged = Some(read_value(&default_path)?);
            }
        }

        if path.is_file() {
            let main = read_value(path)?;
            merged = Some(match merged {
                Some(defaults) => merge_values(main, defaults),
                None => main,
            });
        }

        let value = merged.ok_or_else(|| {
            AgentError::Config(format!("no configuration found at '{}'", path.display()))
        })?;
        let config: Self = value
            .try_into()
            .map_err(|e| AgentError::Config(format!("invalid configuration: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a single TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AgentError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AgentError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let databases = self.postgres.target_databases();
        if databases.is_empty() {
            return Err(AgentError::Config(
                "no target databases defined in configuration".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for name in &databases {
            Scope::validate_target_name(name)
                .map_err(|e| AgentError::Config(format!("postgres.databases: {e}")))?;
            if !seen.insert(name.as_str()) {
                return Err(AgentError::Config(format!(
                    "postgres.databases: '{name}' listed more than once"
                )));
            }
        }

        if self.postgres.connect_timeout_secs == 0 {
            return Err(AgentError::Config(
                "postgres.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.agent.tick_secs == 0 {
            return Err(AgentError::Config(
                "agent.tick_secs must be greater than 0".to_string(),
            ));
        }

        if self.log.log_to_file && self.log.rotate_file_log && self.log.max_log_files == 0 {
            return Err(AgentError::Config(
                "log.max_log_files must be greater than 0".to_string(),
            ));
        }

        for (section, specs) in [
            ("db_functions", &self.db_functions),
            ("global_db_functions", &self.global_db_functions),
            ("data_dir_functions", &self.data_dir_functions),
        ] {
            if specs.iter().any(|spec| spec.name.trim().is_empty()) {
                return Err(AgentError::Config(format!(
                    "{section}: producer name cannot be empty"
                )));
            }
        }

        Ok(())
    }
}

fn default_path_for(path: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?;
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    Some(dir.join(DEFAULT_DIR_NAME).join(file_name))
}

fn read_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AgentError::Config(format!(
            "failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;
    content
        .parse::<Value>()
        .map_err(|e| AgentError::Config(format!("invalid TOML in '{}': {e}", path.display())))
}

/// Merges `defaults` into `main`; `main` wins.
///
/// Tables merge key by key. Arrays of tables carrying a `name` key are merged
/// by that name: entries of `main` first, then default entries whose name is
/// not already present. Any other value in `main` replaces the default.
pub fn merge_values(main: Value, defaults: Value) -> Value {
    match (main, defaults) {
        (Value::Table(mut main), Value::Table(defaults)) => {
            for (key, default_value) in defaults {
                let merged = match main.remove(&key) {
                    Some(value) => merge_values(value, default_value),
                    None => default_value,
                };
                main.insert(key, merged);
            }
            Value::Table(main)
        }
        (Value::Array(mut main), Value::Array(defaults)) if is_named_list(&main) && is_named_list(&defaults) => {
            let present: HashSet<String> = main.iter().filter_map(entry_name).collect();
            main.extend(
                defaults
                    .into_iter()
                    .filter(|entry| entry_name(entry).is_none_or(|name| !present.contains(&name))),
            );
            Value::Array(main)
        }
        (main, _) => main,
    }
}

fn is_named_list(values: &[Value]) -> bool {
    values.iter().all(|v| entry_name(v).is_some())
}

fn entry_name(value: &Value) -> Option<String> {
    value.get("name")?.as_str().map(str::to_string)
}
