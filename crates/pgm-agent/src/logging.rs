//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level. Stderr and file outputs are
//! independent layers; either may be disabled. The file output either rolls
//! over on a time boundary, keeping a bounded number of old files, or appends
//! to one file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{LogConfig, LogRotation};
use crate::error::{AgentError, Result};

/// Installs the global subscriber described by `config`.
///
/// # Errors
///
/// Returns an error if the level is not a valid filter, the log file cannot
/// be opened, or a subscriber is already installed.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| AgentError::Config(format!("invalid log level '{}': {e}", config.level)))?;

    let stderr_layer = config
        .log_to_stderr
        .then(|| fmt::layer().with_writer(std::io::stderr));

    let file_layer = if config.log_to_file {
        let writer = if config.rotate_file_log {
            BoxMakeWriter::new(rolling_appender(config)?)
        } else {
            BoxMakeWriter::new(Arc::new(open_log_file(&config.filename)?))
        };
        Some(fmt::layer().with_ansi(false).with_writer(writer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| AgentError::Config(format!("failed to initialize logging: {e}")))
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Minutely => Self::MINUTELY,
            LogRotation::Hourly => Self::HOURLY,
            LogRotation::Daily => Self::DAILY,
            LogRotation::Never => Self::NEVER,
        }
    }
}

/// Builds the rotating writer for `config.filename`.
///
/// Files are named `<filename>.<date>`; at most `max_log_files` are kept.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the appender
/// cannot open its first file.
pub fn rolling_appender(config: &LogConfig) -> Result<RollingFileAppender> {
    let (dir, prefix) = split_log_path(&config.filename)?;
    std::fs::create_dir_all(&dir)?;

    RollingFileAppender::builder()
        .rotation(config.file_rotation.into())
        .filename_prefix(prefix)
        .max_log_files(config.max_log_files)
        .build(&dir)
        .map_err(|e| {
            AgentError::Config(format!(
                "cannot open rotating log '{}': {e}",
                config.filename.display()
            ))
        })
}

fn split_log_path(path: &Path) -> Result<(PathBuf, String)> {
    let prefix = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| AgentError::Config(format!("log file '{}' has no file name", path.display())))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, prefix))
}

/// Opens `path` for appending, creating missing parent directories.
///
/// # Errors
///
/// Returns an IO error if the directory or file cannot be created.
pub fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn rotating(path: PathBuf, rotation: LogRotation) -> LogConfig {
        LogConfig {
            log_to_file: true,
            filename: path,
            rotate_file_log: true,
            file_rotation: rotation,
            max_log_files: 3,
            ..Default::default()
        }
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("list dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn open_log_file_creates_parent_directories() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("nested/logs/agent.log");

        let mut file = open_log_file(&path).expect("open log file");
        writeln!(file, "first").expect("write");
        drop(file);
        let mut file = open_log_file(&path).expect("reopen log file");
        writeln!(file, "second").expect("write");

        let content = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn rolling_appender_writes_dated_file() {
        let dir = TempDir::new().expect("temp dir");
        let logs = dir.path().join("logs");
        let config = rotating(logs.join("agent.log"), LogRotation::Daily);

        let mut appender = rolling_appender(&config).expect("build appender");
        writeln!(appender, "rotated line").expect("write");
        appender.flush().expect("flush");

        let names = file_names(&logs);
        assert_eq!(names.len(), 1, "{names:?}");
        assert!(names[0].starts_with("agent.log."), "{names:?}");
        let content = std::fs::read_to_string(logs.join(&names[0])).expect("read back");
        assert_eq!(content, "rotated line\n");
    }

    #[test]
    fn never_rotation_keeps_plain_file_name() {
        let dir = TempDir::new().expect("temp dir");
        let config = rotating(dir.path().join("agent.log"), LogRotation::Never);

        let mut appender = rolling_appender(&config).expect("build appender");
        writeln!(appender, "plain").expect("write");
        appender.flush().expect("flush");

        assert_eq!(file_names(dir.path()), vec!["agent.log"]);
    }

    #[test]
    fn log_path_without_file_name_is_rejected() {
        assert!(matches!(split_log_path(Path::new("/")), Err(AgentError::Config(_))));
        let (dir, prefix) = split_log_path(Path::new("agent.log")).expect("bare name");
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(prefix, "agent.log");
    }
}
