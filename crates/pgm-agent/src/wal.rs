//! Statistics read from the local PostgreSQL data directory.

use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::postgres::major_version;

/// WAL segment files are named by 24 uppercase hex digits.
static WAL_FILE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-F]{24}$").unwrap_or_else(|_| unreachable!()));

/// WAL directory names, newest first.
const WAL_DIR_NAMES: [&str; 2] = ["pg_wal", "pg_xlog"];

/// Picks the data directory to read.
///
/// Uses `configured` when set, otherwise the Debian default path for the
/// server's major version. Returns `None` if the result is not a directory.
#[must_use]
pub fn resolve_data_dir(configured: Option<&Path>, server_version: i32) -> Option<PathBuf> {
    let candidate = configured.map_or_else(
        || PathBuf::from(format!("/var/lib/postgresql/{}/main", major_version(server_version))),
        Path::to_path_buf,
    );

    if candidate.is_dir() {
        debug!(data_dir = %candidate.display(), "using postgres data directory");
        Some(candidate)
    } else {
        debug!(data_dir = %candidate.display(), "data directory doesn't exist");
        None
    }
}

/// Counts WAL segment files under `data_dir`.
///
/// Looks in `pg_wal` and falls back to `pg_xlog` for servers before 10.
///
/// # Errors
///
/// Returns an IO error if neither directory can be listed.
pub fn count_wal_files(data_dir: &Path) -> io::Result<usize> {
    let wal_dir = WAL_DIR_NAMES
        .iter()
        .map(|name| data_dir.join(name))
        .find(|dir| dir.is_dir())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no WAL directory under '{}'", data_dir.display()),
            )
        })?;

    let mut count = 0;
    for entry in std::fs::read_dir(&wal_dir)? {
        let entry = entry?;
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| WAL_FILE_REGEX.is_match(name))
        {
            count += 1;
        }
    }
    Ok(count)
}
