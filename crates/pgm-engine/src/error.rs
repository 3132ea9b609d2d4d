//! Error types for the pgm-engine crate.

use thiserror::Error;

/// Errors that can occur while scheduling and running statistic producers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A configured producer name has no registered implementation.
    #[error("unknown statistic producer '{name}' (known: {known})")]
    UnknownProducer {
        /// The name found in configuration.
        name: String,
        /// Comma-separated list of registered names.
        known: String,
    },

    /// Two producers were registered under the same name.
    #[error("statistic producer '{name}' registered twice")]
    DuplicateProducer {
        /// The duplicated name.
        name: String,
    },

    /// A scope identifier is empty or collides with the global sentinel.
    #[error("invalid scope: {reason}")]
    InvalidScope {
        /// The reason the scope is invalid.
        reason: String,
    },

    /// A single statistic could not be obtained.
    #[error("collection error: {reason}")]
    Collection {
        /// The reason the collection failed.
        reason: String,
    },

    /// A target could not be (re)connected.
    #[error("connection to '{scope}' failed: {reason}")]
    Connection {
        /// The scope whose handle could not be obtained.
        scope: String,
        /// The reason the connection failed.
        reason: String,
    },
}

impl EngineError {
    /// Shorthand for a [`EngineError::Collection`] error.
    pub fn collection(reason: impl Into<String>) -> Self {
        Self::Collection {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`EngineError::Connection`] error.
    pub fn connection(scope: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connection {
            scope: scope.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_unknown_producer() {
        let err = EngineError::UnknownProducer {
            name: "tx_rte".to_string(),
            known: "disk_usage, tx_rate".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unknown statistic producer 'tx_rte' (known: disk_usage, tx_rate)"
        );
    }

    #[test]
    fn error_display_duplicate_producer() {
        let err = EngineError::DuplicateProducer {
            name: "tx_rate".to_string(),
        };
        assert_eq!(err.to_string(), "statistic producer 'tx_rate' registered twice");
    }

    #[test]
    fn error_display_invalid_scope() {
        let err = EngineError::InvalidScope {
            reason: "empty name".to_string(),
        };
        assert_eq!(err.to_string(), "invalid scope: empty name");
    }

    #[test]
    fn error_display_collection() {
        let err = EngineError::collection("relation does not exist");
        assert_eq!(err.to_string(), "collection error: relation does not exist");
    }

    #[test]
    fn error_display_connection() {
        let err = EngineError::connection("db1", "connection refused");
        assert_eq!(err.to_string(), "connection to 'db1' failed: connection refused");
    }
}
