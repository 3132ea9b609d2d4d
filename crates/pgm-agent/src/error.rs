//! Error types for the metrics agent.

use pgm_engine::EngineError;
use thiserror::Error;

/// Errors that can occur in agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database query or connection error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Engine error.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Sending metrics failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// An operation did not finish in time.
    #[error("timed out after {secs}s: {operation}")]
    Timeout {
        /// What was being attempted.
        operation: String,
        /// The limit that was exceeded.
        secs: u64,
    },
}

impl From<AgentError> for EngineError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Engine(inner) => inner,
            other => Self::collection(other.to_string()),
        }
    }
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
