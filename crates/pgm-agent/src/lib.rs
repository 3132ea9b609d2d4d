//! PostgreSQL metrics agent.
//!
//! Collects statistics from one PostgreSQL cluster and ships them to FFWD:
//! - [`producers`] wraps each statistics query as a scheduled producer
//! - [`agent`] drives passes over every configured database
//! - [`ffwd`] sends records as UDP datagrams of JSON
//! - [`prepare`] installs the views and functions the metrics role reads

#![forbid(unsafe_code)]

pub mod agent;
pub mod config;
pub mod error;
pub mod ffwd;
pub mod logging;
pub mod metrics;
pub mod postgres;
pub mod prepare;
pub mod producers;
pub mod queries;
pub mod shutdown;
pub mod wal;

pub use agent::{Agent, build_orchestrator, check_producer_names};
pub use config::{Config, DEFAULT_CONFIG_PATH};
pub use error::{AgentError, Result};
pub use ffwd::FfwdSink;
pub use postgres::{PgConnector, PgTarget};
pub use prepare::{SuperuserCredentials, prepare_databases};
pub use shutdown::Shutdown;
