//! postgresql-metrics - PostgreSQL statistics agent
//!
//! Polls a PostgreSQL cluster for statistics and ships them to FFWD, or
//! prints one collection to stdout.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pgm_agent::{
    Agent, Config, DEFAULT_CONFIG_PATH, FfwdSink, Shutdown, SuperuserCredentials, logging,
    prepare_databases,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "postgresql-metrics")]
#[command(about = "PostgreSQL statistics agent")]
#[command(version)]
struct Cli {
    /// Path to config file; `default/<file name>` next to it is read first
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect every metric once and print it as JSON lines
    All,

    /// Poll on schedule and send metrics to FFWD until interrupted
    LongRunningFfwd,

    /// Create the metrics role, views and functions in every database
    PrepareDb {
        /// Role with rights to create roles and extensions
        #[arg(long, default_value = "postgres")]
        superuser: String,

        /// Password of the superuser role
        #[arg(long, env = "PGM_SUPERUSER_PASSWORD", hide_env_values = true, default_value = "")]
        superuser_password: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::All => {
            logging::init(&config.log.stderr_only())?;
            print_all(&config).await?;
        }

        Commands::LongRunningFfwd => {
            logging::init(&config.log)?;
            run_long_running(&config).await?;
        }

        Commands::PrepareDb {
            superuser,
            superuser_password,
        } => {
            logging::init(&config.log.stderr_only())?;
            let credentials = SuperuserCredentials {
                user: superuser,
                password: superuser_password,
            };
            prepare_databases(&config, &credentials).await?;
        }
    }

    Ok(())
}

async fn print_all(config: &Config) -> anyhow::Result<()> {
    let mut agent = Agent::connect(config).await?;
    let records = agent.collect_all().await;

    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }

    agent.shutdown().await;
    Ok(())
}

async fn run_long_running(config: &Config) -> anyhow::Result<()> {
    info!(config = ?config.postgres.target_databases(), "starting postgresql-metrics");

    let shutdown = Shutdown::from_signals()?;
    let sink = FfwdSink::from_config(&config.ffwd);
    let agent = Agent::connect(config).await?;
    agent.run_long_running(&sink, shutdown).await;
    Ok(())
}
