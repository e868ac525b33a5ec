//! BuildIt CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "buildit")]
#[command(about = "BuildIt build scheduling CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a master configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "master.kdl")]
        path: String,
    },
    /// Schedule build requests against a configuration without running builds
    Simulate {
        /// Path to the master configuration
        config: String,
        /// Path to the build request fixtures
        requests: String,
        /// Seed for random worker choice
        #[arg(long, env = "BUILDIT_SEED")]
        seed: Option<u64>,
        /// Name of this master in the output
        #[arg(long, env = "BUILDIT_MASTER", default_value = "master")]
        master: String,
        /// Scheduling rounds; builds started in one round finish before the next
        #[arg(long, default_value = "1")]
        rounds: u32,
        /// Print the scan reports as JSON
        #[arg(long)]
        json: bool,
        /// Use a PostgreSQL build request store instead of an in-memory one
        #[arg(long, env = "BUILDIT_DATABASE_URL")]
        database_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Simulate {
            config,
            requests,
            seed,
            master,
            rounds,
            json,
            database_url,
        } => {
            let options = commands::simulate::SimulateOptions {
                seed,
                master,
                rounds,
                json,
                database_url,
            };
            commands::simulate::run(&config, &requests, options).await?;
        }
    }

    Ok(())
}
