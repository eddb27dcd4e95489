//! # Main: CLI Entry Point
//!
//! Routes subcommands to the pipeline and its maintenance tools.
//!
//! ## Subcommands
//!
//! - `run`: start one worker per configured stream, plus the metrics server
//!   when `--metrics-port` is given.
//! - `migrate`: create the schema in the configured database.
//! - `classify --file`: classify a local log file and print the events.
//! - `check-config`: parse and validate the configuration file.
//!
//! ## Global Options
//!
//! - `--database-url` / `DATABASE_URL`: `postgres://…` or `sqlite:…`.
//! - `--config` / `KILLFEED_CONFIG`: TOML configuration (default `killfeed.toml`).

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "killfeed", about = "Harvest game server logs into typed events")]
struct Cli {
    /// Database URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Path to the TOML configuration file
    #[arg(long, env = "KILLFEED_CONFIG", default_value = "killfeed.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all stream workers until SIGINT/SIGTERM
    Run {
        /// Serve /healthz, /readyz and /metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,
    },
    /// Create missing tables and indexes
    Migrate,
    /// Classify a local log file and print events as JSON
    Classify {
        /// Log file to read
        #[arg(long)]
        file: PathBuf,
    },
    /// Validate the configuration file and exit
    CheckConfig,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize structured logging: LOG_FORMAT=json for K8s, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { metrics_port } => cli::run_pipeline(&cli, *metrics_port),
        Commands::Migrate => cli::run_migrate(&cli),
        Commands::Classify { file } => cli::run_classify(file),
        Commands::CheckConfig => cli::run_check_config(&cli),
    }
}
