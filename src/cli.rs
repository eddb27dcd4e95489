//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Each subcommand
//! builds its own tokio runtime when it needs one.

use anyhow::{Context, Result};
use killfeed::classifier::classify_lines;
use killfeed::config::Config;
use killfeed::fetcher::FtpConnector;
use killfeed::notify::{LogNotifier, Notifier, WebhookNotifier};
use killfeed::prom_metrics::Metrics;
use killfeed::server::{self, AppState};
use killfeed::{store, Pipeline};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::Cli;

fn database_url(cli: &Cli) -> Result<&str> {
    cli.database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)"))
}

fn load_config(cli: &Cli) -> Result<Config> {
    Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))
}

// ── run ─────────────────────────────────────────────────────────

pub fn run_pipeline(cli: &Cli, metrics_port: Option<u16>) -> Result<()> {
    let config = Arc::new(load_config(cli)?);
    if config.streams.is_empty() {
        anyhow::bail!("no [[streams]] configured in {}", cli.config.display());
    }
    let database_url = database_url(cli)?;

    info!(
        streams = config.streams.len(),
        interval_secs = config.pipeline.interval_secs,
        "killfeed starting"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = store::connect(database_url).await?;
        store.ensure_schema().await?;
        let metrics = Arc::new(Metrics::new());

        let notifier: Arc<dyn Notifier> = match config.notifications.resolved_webhook_url() {
            Some(url) => Arc::new(WebhookNotifier::new(
                &url,
                &config.notifications.username,
                Duration::from_secs(config.notifications.timeout_secs),
            )?),
            None => {
                warn!("no webhook configured, notifications go to the log only");
                Arc::new(LogNotifier)
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(server::forward_shutdown(stop_tx));

        let pipeline = Pipeline::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::new(FtpConnector),
            notifier,
            Arc::clone(&metrics),
        );

        let server = metrics_port.map(|port| {
            let state = Arc::new(AppState {
                store,
                metrics,
                liveness: pipeline.liveness(),
            });
            tokio::spawn(server::serve(port, state, stop_rx.clone()))
        });

        pipeline.run(stop_rx).await;

        if let Some(handle) = server {
            handle.await??;
        }
        info!("killfeed shut down gracefully");
        Ok(())
    })
}

// ── migrate ─────────────────────────────────────────────────────

pub fn run_migrate(cli: &Cli) -> Result<()> {
    let database_url = database_url(cli)?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = store::connect(database_url).await?;
        store.ensure_schema().await?;
        info!("schema up to date");
        Ok(())
    })
}

// ── classify ────────────────────────────────────────────────────

pub fn run_classify(file: &Path) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let (events, stats) = classify_lines(&lines, 0);

    let events: Vec<_> = events
        .iter()
        .map(|(offset, event)| json!({ "offset": offset, "event": event }))
        .collect();
    let output = json!({
        "lines": lines.len(),
        "events": events,
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// ── check-config ────────────────────────────────────────────────

pub fn run_check_config(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    for stream in &config.streams {
        if let Err(e) = stream.password() {
            warn!(stream = %stream.name, error = %e, "stream credentials not available");
        }
    }
    println!(
        "{}: OK ({} streams, {} achievements)",
        cli.config.display(),
        config.streams.len(),
        config.achievements.len()
    );
    Ok(())
}
