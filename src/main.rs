// src/main.rs
// log-notifier - tail application logs, dedupe errors, stream them live

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Level, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use log_notifier::capture::ExceptionCapture;
use log_notifier::clock::SystemClock;
use log_notifier::notify::TracingSender;
use log_notifier::parser::{EntryParser, ParsedEntry};
use log_notifier::server::{self, AppState};
use log_notifier::{LogWatcher, NotifierConfig, db};

const CAPTURE_QUEUE: usize = 256;

#[derive(Parser)]
#[command(name = "log-notifier")]
#[command(about = "Tail application logs, deduplicate errors and stream them to live clients")]
#[command(version)]
struct Cli {
    /// Config file (default: ./log-notifier.toml when present)
    #[arg(short, long, global = true, env = "LOG_NOTIFIER_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and live stream with the background watcher
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Tail the configured log files
    Watch {
        /// Single pass, then exit
        #[arg(long)]
        once: bool,

        /// Seconds between passes (default: check_interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Delete stored errors (default: those past the retention period)
    Clear {
        /// Delete every error
        #[arg(long, conflicts_with = "resolved")]
        all: bool,

        /// Delete resolved errors only
        #[arg(long)]
        resolved: bool,
    },

    /// Forget tracked file offsets so the next pass re-reads everything
    ResetPositions,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn open_watcher(config: &NotifierConfig) -> Result<Arc<LogWatcher>> {
    let pool = db::connect(&config.database_url).await?;
    db::migrate(&pool).await?;
    let watcher = LogWatcher::from_config(config, pool, Arc::new(SystemClock), Arc::new(TracingSender))?;
    Ok(Arc::new(watcher))
}

async fn run_serve(
    config: NotifierConfig,
    capture: ExceptionCapture,
    rx: mpsc::Receiver<ParsedEntry>,
) -> Result<()> {
    let watcher = open_watcher(&config).await?;
    capture.install_panic_hook();

    let capture_worker = watcher.clone().spawn_capture_worker(rx);
    let scheduler = watcher.clone().spawn_scheduler(config.check_interval());

    let state = AppState::new(watcher, &config.stream);
    let result = server::serve(&config.bind_address(), state, shutdown_signal()).await;

    scheduler.abort();
    capture_worker.abort();
    result?;
    Ok(())
}

async fn run_watch(config: NotifierConfig, once: bool, interval: Option<u64>) -> Result<()> {
    let watcher = open_watcher(&config).await?;
    if !watcher.is_enabled() {
        warn!("Log notifier is disabled, nothing to watch");
        return Ok(());
    }

    if once {
        let created = watcher.watch().await;
        println!("Stored {} new error(s)", created.len());
        for record in created {
            println!("  #{} [{}] {} ({})", record.id, record.level, record.excerpt(), record.location());
        }
        return Ok(());
    }

    let every = interval
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| config.check_interval());
    let scheduler = watcher.spawn_scheduler(every);
    shutdown_signal().await;
    scheduler.abort();
    Ok(())
}

async fn run_clear(config: NotifierConfig, all: bool, resolved: bool) -> Result<()> {
    let watcher = open_watcher(&config).await?;
    let store = watcher.store();

    if all {
        let deleted = store.purge_all().await?;
        println!("Cleared all {deleted} error(s)");
    } else if resolved {
        let deleted = store.purge_resolved().await?;
        println!("Cleared {deleted} resolved error(s)");
    } else {
        if config.retention_days <= 0 {
            bail!("retention is disabled (retention_days = 0); use --all to clear everything");
        }
        let deleted = watcher.sweep_retention().await?;
        println!("Cleared {deleted} error(s) older than {} days", config.retention_days);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = NotifierConfig::load(cli.config.as_deref())?;
    if let Commands::Serve { host, port } = &cli.command {
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
    }

    let level = if cli.debug || config.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let parser = Arc::new(EntryParser::from_config(&config.masking)?);
    let (capture, rx) = ExceptionCapture::channel(parser, &config.levels, config.enabled, CAPTURE_QUEUE);
    let capture_layer = matches!(cli.command, Commands::Serve { .. }).then(|| capture.layer());

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::from_level(level)))
        .with(capture_layer)
        .init();

    match cli.command {
        Commands::Serve { .. } => run_serve(config, capture, rx).await,
        Commands::Watch { once, interval } => run_watch(config, once, interval).await,
        Commands::Clear { all, resolved } => run_clear(config, all, resolved).await,
        Commands::ResetPositions => {
            let watcher = open_watcher(&config).await?;
            let cleared = watcher.reset_positions().await?;
            println!("Reset {cleared} tracked log position(s)");
            Ok(())
        }
    }
}
