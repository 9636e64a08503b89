use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;

mod config;
use config::Config;

use plexfm::{
    Database, LastFmClient, PlexClient, ScrobbleDispatcher, ScrobbleMonitor, SessionTracker,
};

#[derive(Parser)]
#[command(name = "plexfmd")]
#[command(about = "Plex to Last.fm scrobbling daemon")]
#[command(version)]
struct Args {
    /// Configuration file path (created with defaults when missing)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the SQLite scrobble history (overrides the config file)
    #[arg(short, long)]
    database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration, then let the environment override it
    let config_path = args
        .config
        .as_deref()
        .map(|path| expand_path(&path.to_string_lossy()))
        .transpose()?;
    let mut config = Config::load(config_path.as_deref())?;
    config.apply_env()?;
    if let Some(database) = &args.database {
        config.database.path = database.clone();
    }

    init_logging(&config, args.verbose)?;

    info!("Starting plexfmd v{}", plexfm::VERSION);
    match &config_path {
        Some(path) => info!("Configuration loaded from: {}", path.display()),
        None => info!("No configuration file given, using defaults"),
    }

    config.validate()?;

    // Resolve database path (handle ~ expansion)
    let db_path = expand_path(&config.database.path)?;

    // Ensure database directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .context("Failed to create database directory")?;
    }

    let database = Database::new(&db_path)
        .context("Failed to initialize database")?;

    info!("Database initialized at: {}", db_path.display());

    let plex = PlexClient::new(
        config.plex.server_url.clone(),
        config.plex.token.clone(),
        Duration::from_secs(config.monitoring.request_timeout_secs),
    )
    .context("Failed to create Plex client")?;

    let lastfm = LastFmClient::new(
        config.lastfm.api_key.clone(),
        config.lastfm.api_secret.clone(),
        config.lastfm.session_key.clone(),
        Duration::from_secs(config.monitoring.submit_timeout_secs),
    )
    .context("Failed to create Last.fm client")?;

    let tracker = SessionTracker::new(config.policy.clone());
    let dispatcher = ScrobbleDispatcher::new(lastfm, database);
    let mut monitor = ScrobbleMonitor::new(plex, tracker, dispatcher, config.monitor_settings());

    info!("Polling Plex at {}", config.plex.server_url);

    // Set up graceful shutdown
    let shutdown_signal = setup_shutdown_handler();

    tokio::select! {
        _ = shutdown_signal => {
            info!("Received shutdown signal, stopping daemon...");
        }
        result = monitor.start_monitoring() => {
            if let Err(e) = result {
                error!("Scrobble monitoring failed: {}", e);
            }
        }
    }

    let pending = monitor.tracker().queued().len();
    if pending > 0 {
        warn!("{} eligible sessions were not submitted before shutdown", pending);
    }

    info!("plexfmd stopped");
    Ok(())
}

fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let log_level = if verbose {
        LevelFilter::Debug
    } else {
        config.logging.level.parse().unwrap_or(LevelFilter::Info)
    };

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(log_level);

    if let Some(file) = &config.logging.file {
        let path = expand_path(file)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create log directory")?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

async fn setup_shutdown_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn expand_path(path: &str) -> Result<PathBuf> {
    if path.starts_with('~') {
        let home = std::env::var("HOME")
            .context("HOME environment variable not set")?;
        Ok(PathBuf::from(path.replacen('~', &home, 1)))
    } else {
        Ok(PathBuf::from(path))
    }
}
