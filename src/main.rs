use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use review_poller::api::{self, ApiState, DEFAULT_HOURS, MAX_HOURS};
use review_poller::{Config, FileStore, ReviewStore, Scheduler, Target};

#[derive(Parser)]
#[command(name = "review-poller")]
#[command(about = "Poll app store review feeds and serve recent reviews")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the targets configuration file
    #[arg(long, env = "REVIEW_POLLER_CONFIG", default_value = "config/apps.json")]
    config: PathBuf,

    /// Directory holding state.json and the review logs
    #[arg(long, env = "REVIEW_POLLER_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and the HTTP API until interrupted
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: SocketAddr,

        /// Seconds to wait for in-flight polls on shutdown
        #[arg(long, default_value_t = 8)]
        grace_secs: u64,
    },

    /// Run one poll iteration for a target in the foreground
    Poll {
        #[arg(long)]
        app_id: String,

        #[arg(long)]
        country: String,
    },

    /// Print recent reviews for a target as JSON
    Reviews {
        #[arg(long)]
        app_id: String,

        #[arg(long)]
        country: String,

        /// Look-back window in hours
        #[arg(
            long,
            default_value_t = DEFAULT_HOURS,
            value_parser = clap::value_parser!(i64).range(1..=MAX_HOURS)
        )]
        hours: i64,
    },

    /// List configured targets and when they were last polled
    Targets,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("review_poller=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve { bind, grace_secs } => {
            serve(config, &cli.data_dir, bind, Duration::from_secs(grace_secs)).await
        }
        Commands::Poll { app_id, country } => poll(config, &cli.data_dir, Target::new(app_id, country)).await,
        Commands::Reviews {
            app_id,
            country,
            hours,
        } => print_reviews(&cli.data_dir, &Target::new(app_id, country), hours),
        Commands::Targets => list_targets(config, &cli.data_dir),
    }
}

fn open_store(data_dir: &Path) -> Result<Arc<FileStore>> {
    let store = FileStore::new(data_dir)
        .with_context(|| format!("Failed to open data directory: {}", data_dir.display()))?;
    Ok(Arc::new(store))
}

async fn serve(config: Config, data_dir: &Path, bind: SocketAddr, grace: Duration) -> Result<()> {
    let store = open_store(data_dir)?;
    let scheduler = Scheduler::from_config(&config, store.clone())?;
    scheduler.start();

    let app = api::router(ApiState {
        scheduler: scheduler.clone(),
        store,
    });

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;

    info!(addr = %bind, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler.shutdown_token()))
        .await
        .context("Server error")?;

    if tokio::time::timeout(grace, scheduler.stop()).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "Polls still running after grace period, exiting");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then cancel the scheduler
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

async fn poll(config: Config, data_dir: &Path, target: Target) -> Result<()> {
    let store = open_store(data_dir)?;
    let scheduler = Scheduler::from_config(&config, store.clone())?;

    let outcome = scheduler.poll_once(&target).await;
    println!("{}: {}", target, outcome);

    if let Some(last_poll) = store.last_poll(&target) {
        println!("  Last poll: {}", last_poll.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    println!("  Known reviews: {}", store.seen_set(&target).len());

    Ok(())
}

fn print_reviews(data_dir: &Path, target: &Target, hours: i64) -> Result<()> {
    let store = open_store(data_dir)?;
    let reviews = store.read_recent(target, chrono::Duration::hours(hours))?;
    println!("{}", serde_json::to_string_pretty(&reviews)?);

    Ok(())
}

fn list_targets(config: Config, data_dir: &Path) -> Result<()> {
    if config.apps.is_empty() {
        println!("No targets configured.");
        return Ok(());
    }

    let store = open_store(data_dir)?;

    println!("Targets:\n");
    for target in &config.apps {
        let label = match &target.name {
            Some(name) => format!("{} ({})", target, name),
            None => target.to_string(),
        };
        let last_poll = store
            .last_poll(target)
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "never".to_string());

        println!("  {}", label);
        println!("    Last poll: {}", last_poll);
        println!("    Known reviews: {}", store.seen_set(target).len());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("review-poller").chain(args.iter().copied()))
    }

    #[test]
    fn test_reviews_hours_bounds() {
        let base = ["reviews", "--app-id", "1", "--country", "us"];

        match parse(&base).unwrap().command {
            Commands::Reviews { hours, .. } => assert_eq!(hours, 48),
            _ => panic!("expected reviews command"),
        }

        let max = MAX_HOURS.to_string();
        let ok: Vec<&str> = base.iter().copied().chain(["--hours", max.as_str()]).collect();
        assert!(parse(&ok).is_ok());

        for bad in ["0", "-5", "2161", "9000000000000000000"] {
            let args: Vec<&str> = base.iter().copied().chain(["--hours", bad]).collect();
            assert!(parse(&args).is_err(), "--hours {} should be rejected", bad);
        }
    }
}
