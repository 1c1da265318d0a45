//! teamcast-send - Background dispatcher for queued and scheduled posts
//!
//! Polls the job queue, publishes whatever is due and delivers pending
//! notifications. Several instances may share one database.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libteamcast::logging::LoggingConfig;
use libteamcast::service::dispatcher::Dispatcher;
use libteamcast::{Config, TeamcastService};
use tokio::time::{sleep, Duration};
use tracing::{error, info};

const EXIT_RUNTIME: i32 = 1;
const EXIT_CONFIG: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "teamcast-send")]
#[command(version)]
#[command(about = "Background dispatcher for queued and scheduled team posts")]
#[command(long_about = "\
teamcast-send - Background dispatcher for queued and scheduled team posts

DESCRIPTION:
    teamcast-send is a long-running worker. Every poll it returns jobs whose
    lease expired to the queue, claims due jobs, publishes them to each of
    the post's platforms and delivers pending notifications.

    Run as many workers as you like against the same database; a job is
    only ever held by one of them at a time.

USAGE:
    # Run in foreground (logs to stderr)
    teamcast-send

    # Process whatever is due once and exit
    teamcast-send --once

    # JSON logs for a log shipper
    TEAMCAST_LOG_FORMAT=json teamcast-send

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current poll)

CONFIGURATION:
    Configuration file: ~/.config/teamcast/config.toml (or TEAMCAST_CONFIG)

    [queue]
    poll_interval_secs = 10
    lease_secs = 300
    max_attempts = 3

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "TEAMCAST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Seconds between polls (overrides queue.poll_interval_secs)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Name this worker claims jobs under
    #[arg(long, value_name = "ID")]
    worker_id: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Run one poll and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    let service = match build_service(&cli).await {
        Ok(service) => service,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            process::exit(EXIT_CONFIG);
        }
    };

    if let Err(e) = run(cli, service).await {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        process::exit(EXIT_RUNTIME);
    }
}

async fn build_service(cli: &Cli) -> Result<TeamcastService> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    TeamcastService::from_config(config)
        .await
        .context("failed to start the service")
}

async fn run(cli: Cli, service: TeamcastService) -> Result<()> {
    let worker_id = cli
        .worker_id
        .unwrap_or_else(|| format!("teamcast-send-{}", process::id()));
    let poll_interval = cli
        .poll_interval
        .unwrap_or(service.config().queue.poll_interval_secs);
    let dispatcher = service.dispatcher(worker_id);

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;
    info!(worker_id = dispatcher.worker_id(), poll_interval, "teamcast-send starting");

    if cli.once {
        let report = dispatcher.run_once().await?;
        info!(
            processed = report.processed,
            published = report.published,
            failed = report.failed,
            "processed due jobs once, exiting"
        );
        return Ok(());
    }

    run_loop(&dispatcher, poll_interval, &shutdown).await;

    info!("teamcast-send stopped");
    Ok(())
}

async fn run_loop(dispatcher: &Dispatcher, poll_interval: u64, shutdown: &AtomicBool) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("shutdown requested, stopping");
            break;
        }

        // a failed poll is retried on the next one
        if let Err(e) = dispatcher.run_once().await {
            error!(error = %e, "dispatcher poll failed");
        }

        // sleep in 1s steps so a signal is noticed promptly
        for _ in 0..poll_interval.max(1) {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("signal setup failed")?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "received shutdown signal, stopping gracefully");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl-C, stopping gracefully");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}
