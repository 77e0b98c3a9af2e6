//! crosspost-worker - Background delivery daemon
//!
//! Drains the delivery queue, turns trigger events into posts, and
//! periodically collects finished content bundles.

use anyhow::Context;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

use libcrosspost::logging::LoggingConfig;
use libcrosspost::service::CrosspostService;
use libcrosspost::triggers::TriggerProcessor;
use libcrosspost::{Config, CrosspostError, DeliveryWorker};

#[derive(Parser, Debug)]
#[command(name = "crosspost-worker")]
#[command(version)]
#[command(about = "Background daemon that delivers queued posts")]
#[command(long_about = "\
crosspost-worker - Background daemon that delivers queued posts

DESCRIPTION:
    crosspost-worker polls the delivery queue, calls each job's target
    platform and records the outcome. Transient failures are retried with
    exponential backoff; jobs scheduled for later stay queued until due.

    It also consumes trigger events from webhooks, submitting a post for
    every matching trigger, and periodically deletes content bundles whose
    jobs have all finished.

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current batch)

CONFIGURATION:
    Configuration file: ~/.config/crosspost/config.toml (or CROSSPOST_CONFIG)

    [queue]
    poll_interval_ms = 1000
    max_attempts = 5
    retry_backoff_secs = 30
    sweep_interval_secs = 600

    [rate_limits]
    telegram = 20    # posts per hour

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Poll interval in milliseconds (overrides config)
    #[arg(long, value_name = "MILLIS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Process one batch of each queue, run maintenance and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<CrosspostError>()
            .map(CrosspostError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    let poll_interval = cli
        .poll_interval
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.queue.poll_interval());

    let service = CrosspostService::from_config(config).await?;
    let worker = service.delivery_worker().await?;
    let triggers = service.trigger_processor();

    info!("crosspost-worker starting");

    if cli.once {
        let (generated, delivered) = process_queues(&triggers, &worker).await;
        let report = service.maintain().await?;
        info!(
            generated,
            delivered,
            collected = report.bundles.collected,
            "processed queues once, exiting"
        );
    } else {
        let shutdown = Arc::new(AtomicBool::new(false));
        setup_signal_handlers(shutdown.clone()).context("signal setup failed")?;
        run_daemon_loop(&service, &triggers, &worker, poll_interval, shutdown).await;
    }

    service.sessions().flush_all().await?;
    info!("crosspost-worker stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}

/// One batch from the trigger queue, then one from the delivery queue.
async fn process_queues(triggers: &TriggerProcessor, worker: &DeliveryWorker) -> (usize, usize) {
    let generated = match triggers.run_once().await {
        Ok(n) => n,
        Err(e) => {
            error!("Error processing trigger events: {}", e);
            0
        }
    };

    let delivered = match worker.run_once().await {
        Ok(n) => n,
        Err(e) => {
            error!("Error processing deliveries: {}", e);
            0
        }
    };

    (generated, delivered)
}

async fn run_daemon_loop(
    service: &CrosspostService,
    triggers: &TriggerProcessor,
    worker: &DeliveryWorker,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let sweep_interval = Duration::from_secs(service.config().queue.sweep_interval_secs);
    let mut last_sweep = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        let (generated, delivered) = process_queues(triggers, worker).await;

        if last_sweep.elapsed() >= sweep_interval {
            if let Err(e) = service.maintain().await {
                error!("Error during maintenance: {}", e);
            }
            last_sweep = Instant::now();
        }

        // Busy queues are drained without pausing
        if generated > 0 || delivered > 0 {
            continue;
        }

        let deadline = Instant::now() + poll_interval;
        while Instant::now() < deadline && !shutdown.load(Ordering::Relaxed) {
            sleep(poll_interval.min(Duration::from_millis(250))).await;
        }
    }

    info!("Shutdown requested, stopping daemon loop");
}
