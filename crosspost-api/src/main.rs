//! crosspost-api - HTTP server for post submission and webhooks

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crosspost_api::{router, AppState};
use libcrosspost::logging::LoggingConfig;
use libcrosspost::service::CrosspostService;
use libcrosspost::{Config, CrosspostError};

#[derive(Parser, Debug)]
#[command(name = "crosspost-api")]
#[command(version)]
#[command(about = "HTTP server for post submission and inbound webhooks")]
#[command(long_about = "\
crosspost-api - HTTP server for post submission and inbound webhooks

ENDPOINTS:
    POST /post                 Submit a post to one or more target platforms
    POST /webhook/{provider}   Provider callbacks (twitch)
    GET  /health               Liveness check

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight requests complete)

CONFIGURATION:
    Configuration file: ~/.config/crosspost/config.toml (or CROSSPOST_CONFIG)

    [server]
    bind = \"127.0.0.1:8080\"
    max_body_size = 1048576
    concurrency_limit = 1000

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Address to listen on (overrides config)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,
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
    let bind = cli.bind.unwrap_or_else(|| config.server.bind.clone());

    let service = CrosspostService::from_config(config).await?;
    let app = router(AppState::from_service(&service), &service.config().server);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    info!("crosspost-api listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let flushed = service.sessions().flush_all().await?;
    info!(sessions = flushed, "crosspost-api stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use futures::stream::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            tracing::error!("Signal setup failed: {}", e);
            std::future::pending::<()>().await;
            return;
        }
    };

    if let Some(signal) = signals.next().await {
        info!(signal, "Received shutdown signal, stopping gracefully...");
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received shutdown signal, stopping gracefully...");
    }
}
