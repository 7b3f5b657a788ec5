use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratelimiter::config::{LoggingConfig, Settings};
use ratelimiter::http::{router, HttpServer};
use ratelimiter::ratelimit::{Clock, FixedWindowCounter, SystemClock, TokenBucket};

/// Per-client rate limiting server.
#[derive(Parser, Debug)]
#[command(name = "ratelimiter")]
#[command(about = "Fixed-window and token bucket rate limiting in front of HTTP routes")]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log filter directive, overriding the configuration
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        settings.server.listen_addr = listen;
    }
    if let Some(level) = args.log_level {
        settings.logging.level = level;
    }

    init_tracing(&settings.logging);

    info!("Starting Ratelimiter");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(listen_addr = %settings.server.listen_addr, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let fixed_window = Arc::new(FixedWindowCounter::new(
        settings.fixed_window.size_secs,
        settings.fixed_window.threshold,
        clock.clone(),
    )?);
    let token_bucket = Arc::new(TokenBucket::new(
        settings.token_bucket.capacity,
        settings.token_bucket.rate_secs,
        clock,
    )?);
    info!(
        window_secs = fixed_window.size(),
        threshold = fixed_window.threshold(),
        capacity = token_bucket.capacity(),
        rate_secs = settings.token_bucket.rate_secs,
        "Rate limiters initialized"
    );

    let sweeper = fixed_window.spawn_sweeper(settings.fixed_window.sweep_interval());
    let refill = token_bucket.spawn_refill();

    let server = HttpServer::bind(
        settings.server.listen_addr,
        router(fixed_window.clone(), token_bucket.clone()),
    )
    .await?;

    // Run the server with graceful shutdown on Ctrl+C
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    fixed_window.stop();
    token_bucket.stop();
    for (name, task) in [("sweeper", sweeper), ("refill", refill)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = name, error = %e, "Background task failed"),
            Err(e) => warn!(task = name, error = %e, "Background task panicked"),
        }
    }

    served?;
    info!("Ratelimiter stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
