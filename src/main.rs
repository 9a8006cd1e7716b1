use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use floodgate::activelimit::{ActiveLimiter, DistributedActiveLimiter, LocalActiveLimiter};
use floodgate::config::{FloodgateConfig, StoreBackend};
use floodgate::error::FloodgateError;
use floodgate::ratelimit::{now_ms, Limiter, LocalRateLimiter, RedisRateLimiter};
use floodgate::server::{default_routes, with_admission, AdmissionServer};
use floodgate::store::{MemoryStore, RedisStore};

/// HTTP admission control service.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// Path to a configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing, honouring RUST_LOG
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Floodgate admission control service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => FloodgateConfig::from_file(path)?,
        None => FloodgateConfig::from_env()?,
    };
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    info!(http_addr = %config.server.http_addr, backend = ?config.store.backend, "Configuration loaded");
    let effective = serde_json::to_string(&config)?;
    debug!(config = %effective, "Effective configuration");

    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            spawn_window_sweeper(store.clone(), config.rate_limit.interval());
            let rate_limiter = Arc::new(LocalRateLimiter::new(
                store,
                config.rate_limit.rate,
                config.rate_limit.interval(),
            )?);
            let active_limiter = Arc::new(LocalActiveLimiter::with_scope(config.active_limit.scope));
            info!(scope = ?config.active_limit.scope, "In-process limiters initialized");

            run(&config, rate_limiter, active_limiter).await?;
        }
        StoreBackend::Redis => {
            let url = config.store.redis_url.as_deref().ok_or_else(|| {
                FloodgateError::Config("store.redis_url is required for the redis backend".to_string())
            })?;
            let store = Arc::new(
                RedisStore::connect_with(
                    url,
                    Some(config.store.key_prefix.clone()),
                    config.store.counter_ttl(),
                )
                .await?,
            );
            let rate_limiter = Arc::new(RedisRateLimiter::new(
                store.clone(),
                config.rate_limit.rate,
                config.rate_limit.interval(),
            )?);
            let active_limiter = Arc::new(DistributedActiveLimiter::new(store));
            info!(key_prefix = %config.store.key_prefix, "Redis-backed limiters initialized");

            run(&config, rate_limiter, active_limiter).await?;
        }
    }

    info!("Floodgate admission control service stopped");
    Ok(())
}

async fn run<R, A>(
    config: &FloodgateConfig,
    rate_limiter: Arc<R>,
    active_limiter: Arc<A>,
) -> anyhow::Result<()>
where
    R: Limiter + 'static,
    A: ActiveLimiter + 'static,
{
    let router = with_admission(default_routes(), config, rate_limiter, active_limiter);
    let server = AdmissionServer::new(config.server.http_addr, router);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;
    Ok(())
}

/// Periodically drop in-process windows that no longer hold any events.
fn spawn_window_sweeper(store: Arc<MemoryStore>, interval: Duration) {
    let period = interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let removed = store.evict_idle(now_ms(), interval);
            if removed > 0 {
                debug!(removed = removed, remaining = store.window_len(), "Evicted idle rate windows");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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
