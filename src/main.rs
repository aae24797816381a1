use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use costwindow::config::{CostWindowConfig, LogFormat, LoggingConfig, StoreBackend};
use costwindow::grpc::GrpcServer;
use costwindow::ratelimit::{ConsumerScope, RateLimiter};
use costwindow::store::{open_store, SqlStore};

/// Sliding-window cost rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "costwindow", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gRPC service (default)
    Serve,
    /// Print a consumer's stored window state as JSON
    Inspect {
        /// API client id; omit for the site-wide consumer
        #[arg(long)]
        client: Option<String>,
    },
    /// Create the SQLite tables
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = CostWindowConfig::load(cli.config.as_deref().and_then(|p| p.to_str()))?;
    init_tracing(&config.logging);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Inspect { client } => inspect(config, client).await,
        Command::Migrate => migrate(config).await,
    }
}

fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match config.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn serve(config: CostWindowConfig) -> anyhow::Result<()> {
    info!("Starting Costwindow Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        backend = ?config.store.backend,
        window_secs = config.rate_limiting.window_secs,
        "Configuration loaded"
    );

    let store = open_store(&config.store).await?;
    let settings = config.limit_settings()?;
    let rate_limiter = Arc::new(RateLimiter::from_config(
        store,
        &config.rate_limiting,
        settings,
    ));
    info!("Rate limiter initialized");

    let flush_task = spawn_flush_task(rate_limiter.clone(), config.rate_limiting.flush_interval_secs);
    let reload_task = spawn_reload_task(rate_limiter.clone(), &config);

    let grpc_server = GrpcServer::new(config.server.grpc_addr, rate_limiter.clone());
    let result = grpc_server.serve_with_shutdown(shutdown_signal()).await;

    flush_task.abort();
    if let Some(task) = reload_task {
        task.abort();
    }

    // Do not lose cost that was recorded but not yet written
    match rate_limiter.flush_all().await {
        Ok(count) => info!(consumers = count, "Flushed pending cost"),
        Err(e) => error!(error = %e, "Failed to flush pending cost on shutdown"),
    }

    result?;
    info!("Costwindow Rate Limiting Service stopped");
    Ok(())
}

/// Periodically write batched cost so it does not wait for the next request.
fn spawn_flush_task(rate_limiter: Arc<RateLimiter>, interval_secs: i64) -> JoinHandle<()> {
    let period = Duration::from_secs(u64::try_from(interval_secs).unwrap_or(0).max(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = rate_limiter.flush_all().await {
                warn!(error = %e, "Periodic cost flush failed");
            }
        }
    })
}

/// Periodically re-read the limits file, if one is configured.
fn spawn_reload_task(rate_limiter: Arc<RateLimiter>, config: &CostWindowConfig) -> Option<JoinHandle<()>> {
    let path = config.rate_limiting.limits_path.clone()?;
    let period = Duration::from_secs(config.rate_limiting.config_reload_interval_secs.max(1));

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately and the file was just loaded
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match costwindow::ratelimit::LimitSettings::from_file(&path) {
                Ok(settings) if settings != rate_limiter.settings() => {
                    info!(path = %path, "Rate limit settings changed");
                    rate_limiter.set_settings(settings);
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path, error = %e, "Failed to reload rate limit settings"),
            }
        }
    }))
}

async fn inspect(config: CostWindowConfig, client: Option<String>) -> anyhow::Result<()> {
    let store = open_store(&config.store).await?;
    let rate_limiter = RateLimiter::from_config(store, &config.rate_limiting, config.limit_settings()?);

    let scope = ConsumerScope::from_client_id(client.as_deref());
    let state = rate_limiter.state(scope).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn migrate(config: CostWindowConfig) -> anyhow::Result<()> {
    if config.store.backend != StoreBackend::Sqlite {
        warn!(backend = ?config.store.backend, "Store backend has no tables to create");
        return Ok(());
    }

    let store = SqlStore::connect(&config.store.database_url).await?;
    store.migrate().await?;
    info!(url = %config.store.database_url, "Rate limit tables created");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
