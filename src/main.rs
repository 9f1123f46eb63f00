use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt::Debug, path::PathBuf};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use param_catalog_server::catalog_store::SqliteCatalogStore;
use param_catalog_server::change_events::{
    prune_published, unix_millis_now, HttpMessageBus, LogMessageBus, MessageBus, OutboxPublisher,
    OutboxStore,
};
use param_catalog_server::config;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite catalog database file. Can also be specified in config file.
    #[clap(long, value_parser = parse_path)]
    pub db_path: Option<PathBuf>,

    /// Number of read-only connections used for catalog queries.
    #[clap(long, default_value_t = 4)]
    pub read_pool_size: usize,

    /// Endpoint receiving change events. Events are only logged when not set.
    #[clap(long)]
    pub bus_url: Option<String>,

    /// Timeout in milliseconds for a single publish attempt.
    #[clap(long, default_value_t = 5000)]
    pub publish_timeout_ms: u64,

    /// Number of days to retain published outbox rows. Set to 0 to disable pruning.
    #[clap(long, default_value_t = 7)]
    pub published_retention_days: u64,

    /// Interval in hours between pruning runs. Only used if published_retention_days > 0.
    #[clap(long, default_value_t = 24)]
    pub prune_interval_hours: u64,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_path: args.db_path.clone(),
            read_pool_size: args.read_pool_size,
            bus_url: args.bus_url.clone(),
            publish_timeout_ms: args.publish_timeout_ms,
            published_retention_days: args.published_retention_days,
            prune_interval_hours: args.prune_interval_hours,
        }
    }
}

fn spawn_pruning_task(
    outbox: Arc<dyn OutboxStore>,
    retention_days: u64,
    interval_hours: u64,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    info!(
        "Outbox pruning enabled: retaining published events {} days, pruning every {} hours",
        retention_days, interval_hours
    );

    tokio::spawn(async move {
        let interval = Duration::from_secs(interval_hours.max(1) * 60 * 60);
        let mut ticker = tokio::time::interval(interval);

        // Skip the first immediate tick, wait for the first interval
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            let store = outbox.clone();
            let result = tokio::task::spawn_blocking(move || {
                prune_published(store.as_ref(), retention_days, unix_millis_now())
            })
            .await;

            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Failed to prune outbox: {:#}", e),
                Err(e) => error!("Outbox pruning task panicked: {}", e),
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_path: {:?}", app_config.db_path);
    info!("  read_pool_size: {}", app_config.read_pool_size);
    info!(
        "  bus_url: {}",
        app_config.publisher.bus_url.as_deref().unwrap_or("<log only>")
    );

    if !app_config.db_path.exists() {
        info!("Creating new catalog database at {:?}", app_config.db_path);
    }
    let catalog_store = Arc::new(SqliteCatalogStore::new(
        &app_config.db_path,
        app_config.read_pool_size,
    )?);

    let bus: Arc<dyn MessageBus> = match &app_config.publisher.bus_url {
        Some(url) => {
            info!("Publishing change events to {}", url);
            Arc::new(HttpMessageBus::new(
                url.clone(),
                Duration::from_millis(app_config.publisher.publish_timeout_ms),
            )?)
        }
        None => {
            info!("No bus configured, change events will be logged");
            Arc::new(LogMessageBus)
        }
    };

    let shutdown_token = CancellationToken::new();
    let outbox = catalog_store.clone() as Arc<dyn OutboxStore>;

    let publisher = OutboxPublisher::new(
        outbox.clone(),
        bus,
        &app_config.publisher,
        Arc::new(Notify::new()),
    );
    let publisher_handle = publisher.spawn(shutdown_token.child_token());

    let pruning_handle = if app_config.publisher.published_retention_days > 0 {
        Some(spawn_pruning_task(
            outbox,
            app_config.publisher.published_retention_days,
            app_config.publisher.prune_interval_hours,
            shutdown_token.child_token(),
        ))
    } else {
        None
    };

    info!("Catalog server running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, initiating graceful shutdown");
    shutdown_token.cancel();

    if let Err(e) = publisher_handle.await {
        error!("Outbox publisher task failed: {}", e);
    }
    if let Some(handle) = pruning_handle {
        if let Err(e) = handle.await {
            error!("Outbox pruning task failed: {}", e);
        }
    }

    info!("Catalog server stopped");
    Ok(())
}
