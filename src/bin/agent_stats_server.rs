//! Agent stats service entry point.
//!
//! Starts the periodic aggregation and snapshot tasks and serves the
//! read-only query API until the process is terminated.

use agent_stats_server::agcommon::assets::{AssetCache, AssetMetadataResolver, HttpMetadataResolver};
use agent_stats_server::agcommon::rates::{new_exchange_rates, spawn_rate_feed};
use agent_stats_server::agserver::web::{start_web_server, AppState};
use agent_stats_server::agstats::scheduler::{spawn_aggregation_task, spawn_snapshot_task};
use agent_stats_server::agstats::{BalanceSnapshotter, PeriodAggregator};
use agent_stats_server::{AppConfig, Database, Timeframe};

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agent_stats_server")]
#[command(about = "Incremental agent activity aggregation and query API")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config/agent_stats.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = AppConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config))?;
    info!("starting agent stats service, database {}", config.database.path);

    let db = Arc::new(
        Database::new(&config.database.path, config.database.pool_size)
            .context("failed to open database")?,
    );
    db.ensure_ledger_indexes()
        .context("failed to create ledger indexes")?;

    let rates = new_exchange_rates();
    spawn_rate_feed(
        rates.clone(),
        config.feeds.rates_url.clone(),
        config.feeds.rates_refresh_secs,
    );

    let assets = Arc::new(AssetCache::new());
    let resolver: Arc<dyn AssetMetadataResolver> =
        Arc::new(HttpMetadataResolver::new(config.feeds.metadata_url.clone()));
    // warm the metadata cache; a cold cache only blocks asset-denominated
    // snapshots, so a failure here is not fatal
    match resolver.resolve(None).await {
        Ok(entries) => {
            assets.merge(entries);
            info!("asset metadata cache warmed, {} entries", assets.len());
        }
        Err(e) => warn!("asset metadata warm-up failed: {}", e),
    }

    let aggregator = Arc::new(PeriodAggregator::new(
        db.clone(),
        assets.clone(),
        rates.clone(),
        resolver,
    ));
    let snapshotter = Arc::new(BalanceSnapshotter::new(
        db.clone(),
        assets.clone(),
        rates.clone(),
    ));

    spawn_aggregation_task(
        aggregator.clone(),
        Timeframe::Hourly,
        Duration::from_secs(config.scheduler.hourly_interval_secs),
    );
    spawn_aggregation_task(
        aggregator,
        Timeframe::Daily,
        Duration::from_secs(config.scheduler.daily_interval_secs),
    );
    spawn_snapshot_task(
        snapshotter,
        Duration::from_secs(config.scheduler.snapshot_interval_secs),
    );

    let listen_addr: SocketAddr = config.server.listen_addr.parse()?;
    let state = AppState { db, assets };
    start_web_server(state, listen_addr)
        .await
        .context("web server exited")?;
    Ok(())
}
