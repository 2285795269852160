/// FeedSync — live ingestion service
///
/// What it does:
///   1. One polling engine per configured provider (betsapi, apisports, oddsapi, pinnacle)
///   2. Reconciles every provider event onto one canonical event row
///   3. Syncs markets/odds, broadcasts score and odds changes to the JSONL stream
///   4. Settles ended events and enqueues the auto-settle job
///   5. Stale sweep every few minutes for events the pollers lost
///
/// Run:
///   cargo run --bin feed-sync

mod config;
mod feed_db;
mod publisher;

use anyhow::{Context, Result};
use config::{AppConfig, ProviderSettings};
use dotenv::dotenv;
use feed_db::SqliteStore;
use feed_model::{Clock, JobQueue, Publisher, StopFlag, Store, SystemClock};
use logger::{init_tracing, EventLogger};
use providers::apisports::ApiSportsAdapter;
use providers::betsapi::BetsApiAdapter;
use providers::oddsapi::OddsApiAdapter;
use providers::pinnacle::PinnacleAdapter;
use providers::ProviderAdapter;
use publisher::JsonlPublisher;
use std::env;
use std::fs::File;
use std::sync::Arc;
use sync_engine::{EngineConfig, EngineDeps, ProviderEngine, SettlementEngine, StaleSweepConfig, StaleSweeper};
use tracing::{error, info, warn};

fn build_adapter(settings: &ProviderSettings, clock: Arc<dyn Clock>) -> Option<Arc<dyn ProviderAdapter>> {
    let config = settings.adapter.clone();
    let adapter: Arc<dyn ProviderAdapter> = match settings.name {
        "betsapi" => Arc::new(BetsApiAdapter::new(config, clock)),
        "apisports" => Arc::new(ApiSportsAdapter::new(config, clock)),
        "oddsapi" => Arc::new(OddsApiAdapter::new(config, clock)),
        "pinnacle" => Arc::new(PinnacleAdapter::new(config, clock)),
        other => {
            warn!(provider = other, "unknown provider in config, skipped");
            return None;
        }
    };
    Some(adapter)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing("info");

    let cfg = AppConfig::from_env();
    info!("=== FeedSync live ingestion ===");
    info!("DB: {}  Logs: {}/  Tick: {:?}", cfg.db_path, cfg.log_dir, cfg.tick);

    // Single instance lock
    let lock_file_path = env::temp_dir().join("feedsync_live.lock");
    let lock_file = match File::create(&lock_file_path) {
        Ok(f) => f,
        Err(e) => {
            warn!("Failed to create lock file at {:?}: {}", lock_file_path, e);
            return Ok(());
        }
    };

    let mut lock = fd_lock::RwLock::new(lock_file);
    let _write_guard = match lock.try_write() {
        Ok(guard) => {
            info!("Acquired single-instance lock.");
            guard
        }
        Err(_) => {
            warn!("Another instance of feed-sync is already running! Exiting.");
            return Ok(());
        }
    };

    if cfg.providers.is_empty() {
        warn!("No provider credentials set (BETSAPI_TOKEN, APISPORTS_KEY, ODDS_API_KEY, PINNACLE_AUTH). Exiting.");
        return Ok(());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db = Arc::new(SqliteStore::open(&cfg.db_path, clock.clone()).context("open feed store")?);
    let store: Arc<dyn Store> = db.clone();
    let jobs: Arc<dyn JobQueue> = db;
    let audit = Arc::new(EventLogger::new(&cfg.log_dir));
    let publisher: Arc<dyn Publisher> = Arc::new(JsonlPublisher::new(audit.clone()));

    let settlement = Arc::new(
        SettlementEngine::new(store.clone(), jobs, publisher.clone(), clock.clone()).with_audit(audit.clone()),
    );
    let deps = EngineDeps { store: store.clone(), publisher, clock: clock.clone(), audit: Some(audit.clone()) };
    let engine_config = EngineConfig { tick: cfg.tick, ..EngineConfig::default() };

    let engines: Vec<Arc<ProviderEngine>> = cfg
        .providers
        .iter()
        .filter_map(|settings| build_adapter(settings, clock.clone()))
        .map(|adapter| {
            Arc::new(ProviderEngine::new(adapter, deps.clone(), settlement.clone(), engine_config.clone()))
        })
        .collect();

    let mut handles = Vec::new();
    for engine in &engines {
        info!(provider = engine.provider(), "engine starting");
        handles.push(engine.clone().start());
    }

    let sweep_stop = StopFlag::new();
    let sweeper = Arc::new(
        StaleSweeper::new(
            store,
            settlement,
            clock,
            StaleSweepConfig { interval: cfg.stale_sweep_interval, ..StaleSweepConfig::default() },
        )
        .with_audit(audit),
    );
    handles.push(sweeper.start(sweep_stop.clone()));

    info!("🚀 READY: {} provider engine(s) running. Ctrl-C to stop.", engines.len());
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("ctrl-c handler failed: {e}");
    }

    info!("Shutting down...");
    for engine in &engines {
        engine.stop();
    }
    sweep_stop.stop();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("task ended abnormally: {e}");
        }
    }
    info!("Bye.");
    Ok(())
}
