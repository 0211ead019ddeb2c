//! Autopilot daemon binary entrypoint.

use anyhow::Result;
use autopilot_core::{AppConfig, MemorySettingsStore, PgSettingsStore, SettingsStore};
use autopilot_engine::{
    AutopilotManager, InstanceDeps, ManagerOptions, PaperClientFactory, PersistenceQueue,
};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "autopilot_daemon=info,autopilot_engine=info,risk_manager=info".into()
    });
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Users whose instances are loaded at boot, from a comma-separated list.
fn boot_users() -> Vec<String> {
    std::env::var("AUTOPILOT_BOOT_USERS")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

async fn settings_store(config: &AppConfig) -> Result<Arc<dyn SettingsStore>> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await?;
            info!("Using Postgres settings store");
            Ok(Arc::new(PgSettingsStore::new(pool)))
        }
        None => {
            warn!("DATABASE_URL not set, settings are kept in memory only");
            Ok(Arc::new(MemorySettingsStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Starting autopilot daemon");

    let config = AppConfig::from_env()?;
    info!(
        ownership_mode = ?config.ownership_mode,
        loop_interval_secs = config.loop_interval_secs,
        retention_minutes = config.retention_minutes,
        "Configuration loaded"
    );

    let store = settings_store(&config).await?;
    let persistence = Arc::new(PersistenceQueue::spawn(
        store.clone(),
        config.persistence_queue_capacity,
    ));
    let factory = Arc::new(PaperClientFactory::new(Decimal::from(config.paper_balance)));

    let manager = AutopilotManager::new(
        ManagerOptions::from_config(&config),
        InstanceDeps {
            store,
            persistence,
            factory,
        },
    );
    manager.spawn_cleanup_loop().await;

    let users = boot_users();
    if !users.is_empty() {
        let started = manager.auto_start(&users).await;
        info!(loaded = users.len(), started = started.len(), "Boot users loaded");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    manager.shutdown().await;
    info!("Autopilot daemon stopped");
    Ok(())
}
