#![allow(dead_code)]

//! Worker process — polls the dispatch queue for claimable sessions and runs
//! one supervised agent per claimed session, up to its configured capacity.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use at_core::config::Config;
use at_core::store::{SqliteStore, Store};
use at_core::types::Worker;
use at_daemon::worker_registry::WorkerRegistry;
use at_harness::shutdown::ShutdownSignal;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

mod poll_loop;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    at_telemetry::logging::init_logging("at-worker", "info");

    let config = load_config().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });

    let worker_id = uuid::Uuid::new_v4().to_string();
    let hostname = hostname();
    let capacity = config.worker.capacity;

    info!(worker_id, hostname, capacity, "at-worker starting");

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.worker.store_path)
            .await
            .with_context(|| format!("failed to open store at {}", config.worker.store_path))?,
    );

    let registry = Arc::new(WorkerRegistry::new(store.clone()));
    let worker = Worker::new(worker_id.clone(), hostname.clone(), capacity);
    registry.register(&worker).await.context("failed to register worker")?;

    let shutdown = ShutdownSignal::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, draining in-flight sessions");
        shutdown_for_signal.trigger();
    });

    let heartbeat_registry = registry.clone();
    let heartbeat_worker_id = worker_id.clone();
    let heartbeat_interval = Duration::from_secs(config.worker.heartbeat_interval_secs);
    let mut heartbeat_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(heartbeat_interval) => {
                    if let Err(e) = heartbeat_registry.heartbeat(&heartbeat_worker_id).await {
                        warn!(error = %e, "heartbeat update failed");
                    }
                }
                _ = heartbeat_shutdown.recv() => break,
            }
        }
    });

    let capacity_gate = Arc::new(Semaphore::new(capacity as usize));
    poll_loop::run(store, registry.clone(), config, worker_id.clone(), capacity_gate, shutdown).await;

    registry.set_draining(&worker_id).await.ok();
    info!("at-worker stopped");
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("worker-{}", std::process::id()))
}

fn load_config() -> Result<Config> {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    let path = std::path::Path::new(&home).join(".at-dispatch").join("config.toml");
    if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).context("failed to parse config.toml")
    } else {
        Ok(Config::default())
    }
}
