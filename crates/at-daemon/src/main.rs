#![allow(dead_code)]

//! Control-plane daemon — owns the store-backed scheduler and worker
//! registry, and runs the periodic sweeps (orphan/zombie cleanup, post-hoc
//! log analysis) that keep state honest across worker crashes and
//! restarts. Does not serve the webhook/HTTP ingress itself: that is a thin
//! edge a deployment bolts on, calling into `at_daemon::webhook_dispatcher`
//! directly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use at_core::config::Config;
use at_core::lockfile::{AcquireResult, DaemonLockfile};
use at_core::store::{SqliteStore, Store};
use at_daemon::cleanup::CleanupSweep;
use at_daemon::log_analyser::LogAnalyserSweep;
use at_daemon::scheduler::Scheduler;
use at_daemon::worker_registry::WorkerRegistry;
use at_harness::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use at_harness::security;
use at_harness::shutdown::ShutdownSignal;
use at_integrations::tracker::{GraphQlTrackerClient, TrackerClient};
use tracing::{error, info, warn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const LOG_ANALYSER_INTERVAL: Duration = Duration::from_secs(120);

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    at_telemetry::logging::init_logging("at-daemon", "info");

    let config = load_config().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });

    check_environment(&config);

    let lockfile = DaemonLockfile {
        pid: std::process::id(),
        api_port: config.daemon.port,
        host: config.daemon.host.clone(),
        started_at: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    match lockfile.acquire() {
        Ok(AcquireResult::Acquired) => {}
        Ok(AcquireResult::AlreadyRunning(existing)) => {
            anyhow::bail!("daemon already running (pid={}, api={})", existing.pid, existing.api_url());
        }
        Ok(AcquireResult::StaleRemoved) => match lockfile.acquire() {
            Ok(AcquireResult::Acquired) => {}
            other => anyhow::bail!("failed to acquire lockfile after removing stale entry: {:?}", other.is_ok()),
        },
        Err(e) => return Err(e).context("failed to acquire daemon lockfile"),
    }

    info!(pid = lockfile.pid, port = lockfile.api_port, "at-daemon starting");

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(expand_tilde(&config.store.path))
            .await
            .with_context(|| format!("failed to open store at {}", config.store.path))?,
    );

    let scheduler = Arc::new(Scheduler::new(store.clone()));
    let registry = Arc::new(WorkerRegistry::new(store.clone()));
    let tracker = build_tracker_client(&config, store.clone());

    let cleanup = Arc::new(CleanupSweep::new(store.clone(), scheduler.clone(), registry.clone()));
    let log_analyser = Arc::new(LogAnalyserSweep::new(store.clone(), tracker));

    let shutdown = ShutdownSignal::new();

    let cleanup_shutdown = shutdown.subscribe();
    let cleanup_task = tokio::spawn(run_cleanup_loop(cleanup, cleanup_shutdown));

    let log_analyser_shutdown = shutdown.subscribe();
    let log_analyser_task = tokio::spawn(run_log_analyser_loop(log_analyser, log_analyser_shutdown));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
    info!("ctrl-c received, shutting down");
    shutdown.trigger();

    let _ = tokio::join!(cleanup_task, log_analyser_task);

    DaemonLockfile::remove();
    info!("at-daemon stopped");
    Ok(())
}

async fn run_cleanup_loop(sweep: Arc<CleanupSweep>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                match sweep.run_debounced().await {
                    Ok(Some(report)) if report != Default::default() => {
                        info!(?report, "cleanup sweep ran");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "cleanup sweep failed"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn run_log_analyser_loop(
    sweep: Arc<LogAnalyserSweep>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(LOG_ANALYSER_INTERVAL) => {
                match sweep.run_debounced().await {
                    Ok(Some(reported)) if reported > 0 => {
                        info!(reported, "log analyser sweep reported findings");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "log analyser sweep failed"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

fn build_tracker_client(config: &Config, store: Arc<dyn Store>) -> Arc<dyn TrackerClient> {
    let breaker = CircuitBreaker::new(
        store.clone(),
        CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(config.tracker.circuit_reset_timeout_secs),
            reset_timeout_max: Duration::from_secs(config.tracker.circuit_reset_timeout_max_secs),
        },
    );
    let api_token = config
        .tracker
        .api_token_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
        .unwrap_or_default();
    Arc::new(GraphQlTrackerClient::new(
        config.tracker.api_base_url.clone().unwrap_or_else(|| "https://api.linear.app/graphql".to_string()),
        api_token,
        store,
        breaker,
        config.tracker.rate_limit_burst,
        config.tracker.rate_limit_per_second,
    ))
}

/// Fatal in production, a warning in development, matching the spec's
/// startup environment-validation posture.
fn check_environment(config: &Config) {
    if let Err(errors) = security::validate_environment(|name| std::env::var(name).ok()) {
        if config.general.environment == "production" {
            for e in &errors {
                error!(error = %e, "missing/invalid required environment variable");
            }
            std::process::exit(1);
        } else {
            for e in &errors {
                warn!(error = %e, "missing/invalid required environment variable (non-fatal outside production)");
            }
        }
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

fn load_config() -> Result<Config> {
    let path = Config::default_path();
    if path.exists() {
        Config::load_from(&path).with_context(|| format!("failed to load config from {}", path.display()))
    } else {
        Ok(Config::default())
    }
}
