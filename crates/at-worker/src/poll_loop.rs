use std::sync::Arc;
use std::time::Duration;

use at_core::config::Config;
use at_core::store::Store;
use at_daemon::scheduler::Scheduler;
use at_daemon::worker_registry::WorkerRegistry;
use at_harness::shutdown::ShutdownSignal;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Claim-and-run loop. Holds at most `config.worker.capacity` sessions in
/// flight at once, gated by `capacity_gate`. Each claimed session runs on its
/// own task; the permit it holds is released when that task finishes,
/// regardless of outcome.
pub async fn run(
    store: Arc<dyn Store>,
    registry: Arc<WorkerRegistry>,
    config: Config,
    worker_id: String,
    capacity_gate: Arc<Semaphore>,
    shutdown: ShutdownSignal,
) {
    let scheduler = Arc::new(Scheduler::new(store.clone()));
    if let Err(e) = scheduler.migrate_legacy_queue().await {
        warn!(error = %e, "legacy queue migration failed");
    }

    let poll_interval = Duration::from_millis(config.worker.poll_interval_ms);
    let claim_ttl = Duration::from_secs(config.worker.claim_ttl_secs);
    let total_capacity = config.worker.capacity;
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        if shutdown.is_shutting_down() {
            break;
        }

        let permit = match capacity_gate.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => continue,
                    _ = shutdown_rx.recv() => break,
                }
            }
        };

        match try_claim_next(&scheduler, &worker_id, claim_ttl).await {
            Ok(Some(work)) => {
                let store = store.clone();
                let registry = registry.clone();
                let scheduler = scheduler.clone();
                let config = config.clone();
                let worker_id = worker_id.clone();
                let session_id = work.session_id.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    registry.track_session(&worker_id, &session_id).await.ok();
                    info!(session_id = %session_id, ticket = %work.ticket_identifier, "claimed session");
                    if let Err(e) =
                        at_agents::orchestrator::run_session(store, config, worker_id.clone(), work).await
                    {
                        error!(error = %e, "session supervision failed");
                    }
                    registry.untrack_session(&worker_id, &session_id).await.ok();
                    scheduler.release_claim(&session_id).await.ok();
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
            Err(e) => {
                drop(permit);
                warn!(error = %e, "queue poll failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }

    info!("poll loop exiting, waiting for in-flight sessions to drain");
    let _ = capacity_gate.acquire_many(total_capacity).await;
}

async fn try_claim_next(
    scheduler: &Scheduler,
    worker_id: &str,
    claim_ttl: Duration,
) -> Result<Option<at_core::types::QueuedWork>, at_daemon::scheduler::SchedulerError> {
    let candidates = scheduler.peek_work(8).await?;
    for candidate in candidates {
        if let Some(work) = scheduler.claim_work(&candidate.session_id, worker_id, claim_ttl).await? {
            return Ok(Some(work));
        }
        // Another worker won the race for this session_id — try the next candidate.
    }
    Ok(None)
}
