//! Worker registry (spec §4.4) — tracks which worker processes are alive,
//! their capacity, and their currently-assigned sessions.
//!
//! Grounded on `heartbeat.rs`'s stale-agent detection idiom (periodic sweep
//! comparing `last_heartbeat` against a timeout), generalized to a
//! store-backed registry keyed per spec §6 rather than the teacher's
//! in-memory `CacheDb` map.

use std::sync::Arc;
use std::time::Duration;

use at_core::store::Store;
use at_core::types::{Worker, WorkerStatus};
use chrono::Utc;
use tracing::{info, warn};

fn worker_key(worker_id: &str) -> String {
    format!("work:worker:{worker_id}")
}
fn worker_sessions_key(worker_id: &str) -> String {
    format!("work:worker:{worker_id}:sessions")
}
const WORKERS_SET_KEY: &str = "work:workers";
/// Spec §6: a worker record lives 120s past its last write, so a crashed
/// worker that never deregisters still falls out of the store on its own.
const WORKER_RECORD_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum WorkerRegistryError {
    #[error("store error: {0}")]
    Store(#[from] at_core::store::StoreError),
}

pub type Result<T> = std::result::Result<T, WorkerRegistryError>;

pub struct WorkerRegistry {
    store: Arc<dyn Store>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn register(&self, worker: &Worker) -> Result<()> {
        let payload = serde_json::to_string(worker).expect("Worker serializes");
        self.store.set(&worker_key(&worker.worker_id), &payload, Some(WORKER_RECORD_TTL)).await?;
        self.store.sadd(WORKERS_SET_KEY, &worker.worker_id).await?;
        info!(worker_id = %worker.worker_id, capacity = worker.capacity, "worker registered");
        Ok(())
    }

    pub async fn get(&self, worker_id: &str) -> Result<Option<Worker>> {
        match self.store.get(&worker_key(worker_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let Some(mut worker) = self.get(worker_id).await? else {
            warn!(worker_id, "heartbeat for unregistered worker, ignoring");
            return Ok(());
        };
        worker.last_heartbeat = Utc::now();
        worker.status = WorkerStatus::Active;
        let payload = serde_json::to_string(&worker).expect("Worker serializes");
        self.store.set(&worker_key(worker_id), &payload, Some(WORKER_RECORD_TTL)).await?;
        Ok(())
    }

    pub async fn set_draining(&self, worker_id: &str) -> Result<()> {
        let Some(mut worker) = self.get(worker_id).await? else {
            return Ok(());
        };
        worker.status = WorkerStatus::Draining;
        let payload = serde_json::to_string(&worker).expect("Worker serializes");
        self.store.set(&worker_key(worker_id), &payload, Some(WORKER_RECORD_TTL)).await?;
        Ok(())
    }

    /// Deregisters a worker and returns the sessions it still held, so the
    /// caller can requeue them (spec §4.4).
    pub async fn deregister(&self, worker_id: &str) -> Result<Vec<String>> {
        let unclaimed = self.active_sessions(worker_id).await?;
        self.store.delete(&worker_key(worker_id)).await?;
        self.store.delete(&worker_sessions_key(worker_id)).await?;
        self.store.srem(WORKERS_SET_KEY, worker_id).await?;
        info!(worker_id, unclaimed = unclaimed.len(), "worker deregistered");
        Ok(unclaimed)
    }

    pub async fn track_session(&self, worker_id: &str, session_id: &str) -> Result<()> {
        self.store.sadd(&worker_sessions_key(worker_id), session_id).await?;
        Ok(())
    }

    pub async fn untrack_session(&self, worker_id: &str, session_id: &str) -> Result<()> {
        self.store.srem(&worker_sessions_key(worker_id), session_id).await?;
        Ok(())
    }

    pub async fn active_sessions(&self, worker_id: &str) -> Result<Vec<String>> {
        Ok(self.store.smembers(&worker_sessions_key(worker_id)).await?)
    }

    pub async fn all_worker_ids(&self) -> Result<Vec<String>> {
        Ok(self.store.smembers(WORKERS_SET_KEY).await?)
    }

    /// Session-set size, not the worker record's advisory `active_count`
    /// field, which can go stale across re-registration (spec §4.4).
    pub async fn total_capacity(&self, worker_id: &str) -> Result<(u32, usize)> {
        let worker = self.get(worker_id).await?;
        let capacity = worker.map(|w| w.capacity).unwrap_or(0);
        let in_use = self.active_sessions(worker_id).await?.len();
        Ok((capacity, in_use))
    }

    /// Lets a reconnecting worker adopt a session it lost track of.
    /// Accepted only if the stored session's `worker_id` equals
    /// `old_worker_id` or is empty, so a worker can't steal a session that
    /// legitimately belongs to someone else.
    pub async fn transfer_session_ownership(
        &self,
        sessions: &at_core::session_store::SessionStore,
        session_id: &str,
        old_worker_id: Option<&str>,
        new_worker_id: &str,
    ) -> Result<bool> {
        let Some(mut session) = sessions.load(session_id).await? else {
            return Ok(false);
        };
        let owned_by_old = match &session.worker_id {
            None => true,
            Some(current) => Some(current.as_str()) == old_worker_id,
        };
        if !owned_by_old {
            return Ok(false);
        }

        if let Some(previous) = &session.worker_id {
            self.untrack_session(previous, session_id).await?;
        }
        session.worker_id = Some(new_worker_id.to_string());
        session.updated_at = Utc::now();
        sessions.save(&session).await?;
        self.track_session(new_worker_id, session_id).await?;
        Ok(true)
    }

    /// Sweep all registered workers and return those whose heartbeat has
    /// gone stale (half-open boundary: exactly at `timeout` counts as
    /// stale). Does not deregister — the cleanup module decides the
    /// disposition of a stale worker's in-flight sessions first.
    pub async fn stale_workers(&self, timeout: chrono::Duration) -> Result<Vec<Worker>> {
        let now = Utc::now();
        let mut stale = Vec::new();
        for worker_id in self.all_worker_ids().await? {
            if let Some(worker) = self.get(&worker_id).await? {
                if !worker.is_alive(now, timeout) {
                    stale.push(worker);
                }
            }
        }
        Ok(stale)
    }
}
