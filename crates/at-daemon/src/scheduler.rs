//! Work queue and issue-lock scheduler (spec §4.5).
//!
//! Two cooperating structures live here:
//! - The **global priority queue** (`work:items` hash + `work:queue` zset)
//!   that workers poll and claim from.
//! - The **per-ticket issue lock** (`issue:lock:<tid>`) plus its **pending
//!   bucket** (`issue:pending:<tid>` zset + `issue:pending:items:<tid>`
//!   hash) that parks work arriving while a ticket is already locked.
//!
//! `dispatch_work` is the single entry point the webhook dispatcher and the
//! orphan-cleanup sweep both call: acquire the lock, or park.

use std::sync::Arc;
use std::time::Duration;

use at_core::store::Store;
use at_core::types::{clamp_priority, IssueLock, QueuedWork};
use chrono::Utc;
use tracing::{debug, info, warn};

const ITEMS_KEY: &str = "work:items";
const QUEUE_KEY: &str = "work:queue";
const LEGACY_QUEUE_KEY: &str = "work:queue:legacy"; // migrateFromLegacyQueue bootstrap source

fn claim_key(session_id: &str) -> String {
    format!("work:claim:{session_id}")
}
fn lock_key(ticket_id: &str) -> String {
    format!("issue:lock:{ticket_id}")
}
fn pending_queue_key(ticket_id: &str) -> String {
    format!("issue:pending:{ticket_id}")
}
fn pending_items_key(ticket_id: &str) -> String {
    format!("issue:pending:items:{ticket_id}")
}

const LOCK_TTL: Duration = Duration::from_secs(7_200);
const PENDING_TTL: Duration = Duration::from_secs(86_400);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] at_core::store::StoreError),
    #[error("malformed queue payload for session {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub dispatched: bool,
    pub parked: bool,
    pub replaced: bool,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// One-shot bootstrap: drains any items left in the legacy list-based
    /// queue into the sorted-set queue. No-op once the legacy key is empty
    /// or absent (spec §9 open question #2 — retained as a migration path
    /// rather than dropped, since it costs nothing to leave callable).
    pub async fn migrate_legacy_queue(&self) -> Result<usize> {
        let mut migrated = 0;
        loop {
            let Some(raw) = self.store.lpop(LEGACY_QUEUE_KEY).await? else {
                break;
            };
            let work: QueuedWork = match serde_json::from_str(&raw) {
                Ok(w) => w,
                Err(_) => {
                    warn!("dropping unparsable legacy queue entry during migration");
                    continue;
                }
            };
            self.queue_work(&work).await?;
            migrated += 1;
        }
        if migrated > 0 {
            info!(migrated, "migrated legacy queue entries into the sorted-set queue");
        }
        Ok(migrated)
    }

    // -- Global queue -----------------------------------------------------

    /// `hset(items, sid, JSON(w))` then `zadd(queue, score, sid)`.
    pub async fn queue_work(&self, work: &QueuedWork) -> Result<()> {
        let payload = serde_json::to_string(work).map_err(|_| SchedulerError::Malformed(work.session_id.clone()))?;
        self.store.hset(ITEMS_KEY, &work.session_id, &payload).await?;
        self.store.zadd(QUEUE_KEY, work.score(), &work.session_id).await?;
        Ok(())
    }

    /// `zrangebyscore(queue, -inf, +inf, LIMIT 0 limit)` then `hmget`;
    /// entries missing from the hash (raced-out) are silently dropped.
    pub async fn peek_work(&self, limit: i64) -> Result<Vec<QueuedWork>> {
        let ids = self.store.zrangebyscore(QUEUE_KEY, i64::MIN, i64::MAX, Some(limit)).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let values = self.store.hmget(ITEMS_KEY, &ids).await?;
        Ok(values
            .into_iter()
            .flatten()
            .filter_map(|raw| serde_json::from_str(&raw).ok())
            .collect())
    }

    /// Atomic claim: `setnx(claim:sid, workerId, ttl)`; on success removes
    /// the item from the hash/zset and returns it.
    pub async fn claim_work(&self, session_id: &str, worker_id: &str, ttl: Duration) -> Result<Option<QueuedWork>> {
        let claimed = self
            .store
            .claim_work(&claim_key(session_id), ITEMS_KEY, QUEUE_KEY, session_id, worker_id, ttl)
            .await?;
        match claimed {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub async fn release_claim(&self, session_id: &str) -> Result<bool> {
        Ok(self.store.delete(&claim_key(session_id)).await?)
    }

    pub async fn get_claim_owner(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.store.get(&claim_key(session_id)).await?)
    }

    pub async fn is_session_in_queue(&self, session_id: &str) -> Result<bool> {
        Ok(self.store.hget(ITEMS_KEY, session_id).await?.is_some())
    }

    pub async fn remove_from_queue(&self, session_id: &str) -> Result<()> {
        self.store.hdel(ITEMS_KEY, session_id).await?;
        self.store.zrem(QUEUE_KEY, session_id).await?;
        Ok(())
    }

    /// Release the claim, drop the priority floor by one (min 1), refresh
    /// `queued_at`, and re-queue. Used by orphan/zombie cleanup.
    pub async fn requeue_work(&self, mut work: QueuedWork, boost: i32) -> Result<()> {
        self.release_claim(&work.session_id).await?;
        work.priority = clamp_priority(work.priority - boost.max(0));
        work.queued_at = Utc::now();
        self.queue_work(&work).await
    }

    // -- Issue lock + pending bucket ---------------------------------------

    pub async fn acquire_lock(&self, ticket_id: &str, lock: &IssueLock) -> Result<bool> {
        let payload = serde_json::to_string(lock).map_err(|_| SchedulerError::Malformed(ticket_id.to_string()))?;
        Ok(self.store.setnx(&lock_key(ticket_id), &payload, Some(LOCK_TTL)).await?)
    }

    pub async fn get_lock(&self, ticket_id: &str) -> Result<Option<IssueLock>> {
        match self.store.get(&lock_key(ticket_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub async fn release_lock(&self, ticket_id: &str) -> Result<bool> {
        Ok(self.store.delete(&lock_key(ticket_id)).await?)
    }

    /// Acquire the ticket's issue lock and queue the work, or park it if the
    /// lock is already held (spec §4.5 `dispatchWork`).
    pub async fn dispatch_work(&self, work: QueuedWork) -> Result<DispatchOutcome> {
        let lock = IssueLock::new(work.session_id.clone(), work.work_type, work.ticket_identifier.clone());
        if self.acquire_lock(&work.ticket_id, &lock).await? {
            if let Err(e) = self.queue_work(&work).await {
                warn!(ticket_id = %work.ticket_id, error = %e, "queue_work failed after acquiring lock, releasing");
                let _ = self.release_lock(&work.ticket_id).await;
                return Err(e);
            }
            debug!(ticket_id = %work.ticket_id, session_id = %work.session_id, "lock acquired, work queued");
            return Ok(DispatchOutcome { dispatched: true, parked: false, replaced: false });
        }

        let replaced = self.park_work(&work.ticket_id, &work).await?;
        Ok(DispatchOutcome { dispatched: false, parked: true, replaced })
    }

    /// Park `work` in the ticket's pending bucket. Dedup key = work-type: a
    /// new arrival for the same work-type replaces the existing parked
    /// record (latest wins); returns whether a prior record was replaced.
    pub async fn park_work(&self, ticket_id: &str, work: &QueuedWork) -> Result<bool> {
        let dedup_key = format!("{:?}", work.work_type);
        let items_key = pending_items_key(ticket_id);
        let queue_key = pending_queue_key(ticket_id);

        let replaced = self.store.hget(&items_key, &dedup_key).await?.is_some();
        if replaced {
            self.store.zrem(&queue_key, &dedup_key).await?;
            self.store.hdel(&items_key, &dedup_key).await?;
        }

        let payload = serde_json::to_string(work).map_err(|_| SchedulerError::Malformed(work.session_id.clone()))?;
        self.store.hset(&items_key, &dedup_key, &payload).await?;
        self.store.zadd(&queue_key, work.score(), &dedup_key).await?;
        self.store.expire(&items_key, PENDING_TTL).await?;
        self.store.expire(&queue_key, PENDING_TTL).await?;

        if replaced {
            info!(ticket_id, work_type = %dedup_key, "parked work replaced an existing pending record");
        }
        Ok(replaced)
    }

    pub async fn pending_count(&self, ticket_id: &str) -> Result<i64> {
        Ok(self.store.zcard(&pending_queue_key(ticket_id)).await?)
    }

    /// Whether `ticket_id` has a parked record for `work_type`'s dedup key.
    /// Used by the cleanup sweep to tell a genuinely-dropped session apart
    /// from one that is merely waiting behind its ticket's lock.
    pub async fn is_parked(&self, ticket_id: &str, work_type: at_core::types::WorkType) -> Result<bool> {
        let dedup_key = format!("{:?}", work_type);
        Ok(self.store.hget(&pending_items_key(ticket_id), &dedup_key).await?.is_some())
    }

    /// Pop the highest-priority parked work for `ticket_id`, acquire the
    /// lock for its session, and queue it. If lock acquisition or queueing
    /// fails, re-park. Individual steps are atomic, not the whole sequence
    /// (see DESIGN.md's resolution of spec §9's open question #1).
    pub async fn promote_next_pending_work(&self, ticket_id: &str) -> Result<Option<QueuedWork>> {
        let Some((dedup_key, _score)) = self.store.zpopmin(&pending_queue_key(ticket_id)).await? else {
            return Ok(None);
        };
        let Some(raw) = self.store.hget(&pending_items_key(ticket_id), &dedup_key).await? else {
            return Ok(None);
        };
        self.store.hdel(&pending_items_key(ticket_id), &dedup_key).await?;

        let work: QueuedWork = match serde_json::from_str(&raw) {
            Ok(w) => w,
            Err(_) => {
                warn!(ticket_id, "dropping unparsable pending work during promotion");
                return Ok(None);
            }
        };

        let lock = IssueLock::new(work.session_id.clone(), work.work_type, work.ticket_identifier.clone());
        if !self.acquire_lock(ticket_id, &lock).await? {
            warn!(ticket_id, session_id = %work.session_id, "promotion failed to acquire lock, re-parking");
            self.park_work(ticket_id, &work).await?;
            return Ok(None);
        }

        if let Err(e) = self.queue_work(&work).await {
            warn!(ticket_id, error = %e, "promotion failed to queue work, re-parking");
            let _ = self.release_lock(ticket_id).await;
            self.park_work(ticket_id, &work).await?;
            return Ok(None);
        }

        info!(ticket_id, session_id = %work.session_id, "promoted pending work");
        Ok(Some(work))
    }
}
