//! Orphan / zombie reconciliation sweep (spec §4.9).
//!
//! Four independent passes over store state that can drift out of sync with
//! reality after a worker crash, a process restart mid-write, or a lock
//! holder that finished without releasing: orphaned claimed/running
//! sessions, zombie pending sessions, pending buckets behind an
//! already-expired lock, and locks whose holder is long gone with idle
//! capacity waiting. Grounded on `patrol.rs`'s periodic-scan-and-report
//! shape, generalized from its in-memory `CacheDb` scan to the store-backed
//! [`Scheduler`]/[`WorkerRegistry`].
//!
//! Debounced to at most once per 60 s via a store-backed guard key, since
//! the daemon's periodic loop and opportunistic write-path triggers can both
//! want to run it at the same time.

use std::sync::Arc;
use std::time::Duration;

use at_core::session_store::SessionStore;
use at_core::store::Store;
use at_core::types::{clamp_priority, QueuedWork, Session, SessionStatus};
use chrono::Utc;
use tracing::{info, warn};

use crate::scheduler::Scheduler;
use crate::worker_registry::WorkerRegistry;

const DEBOUNCE_KEY: &str = "cleanup:debounce";
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(60);
const ORPHAN_GRACE: chrono::Duration = chrono::Duration::seconds(120);
const ZOMBIE_PENDING_GRACE: chrono::Duration = chrono::Duration::minutes(5);
/// Spec §2.3/§6: a worker missing a heartbeat for this long is no longer in
/// the active set, independent of whether its store record has expired yet.
const HEARTBEAT_TIMEOUT: chrono::Duration = chrono::Duration::seconds(90);
const REQUEUE_BOOST: i32 = 1;

const SESSION_KEY_PREFIX: &str = "agent:session:";
const PENDING_ITEMS_PREFIX: &str = "issue:pending:items:";
const LOCK_PREFIX: &str = "issue:lock:";
/// Spec §4.9 scenario 4: worktree paths found on dead workers are recorded
/// here for the worker host to garbage-collect locally; the control plane
/// never removes them itself.
const WORKTREE_CLEANUP_SET_KEY: &str = "worktree:cleanup-pending";

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("store error: {0}")]
    Store(#[from] at_core::store::StoreError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] crate::scheduler::SchedulerError),
    #[error("worker registry error: {0}")]
    WorkerRegistry(#[from] crate::worker_registry::WorkerRegistryError),
}

pub type Result<T> = std::result::Result<T, CleanupError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub orphaned_sessions: usize,
    pub zombie_pending: usize,
    pub promoted_expired_locks: usize,
    pub released_stale_locks: usize,
}

impl CleanupReport {
    fn is_empty(&self) -> bool {
        *self == CleanupReport::default()
    }
}

pub struct CleanupSweep {
    store: Arc<dyn Store>,
    scheduler: Arc<Scheduler>,
    registry: Arc<WorkerRegistry>,
    sessions: SessionStore,
}

impl CleanupSweep {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<Scheduler>, registry: Arc<WorkerRegistry>) -> Self {
        let sessions = SessionStore::new(store.clone());
        Self { store, scheduler, registry, sessions }
    }

    /// Runs the sweep only if no caller has run one within the debounce
    /// window. Returns `None` when skipped.
    pub async fn run_debounced(&self) -> Result<Option<CleanupReport>> {
        if !self.store.setnx(DEBOUNCE_KEY, "1", Some(DEBOUNCE_WINDOW)).await? {
            return Ok(None);
        }
        Ok(Some(self.run().await?))
    }

    /// Unconditional sweep. The four passes are independent; a failure in
    /// one does not block the others from being attempted on the next call.
    pub async fn run(&self) -> Result<CleanupReport> {
        let report = CleanupReport {
            orphaned_sessions: self.reap_orphaned_sessions().await?,
            zombie_pending: self.reap_zombie_pending().await?,
            promoted_expired_locks: self.promote_expired_locks().await?,
            released_stale_locks: self.release_stale_locks().await?,
        };
        if !report.is_empty() {
            info!(
                orphaned = report.orphaned_sessions,
                zombies = report.zombie_pending,
                promoted = report.promoted_expired_locks,
                released = report.released_stale_locks,
                "cleanup sweep reconciled stale state"
            );
        }
        Ok(report)
    }

    async fn all_session_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .keys(SESSION_KEY_PREFIX)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(SESSION_KEY_PREFIX).map(str::to_string))
            .collect())
    }

    /// Claimed/running sessions whose worker has vanished — absent from the
    /// registry entirely, or present but no longer in the active set
    /// (heartbeat older than [`HEARTBEAT_TIMEOUT`]) — once past the grace
    /// window.
    async fn reap_orphaned_sessions(&self) -> Result<usize> {
        let now = Utc::now();
        let mut reaped = 0;
        for sid in self.all_session_ids().await? {
            let Some(session) = self.sessions.load(&sid).await? else { continue };
            if !matches!(session.status, SessionStatus::Claimed | SessionStatus::Running) {
                continue;
            }
            if now.signed_duration_since(session.updated_at) <= ORPHAN_GRACE {
                continue;
            }
            let worker_gone = match &session.worker_id {
                None => true,
                Some(wid) => self
                    .registry
                    .get(wid)
                    .await?
                    .map_or(true, |w| !w.is_alive(now, HEARTBEAT_TIMEOUT)),
            };
            if !worker_gone {
                continue;
            }
            warn!(session_id = %sid, worker_id = ?session.worker_id, "reaping orphaned session");
            if let Some(path) = &session.working_tree_path {
                self.store.sadd(WORKTREE_CLEANUP_SET_KEY, path).await?;
            }
            self.requeue_self_locked(session).await?;
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Pending sessions that fell out of both the global queue and their
    /// ticket's pending bucket — a crash between the status write and the
    /// follow-up dispatch would leave one like this.
    async fn reap_zombie_pending(&self) -> Result<usize> {
        let now = Utc::now();
        let mut reaped = 0;
        for sid in self.all_session_ids().await? {
            let Some(session) = self.sessions.load(&sid).await? else { continue };
            if session.status != SessionStatus::Pending {
                continue;
            }
            if now.signed_duration_since(session.updated_at) <= ZOMBIE_PENDING_GRACE {
                continue;
            }
            if self.scheduler.is_session_in_queue(&sid).await? {
                continue;
            }
            if self.scheduler.is_parked(&session.ticket_id, session.work_type).await? {
                continue;
            }
            warn!(session_id = %sid, ticket_id = %session.ticket_id, "reaping zombie pending session");
            self.redispatch(&session).await?;
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Orphan recovery: the session already holds its ticket's lock, so
    /// re-entry goes straight back onto the global queue (`requeue_work`)
    /// rather than through `dispatch_work`'s acquire-or-park path, which
    /// would see the lock as held and park the session behind itself.
    async fn requeue_self_locked(&self, mut session: Session) -> Result<()> {
        session.reset_for_requeue();
        let work = QueuedWork::new(
            session.id.clone(),
            session.ticket_id.clone(),
            session.ticket_identifier.clone(),
            session.priority,
            session.work_type,
            session.organisation_id.clone(),
        );
        self.sessions.save(&session).await?;
        self.scheduler.requeue_work(work, REQUEUE_BOOST).await?;
        Ok(())
    }

    /// Zombie-pending recovery: the lock's fate is unknown (it may already
    /// be released, or still point at this very session), so go through the
    /// normal acquire-or-park path rather than assuming ownership.
    async fn redispatch(&self, session: &Session) -> Result<()> {
        let mut work = QueuedWork::new(
            session.id.clone(),
            session.ticket_id.clone(),
            session.ticket_identifier.clone(),
            clamp_priority(session.priority - REQUEUE_BOOST),
            session.work_type,
            session.organisation_id.clone(),
        );
        work.prompt = session.prompt.clone();
        self.scheduler.dispatch_work(work).await?;
        Ok(())
    }

    /// Pending buckets whose ticket lock has lapsed (TTL expiry, no
    /// explicit release) get their highest-priority entry promoted.
    async fn promote_expired_locks(&self) -> Result<usize> {
        let mut promoted = 0;
        for key in self.store.keys(PENDING_ITEMS_PREFIX).await? {
            let Some(ticket_id) = key.strip_prefix(PENDING_ITEMS_PREFIX) else { continue };
            if self.scheduler.get_lock(ticket_id).await?.is_some() {
                continue; // lock still held, nothing to promote yet
            }
            if self.scheduler.promote_next_pending_work(ticket_id).await?.is_some() {
                info!(ticket_id, "promoted pending work after lock expiry");
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Locks whose holder session is terminal or gone entirely get released
    /// and their pending bucket promoted, but only when at least one active
    /// worker actually has spare capacity to pick the promoted work up —
    /// releasing into a fully-saturated fleet just thrashes the lock.
    async fn release_stale_locks(&self) -> Result<usize> {
        if !self.any_worker_has_spare_capacity().await? {
            return Ok(0);
        }
        let mut released = 0;
        for key in self.store.keys(LOCK_PREFIX).await? {
            let Some(ticket_id) = key.strip_prefix(LOCK_PREFIX) else { continue };
            let Some(lock) = self.scheduler.get_lock(ticket_id).await? else { continue };
            let holder_gone = match self.sessions.load(&lock.session_id).await? {
                Some(s) => s.status.is_terminal(),
                None => true,
            };
            if !holder_gone {
                continue;
            }
            self.scheduler.release_lock(ticket_id).await?;
            info!(ticket_id, session_id = %lock.session_id, "released stale lock, holder terminal or gone");
            released += 1;
            if self.scheduler.promote_next_pending_work(ticket_id).await?.is_some() {
                info!(ticket_id, "promoted pending work after stale-lock release");
            }
        }
        Ok(released)
    }

    async fn any_worker_has_spare_capacity(&self) -> Result<bool> {
        for worker_id in self.registry.all_worker_ids().await? {
            let (capacity, in_use) = self.registry.total_capacity(&worker_id).await?;
            if (in_use as u32) < capacity {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use at_core::store::MemoryStore;
    use at_core::types::{Worker, WorkType};

    fn sweep() -> (CleanupSweep, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let scheduler = Arc::new(Scheduler::new(store.clone()));
        let registry = Arc::new(WorkerRegistry::new(store.clone()));
        (CleanupSweep::new(store.clone(), scheduler, registry), store)
    }

    async fn stash_session(store: &Arc<dyn Store>, session: Session) -> Session {
        let sessions = SessionStore::new(store.clone());
        sessions.save(&session).await.unwrap();
        session
    }

    #[tokio::test]
    async fn run_debounced_skips_second_call_within_window() {
        let (sweep, _store) = sweep();
        assert!(sweep.run_debounced().await.unwrap().is_some());
        assert!(sweep.run_debounced().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphaned_session_with_no_worker_is_requeued() {
        let (sweep, store) = sweep();
        let sessions = SessionStore::new(store.clone());

        let mut session = Session::new("s1", "t1", "T-1", WorkType::Development, "org1", 3);
        session.status = SessionStatus::Running;
        session.updated_at = Utc::now() - chrono::Duration::seconds(200);
        sessions.save(&session).await.unwrap();

        let report = sweep.run().await.unwrap();
        assert_eq!(report.orphaned_sessions, 1);

        let reloaded = sessions.load("s1").await.unwrap().unwrap();
        assert_eq!(reloaded.status, SessionStatus::Pending);
        assert!(reloaded.worker_id.is_none());
    }

    #[tokio::test]
    async fn orphaned_session_with_dead_worker_record_is_requeued() {
        let (sweep, store) = sweep();
        let sessions = SessionStore::new(store.clone());

        let mut session = Session::new("s1", "t1", "T-1", WorkType::Development, "org1", 3);
        session.status = SessionStatus::Claimed;
        session.worker_id = Some("ghost-worker".into());
        session.updated_at = Utc::now() - chrono::Duration::seconds(300);
        sessions.save(&session).await.unwrap();

        let report = sweep.run().await.unwrap();
        assert_eq!(report.orphaned_sessions, 1);
    }

    #[tokio::test]
    async fn orphaned_session_with_stale_heartbeat_is_requeued() {
        let (sweep, store) = sweep();
        let registry = WorkerRegistry::new(store.clone());
        let mut worker = Worker::new("w1", "host1", 4);
        worker.last_heartbeat = Utc::now() - chrono::Duration::seconds(200);
        registry.register(&worker).await.unwrap();

        let mut session = Session::new("s1", "t1", "T-1", WorkType::Development, "org1", 3);
        session.status = SessionStatus::Running;
        session.worker_id = Some("w1".into());
        session.updated_at = Utc::now() - chrono::Duration::seconds(300);
        stash_session(&store, session).await;

        let report = sweep.run().await.unwrap();
        assert_eq!(report.orphaned_sessions, 1);
    }

    #[tokio::test]
    async fn orphaned_session_records_worktree_path_for_cleanup() {
        let (sweep, store) = sweep();

        let mut session = Session::new("s1", "t1", "T-1", WorkType::Development, "org1", 3);
        session.status = SessionStatus::Running;
        session.working_tree_path = Some("/worktrees/T-1-DEV".into());
        session.updated_at = Utc::now() - chrono::Duration::seconds(300);
        stash_session(&store, session).await;

        sweep.run().await.unwrap();

        let pending = store.smembers(WORKTREE_CLEANUP_SET_KEY).await.unwrap();
        assert_eq!(pending, vec!["/worktrees/T-1-DEV".to_string()]);
    }

    #[tokio::test]
    async fn fresh_claimed_session_with_live_worker_is_untouched() {
        let (sweep, store) = sweep();
        let registry = WorkerRegistry::new(store.clone());
        registry.register(&Worker::new("w1", "host1", 4)).await.unwrap();

        let mut session = Session::new("s1", "t1", "T-1", WorkType::Development, "org1", 3);
        session.status = SessionStatus::Running;
        session.worker_id = Some("w1".into());
        stash_session(&store, session).await;

        let report = sweep.run().await.unwrap();
        assert_eq!(report.orphaned_sessions, 0);
    }

    #[tokio::test]
    async fn zombie_pending_not_in_queue_or_parked_is_redispatched() {
        let (sweep, store) = sweep();
        let mut session = Session::new("s1", "t1", "T-1", WorkType::Development, "org1", 3);
        session.updated_at = Utc::now() - chrono::Duration::minutes(10);
        stash_session(&store, session).await;

        let report = sweep.run().await.unwrap();
        assert_eq!(report.zombie_pending, 1);

        let scheduler = Scheduler::new(store.clone());
        assert!(scheduler.is_session_in_queue("s1").await.unwrap());
    }

    #[tokio::test]
    async fn pending_session_still_in_queue_is_not_a_zombie() {
        let (sweep, store) = sweep();
        let scheduler = Scheduler::new(store.clone());
        let mut session = Session::new("s1", "t1", "T-1", WorkType::Development, "org1", 3);
        session.updated_at = Utc::now() - chrono::Duration::minutes(10);
        stash_session(&store, session.clone()).await;
        scheduler
            .queue_work(&QueuedWork::new("s1", "t1", "T-1", 3, WorkType::Development, "org1"))
            .await
            .unwrap();

        let report = sweep.run().await.unwrap();
        assert_eq!(report.zombie_pending, 0);
    }

    #[tokio::test]
    async fn expired_lock_with_pending_work_gets_promoted() {
        let (sweep, store) = sweep();
        let scheduler = Scheduler::new(store.clone());
        scheduler
            .dispatch_work(QueuedWork::new("s1", "t1", "T-1", 3, WorkType::Development, "org1"))
            .await
            .unwrap();
        scheduler
            .dispatch_work(QueuedWork::new("s2", "t1", "T-1", 3, WorkType::Qa, "org1"))
            .await
            .unwrap();
        scheduler.release_lock("t1").await.unwrap(); // simulate TTL lapse

        let report = sweep.run().await.unwrap();
        assert_eq!(report.promoted_expired_locks, 1);
        assert!(scheduler.is_session_in_queue("s2").await.unwrap());
    }

    #[tokio::test]
    async fn stale_lock_is_released_only_with_spare_capacity() {
        let (sweep, store) = sweep();
        let scheduler = Scheduler::new(store.clone());
        let sessions = SessionStore::new(store.clone());

        let mut holder = Session::new("s1", "t1", "T-1", WorkType::Development, "org1", 3);
        holder.status = SessionStatus::Completed;
        sessions.save(&holder).await.unwrap();
        scheduler
            .acquire_lock("t1", &at_core::types::IssueLock::new("s1", WorkType::Development, "T-1"))
            .await
            .unwrap();

        // No registered workers at all yet — no spare capacity, lock survives.
        let report = sweep.run().await.unwrap();
        assert_eq!(report.released_stale_locks, 0);
        assert!(scheduler.get_lock("t1").await.unwrap().is_some());

        let registry = WorkerRegistry::new(store.clone());
        registry.register(&Worker::new("w1", "host1", 4)).await.unwrap();

        let report = sweep.run().await.unwrap();
        assert_eq!(report.released_stale_locks, 1);
        assert!(scheduler.get_lock("t1").await.unwrap().is_none());
    }
}
