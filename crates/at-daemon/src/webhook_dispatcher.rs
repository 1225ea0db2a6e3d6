//! Webhook dispatcher (spec §4.6) — turns a validated, already-deserialized
//! tracker webhook event into at most one `dispatchWork` call.
//!
//! Deliberately excludes the HTTP route layer (header verification, body
//! parsing): callers hand this a [`WebhookEvent`] they already validated and
//! deserialized, whether that came from an HTTP edge or a test harness.

use std::sync::Arc;
use std::time::Duration;

use at_agents::escalation::EscalationTracker;
use at_core::store::Store;
use at_core::types::{EscalationStrategy, QueuedWork, WorkType};
use at_integrations::tracker::TrackerClient;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::scheduler::{DispatchOutcome, Scheduler};

const IDEMPOTENCY_MEMORY_TTL: Duration = Duration::from_secs(300);
const IDEMPOTENCY_STORE_TTL: Duration = Duration::from_secs(86_400);
const DEV_ACCEPTANCE_COOLDOWN: Duration = Duration::from_secs(10);
const QA_FAILED_COOLDOWN: Duration = Duration::from_secs(3_600);
const AGENT_WORKED_WINDOW: Duration = Duration::from_secs(7 * 86_400);

/// One of the three webhook event kinds the tracker can deliver.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    IssueUpdate {
        delivery_id: String,
        ticket_id: String,
        ticket_identifier: String,
        status_from: String,
        status_to: String,
        organisation_id: String,
    },
    Mention {
        delivery_id: String,
        ticket_id: String,
        ticket_identifier: String,
        text: String,
        organisation_id: String,
    },
    AgentSession {
        delivery_id: String,
        ticket_id: String,
        ticket_identifier: String,
        session_id: String,
        organisation_id: String,
    },
}

impl WebhookEvent {
    fn delivery_id(&self) -> &str {
        match self {
            WebhookEvent::IssueUpdate { delivery_id, .. }
            | WebhookEvent::Mention { delivery_id, .. }
            | WebhookEvent::AgentSession { delivery_id, .. } => delivery_id,
        }
    }

    fn ticket_id(&self) -> &str {
        match self {
            WebhookEvent::IssueUpdate { ticket_id, .. }
            | WebhookEvent::Mention { ticket_id, .. }
            | WebhookEvent::AgentSession { ticket_id, .. } => ticket_id,
        }
    }

    fn ticket_identifier(&self) -> &str {
        match self {
            WebhookEvent::IssueUpdate { ticket_identifier, .. }
            | WebhookEvent::Mention { ticket_identifier, .. }
            | WebhookEvent::AgentSession { ticket_identifier, .. } => ticket_identifier,
        }
    }

    fn organisation_id(&self) -> &str {
        match self {
            WebhookEvent::IssueUpdate { organisation_id, .. }
            | WebhookEvent::Mention { organisation_id, .. }
            | WebhookEvent::AgentSession { organisation_id, .. } => organisation_id,
        }
    }
}

/// Polymorphic mapping from issue status + event kind + mention context to a
/// work-type. The distilled spec's §6 enumerates the work-type↔suffix table
/// but not an exhaustive tracker-status table, so this mirrors the common
/// "Backlog/Todo → Started" development trigger plus explicit QA/acceptance
/// mention commands; see DESIGN.md for this resolution.
pub fn classify_work_type(event: &WebhookEvent) -> Option<WorkType> {
    match event {
        WebhookEvent::IssueUpdate { status_to, .. } => match status_to.as_str() {
            "Started" | "InProgress" => Some(WorkType::Development),
            "InReview" | "ReadyForQa" => Some(WorkType::Qa),
            "ReadyForAcceptance" => Some(WorkType::Acceptance),
            "Backlog" => Some(WorkType::BacklogCreation),
            _ => None,
        },
        WebhookEvent::Mention { text, .. } => {
            let lower = text.to_lowercase();
            if lower.contains("qa") {
                Some(WorkType::QaCoordination)
            } else if lower.contains("accept") {
                Some(WorkType::AcceptanceCoordination)
            } else if lower.contains("research") {
                Some(WorkType::Research)
            } else {
                Some(WorkType::Coordination)
            }
        }
        WebhookEvent::AgentSession { .. } => Some(WorkType::Inflight),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] at_core::store::StoreError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] crate::scheduler::SchedulerError),
    #[error("escalation error: {0}")]
    Escalation(#[from] at_agents::escalation::EscalationError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    AlreadyProcessed,
    NoWorkType,
    Cooldown,
    EscalatedHuman,
    TrackerWorkedGateMissed,
    Dispatched(DispatchOutcome),
}

/// Ticket was marked agent-worked within this window — gates auto-QA and
/// auto-acceptance triggers (spec §4.6 "tracker-worked gating").
fn agent_worked_key(ticket_id: &str) -> String {
    format!("agent:worked:{ticket_id}")
}
fn qa_failed_key(ticket_id: &str) -> String {
    format!("qa:failed:{ticket_id}")
}
fn dev_queued_key(ticket_id: &str) -> String {
    format!("agent:dev-queued:{ticket_id}")
}
fn acceptance_queued_key(ticket_id: &str) -> String {
    format!("agent:acceptance-queued:{ticket_id}")
}
fn webhook_processed_key(key: &str) -> String {
    format!("webhook:processed:{key}")
}

/// Guards against re-creating the human-review blocker issue on every
/// subsequent webhook while a ticket remains in `escalate-human` (cleared
/// together with the escalation record on an acceptance pass).
fn blocker_created_key(ticket_id: &str) -> String {
    format!("escalation:blocker-created:{ticket_id}")
}

pub struct WebhookDispatcher {
    store: Arc<dyn Store>,
    scheduler: Arc<Scheduler>,
    escalation: Arc<EscalationTracker>,
    tracker: Arc<dyn TrackerClient>,
    memory_seen: DashMap<String, std::time::Instant>,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: Arc<Scheduler>,
        escalation: Arc<EscalationTracker>,
        tracker: Arc<dyn TrackerClient>,
    ) -> Self {
        Self {
            store,
            scheduler,
            escalation,
            tracker,
            memory_seen: DashMap::new(),
        }
    }

    /// Creates the human-review blocker issue and posts the escalation
    /// comment on the source ticket (spec §4.7): once per ticket's trip into
    /// `escalate-human`, guarded by a store key cleared alongside the
    /// escalation record.
    async fn escalate_to_human(&self, event: &WebhookEvent, record: &at_core::types::EscalationRecord) -> Result<()> {
        let key = blocker_created_key(event.ticket_id());
        if self.store.exists(&key).await? {
            return Ok(());
        }
        let title = self.escalation.blocker_title(event.ticket_identifier(), record.cycle_count);
        let comment = self.escalation.blocker_comment(record);
        if let Err(e) = self
            .tracker
            .create_issue(event.organisation_id(), event.organisation_id(), &title, &comment)
            .await
        {
            warn!(ticket_id = %event.ticket_id(), error = %e, "failed to create human-review blocker issue");
        }
        if let Err(e) = self.tracker.create_comment(event.organisation_id(), event.ticket_id(), &comment).await {
            warn!(ticket_id = %event.ticket_id(), error = %e, "failed to post escalation comment");
        }
        self.store.set(&key, "1", None).await?;
        Ok(())
    }

    fn idempotency_key(event: &WebhookEvent) -> String {
        format!("wh:{}", event.delivery_id())
    }

    async fn is_processed(&self, key: &str) -> Result<bool> {
        if let Some(entry) = self.memory_seen.get(key) {
            if entry.elapsed() < IDEMPOTENCY_MEMORY_TTL {
                return Ok(true);
            }
        }
        let seen = self.store.exists(&webhook_processed_key(key)).await?;
        if seen {
            self.memory_seen.insert(key.to_string(), std::time::Instant::now());
        }
        Ok(seen)
    }

    async fn mark_processed(&self, key: &str) -> Result<()> {
        self.memory_seen.insert(key.to_string(), std::time::Instant::now());
        self.store
            .set(&webhook_processed_key(key), &chrono::Utc::now().to_rfc3339(), Some(IDEMPOTENCY_STORE_TTL))
            .await?;
        Ok(())
    }

    /// Rollback path for a dispatch that failed after the idempotency mark
    /// was set (e.g. a subsequent spawn failure upstream), so a retried
    /// delivery is not silently swallowed.
    pub async fn unmark_processed(&self, key: &str) -> Result<()> {
        self.memory_seen.remove(key);
        self.store.delete(&webhook_processed_key(key)).await?;
        Ok(())
    }

    async fn in_cooldown(&self, work_type: WorkType, ticket_id: &str) -> Result<bool> {
        match work_type {
            WorkType::Development => Ok(self.store.exists(&dev_queued_key(ticket_id)).await?),
            WorkType::Acceptance | WorkType::AcceptanceCoordination => {
                Ok(self.store.exists(&acceptance_queued_key(ticket_id)).await?)
            }
            WorkType::Qa | WorkType::QaCoordination => Ok(self.store.exists(&qa_failed_key(ticket_id)).await?),
            _ => Ok(false),
        }
    }

    async fn arm_cooldown(&self, work_type: WorkType, ticket_id: &str) -> Result<()> {
        match work_type {
            WorkType::Development => {
                self.store
                    .set(&dev_queued_key(ticket_id), "1", Some(DEV_ACCEPTANCE_COOLDOWN))
                    .await?;
            }
            WorkType::Acceptance | WorkType::AcceptanceCoordination => {
                self.store
                    .set(&acceptance_queued_key(ticket_id), "1", Some(DEV_ACCEPTANCE_COOLDOWN))
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Call on a QA result=failed to arm the 1h re-trigger suppression.
    pub async fn mark_qa_failed(&self, ticket_id: &str) -> Result<()> {
        self.store.set(&qa_failed_key(ticket_id), "1", Some(QA_FAILED_COOLDOWN)).await?;
        Ok(())
    }

    pub async fn mark_agent_worked(&self, ticket_id: &str) -> Result<()> {
        self.store
            .set(&agent_worked_key(ticket_id), "1", Some(AGENT_WORKED_WINDOW))
            .await?;
        Ok(())
    }

    async fn tracker_worked_recently(&self, ticket_id: &str) -> Result<bool> {
        Ok(self.store.exists(&agent_worked_key(ticket_id)).await?)
    }

    pub async fn dispatch(&self, event: WebhookEvent, priority: i32) -> Result<DispatchResult> {
        let idem_key = Self::idempotency_key(&event);
        if self.is_processed(&idem_key).await? {
            info!(ticket_id = %event.ticket_id(), "webhook already processed, skipping");
            return Ok(DispatchResult::AlreadyProcessed);
        }

        let Some(work_type) = classify_work_type(&event) else {
            return Ok(DispatchResult::NoWorkType);
        };

        if matches!(
            work_type,
            WorkType::Qa | WorkType::QaCoordination | WorkType::Acceptance | WorkType::AcceptanceCoordination
        ) && !self.tracker_worked_recently(event.ticket_id()).await?
        {
            return Ok(DispatchResult::TrackerWorkedGateMissed);
        }

        if self.in_cooldown(work_type, event.ticket_id()).await? {
            return Ok(DispatchResult::Cooldown);
        }

        if let Some(record) = self.escalation.get(event.ticket_id()).await? {
            if record.strategy() == EscalationStrategy::EscalateHuman {
                warn!(ticket_id = %event.ticket_id(), "escalation strategy is escalate-human, refusing dispatch");
                self.escalate_to_human(&event, &record).await?;
                return Ok(DispatchResult::EscalatedHuman);
            }
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let work = QueuedWork::new(
            session_id,
            event.ticket_id().to_string(),
            event.ticket_identifier().to_string(),
            priority,
            work_type,
            event.organisation_id().to_string(),
        );

        let outcome = match self.scheduler.dispatch_work(work).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.unmark_processed(&idem_key).await?;
                return Err(e.into());
            }
        };

        self.arm_cooldown(work_type, event.ticket_id()).await?;
        self.mark_processed(&idem_key).await?;
        Ok(DispatchResult::Dispatched(outcome))
    }
}
