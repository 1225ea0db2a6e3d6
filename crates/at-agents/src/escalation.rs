//! Escalation tracker (spec §4.7) — accumulates per-ticket verify-phase
//! failure history and derives the pure, monotonically non-decreasing
//! escalation strategy from the cycle count.

use std::sync::Arc;

use at_core::store::Store;
use at_core::types::{EscalationPhase, EscalationRecord, EscalationStrategy, PhaseAttempt, WorkType};
use chrono::Utc;

fn escalation_key(ticket_id: &str) -> String {
    format!("escalation:{ticket_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("store error: {0}")]
    Store(#[from] at_core::store::StoreError),
}

pub type Result<T> = std::result::Result<T, EscalationError>;

fn escalation_phase_for(work_type: WorkType) -> Option<EscalationPhase> {
    match work_type {
        WorkType::Qa | WorkType::QaCoordination => Some(EscalationPhase::Qa),
        WorkType::Acceptance | WorkType::AcceptanceCoordination => Some(EscalationPhase::Acceptance),
        WorkType::Refinement => Some(EscalationPhase::Refinement),
        WorkType::Development | WorkType::Inflight => Some(EscalationPhase::Development),
        _ => None,
    }
}

pub struct EscalationTracker {
    store: Arc<dyn Store>,
}

impl EscalationTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, ticket_id: &str) -> Result<Option<EscalationRecord>> {
        match self.store.get(&escalation_key(ticket_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub async fn strategy(&self, ticket_id: &str) -> Result<EscalationStrategy> {
        Ok(self
            .get(ticket_id)
            .await?
            .map(|r| r.strategy())
            .unwrap_or(EscalationStrategy::Normal))
    }

    async fn save(&self, record: &EscalationRecord) -> Result<()> {
        let payload = serde_json::to_string(record).expect("EscalationRecord serializes");
        self.store.set(&escalation_key(&record.ticket_id), &payload, None).await?;
        Ok(())
    }

    /// Runs when a verify phase (qa, acceptance, or their coordination
    /// variants) completes with result=failed or unknown-failed.
    /// `reason` is appended to the cycle-marked failure summary.
    pub async fn increment_cycle_count(
        &self,
        ticket_id: &str,
        work_type: WorkType,
        session_id: &str,
        cost_usd: f64,
        reason: &str,
    ) -> Result<EscalationRecord> {
        let mut record = self.get(ticket_id).await?.unwrap_or_else(|| EscalationRecord::new(ticket_id));
        record.cycle_count += 1;

        if let Some(phase) = escalation_phase_for(work_type) {
            record.attempts.push(PhaseAttempt {
                phase,
                session_id: session_id.to_string(),
                cost_usd,
                timestamp: Utc::now(),
            });
        }

        if !record.failure_summary.is_empty() {
            record.failure_summary.push('\n');
        }
        record.failure_summary.push_str(&format!("Cycle {}: {}", record.cycle_count, reason));

        self.save(&record).await?;
        Ok(record)
    }

    /// Cleared on an acceptance-pass path, allowing the ticket to resume
    /// normal automated dispatch.
    pub async fn clear(&self, ticket_id: &str) -> Result<()> {
        self.store.delete(&escalation_key(ticket_id)).await?;
        Ok(())
    }

    /// Title for the human-review blocker issue created once `cycle_count`
    /// reaches the escalate-human threshold.
    pub fn blocker_title(&self, ticket_identifier: &str, cycle_count: u32) -> String {
        format!("Human review needed: {ticket_identifier} failed {cycle_count} automated cycles")
    }

    /// Comment body: accumulated failure summary plus total cost across all
    /// recorded phase attempts.
    pub fn blocker_comment(&self, record: &EscalationRecord) -> String {
        format!(
            "Circuit Breaker: Human Intervention Required\n\n{}\n\nTotal cost: ${:.4}",
            record.failure_summary,
            record.total_cost_usd()
        )
    }
}
