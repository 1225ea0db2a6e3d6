use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// WorkType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkType {
    Research,
    BacklogCreation,
    Development,
    Inflight,
    Coordination,
    Qa,
    Acceptance,
    Refinement,
    QaCoordination,
    AcceptanceCoordination,
}

impl WorkType {
    /// Worktree-identifier suffix used in branch/directory names and env vars.
    pub fn suffix(&self) -> &'static str {
        match self {
            WorkType::Research => "RES",
            WorkType::BacklogCreation => "BC",
            WorkType::Development => "DEV",
            WorkType::Inflight => "INF",
            WorkType::Coordination => "COORD",
            WorkType::Qa => "QA",
            WorkType::Acceptance => "AC",
            WorkType::Refinement => "REF",
            WorkType::QaCoordination => "QA-COORD",
            WorkType::AcceptanceCoordination => "AC-COORD",
        }
    }

    /// Whether this work type's completion disposition is parsed from a
    /// `<!-- WORK_RESULT:passed|failed -->` marker rather than inferred.
    pub fn is_result_sensitive(&self) -> bool {
        matches!(
            self,
            WorkType::Qa
                | WorkType::Acceptance
                | WorkType::QaCoordination
                | WorkType::AcceptanceCoordination
        )
    }

    /// Whether a verify-phase failure/unknown on this work type should feed
    /// the escalation tracker's cycle counter.
    pub fn feeds_escalation(&self) -> bool {
        self.is_result_sensitive()
    }
}

// ---------------------------------------------------------------------------
// SessionStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Claimed,
    Running,
    Finalizing,
    Completed,
    Failed,
    Stopped,
    Incomplete,
}

impl SessionStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `resetSessionForRequeue` is the one exception to forward-only
    /// transitions: it takes a session from `claimed` or `running` back to
    /// `pending` for the same session-id (crash/orphan recovery).
    pub fn can_transition_to(&self, target: &SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, target),
            (Pending, Claimed)
                | (Claimed, Running)
                | (Claimed, Pending) // resetSessionForRequeue
                | (Running, Pending) // resetSessionForRequeue
                | (Running, Finalizing)
                | (Finalizing, Completed)
                | (Finalizing, Failed)
                | (Finalizing, Stopped)
                | (Finalizing, Incomplete)
                | (Running, Stopped)
                | (Claimed, Stopped)
        )
    }

    /// Terminal statuses are absorbing: no further transitions leave them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Stopped
                | SessionStatus::Incomplete
        )
    }

    /// Invariant: `status ∈ {claimed, running}` implies a non-null worker-id.
    pub fn requires_worker(&self) -> bool {
        matches!(self, SessionStatus::Claimed | SessionStatus::Running)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub ticket_id: String,
    pub ticket_identifier: String,
    pub work_type: WorkType,
    pub provider_session_id: Option<String>,
    pub working_tree_path: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    /// 1 (highest) through 5 (lowest); clamped to 1..=9 when queued.
    pub priority: i32,
    pub prompt: Option<String>,
    pub organisation_id: String,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        ticket_id: impl Into<String>,
        ticket_identifier: impl Into<String>,
        work_type: WorkType,
        organisation_id: impl Into<String>,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            ticket_id: ticket_id.into(),
            ticket_identifier: ticket_identifier.into(),
            work_type,
            provider_session_id: None,
            working_tree_path: None,
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            worker_id: None,
            priority,
            prompt: None,
            organisation_id: organisation_id.into(),
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    /// Clear worker assignment and return to `pending` for re-dispatch.
    /// The provider-session-id is intentionally NOT preserved: a
    /// crash-restart is assumed to have corrupted any in-flight state.
    pub fn reset_for_requeue(&mut self) {
        self.status = SessionStatus::Pending;
        self.worker_id = None;
        self.claimed_at = None;
        self.provider_session_id = None;
        self.updated_at = Utc::now();
    }

    pub fn transition(&mut self, target: SessionStatus) -> Result<(), String> {
        if !self.status.can_transition_to(&target) {
            return Err(format!(
                "session {} cannot transition from {:?} to {:?}",
                self.id, self.status, target
            ));
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn accumulate_cost(&mut self, cost_usd: f64, input_tokens: u64, output_tokens: u64) {
        self.cost_usd += cost_usd;
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// WorkerStatus / Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Draining,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub hostname: String,
    pub capacity: u32,
    /// Advisory mirror of `active_sessions.len()`; may be stale across
    /// re-registration. Callers MUST use the session-set size for capacity
    /// accounting, never this field.
    pub active_count: u32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerStatus,
    pub project_allowlist: Option<Vec<String>>,
    pub version: Option<String>,
}

impl Worker {
    pub fn new(worker_id: impl Into<String>, hostname: impl Into<String>, capacity: u32) -> Self {
        let now = Utc::now();
        Self {
            worker_id: worker_id.into(),
            hostname: hostname.into(),
            capacity,
            active_count: 0,
            registered_at: now,
            last_heartbeat: now,
            status: WorkerStatus::Active,
            project_allowlist: None,
            version: None,
        }
    }

    /// A worker is active only if its last heartbeat is within the timeout
    /// window. The boundary is half-open: exactly at the timeout the worker
    /// is already considered offline.
    pub fn is_alive(&self, now: DateTime<Utc>, heartbeat_timeout: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat) < heartbeat_timeout
    }
}

// ---------------------------------------------------------------------------
// QueuedWork
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedWork {
    pub session_id: String,
    pub ticket_id: String,
    pub ticket_identifier: String,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub prompt: Option<String>,
    pub provider_session_id: Option<String>,
    pub work_type: WorkType,
    pub source_session_id: Option<String>,
    pub organisation_id: String,
}

impl QueuedWork {
    pub fn new(
        session_id: impl Into<String>,
        ticket_id: impl Into<String>,
        ticket_identifier: impl Into<String>,
        priority: i32,
        work_type: WorkType,
        organisation_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            ticket_id: ticket_id.into(),
            ticket_identifier: ticket_identifier.into(),
            priority: clamp_priority(priority),
            queued_at: Utc::now(),
            prompt: None,
            provider_session_id: None,
            work_type,
            source_session_id: None,
            organisation_id: organisation_id.into(),
        }
    }

    /// Synthetic sort score: `clamp(priority,1..9)·10^13 + queuedAt` (epoch
    /// millis). Lower score wins; priority dominates time.
    pub fn score(&self) -> i64 {
        calculate_score(self.priority, self.queued_at)
    }
}

/// Priority clamp: 0 or negative becomes 1, anything above 9 becomes 9.
pub fn clamp_priority(priority: i32) -> i32 {
    priority.clamp(1, 9)
}

/// `calculateScore` — strictly increasing in (priority, queuedAt); priority
/// dominates time since it is multiplied by a factor larger than the
/// representable range of millisecond timestamps for the foreseeable future.
pub fn calculate_score(priority: i32, queued_at: DateTime<Utc>) -> i64 {
    const PRIORITY_FACTOR: i64 = 10_000_000_000_000; // 10^13
    (clamp_priority(priority) as i64) * PRIORITY_FACTOR + queued_at.timestamp_millis()
}

// ---------------------------------------------------------------------------
// IssueLock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueLock {
    pub session_id: String,
    pub work_type: WorkType,
    pub worker_id: Option<String>,
    pub locked_at: DateTime<Utc>,
    pub ticket_identifier: String,
}

impl IssueLock {
    pub fn new(
        session_id: impl Into<String>,
        work_type: WorkType,
        ticket_identifier: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            work_type,
            worker_id: None,
            locked_at: Utc::now(),
            ticket_identifier: ticket_identifier.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// PendingBucket entry (stored per ticket; the bucket itself lives in Store)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkedWork {
    pub dedup_key: String,
    pub work: QueuedWork,
}

// ---------------------------------------------------------------------------
// EscalationStrategy / EscalationRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStrategy {
    Normal,
    ContextEnriched,
    Decompose,
    EscalateHuman,
}

impl EscalationStrategy {
    /// `strategy(cycleCount) = strategyTable[min(cycleCount,4)]` — a pure,
    /// monotonically non-decreasing function of cycle-count.
    pub fn from_cycle_count(cycle_count: u32) -> Self {
        match cycle_count.min(4) {
            0 | 1 => EscalationStrategy::Normal,
            2 => EscalationStrategy::ContextEnriched,
            3 => EscalationStrategy::Decompose,
            _ => EscalationStrategy::EscalateHuman,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPhase {
    Development,
    Qa,
    Refinement,
    Acceptance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseAttempt {
    pub phase: EscalationPhase,
    pub session_id: String,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub ticket_id: String,
    pub cycle_count: u32,
    pub attempts: Vec<PhaseAttempt>,
    pub failure_summary: String,
}

impl EscalationRecord {
    pub fn new(ticket_id: impl Into<String>) -> Self {
        Self {
            ticket_id: ticket_id.into(),
            cycle_count: 0,
            attempts: Vec::new(),
            failure_summary: String::new(),
        }
    }

    pub fn strategy(&self) -> EscalationStrategy {
        EscalationStrategy::from_cycle_count(self.cycle_count)
    }

    /// Sum of `cost_usd` across all recorded phase attempts.
    pub fn total_cost_usd(&self) -> f64 {
        self.attempts.iter().map(|a| a.cost_usd).sum()
    }
}

// ---------------------------------------------------------------------------
// PendingPrompt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPrompt {
    pub id: String,
    pub session_id: String,
    pub prompt: String,
    pub user_metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl PendingPrompt {
    pub fn new(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            prompt: prompt.into(),
            user_metadata: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// TrackedIssue (escalation-dedup record)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedIssue {
    pub signature: String,
    pub tracker_id: String,
    pub identifier: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub session_count: u32,
    pub session_ids: Vec<String>,
}

/// Signature = SHA-256 of `pattern-type | lowercase first 100 chars of
/// title`, truncated to 16 hex chars.
pub fn tracked_issue_signature(pattern_type: &str, title: &str) -> String {
    use ring::digest;
    let truncated_title: String = title.to_lowercase().chars().take(100).collect();
    let input = format!("{pattern_type}|{truncated_title}");
    let digest = digest::digest(&digest::SHA256, input.as_bytes());
    let hex: String = digest.as_ref().iter().map(|b| format!("{b:02x}")).collect();
    hex.chars().take(16).collect()
}

// ---------------------------------------------------------------------------
// Result disposition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkResult {
    Passed,
    Failed,
    Unknown,
}

/// Parse the `<!-- WORK_RESULT:passed -->` / `<!-- WORK_RESULT:failed -->`
/// marker from an agent's final message. Absence of a marker is `Unknown`.
pub fn parse_work_result_marker(message: &str) -> WorkResult {
    if message.contains("<!-- WORK_RESULT:passed -->") {
        WorkResult::Passed
    } else if message.contains("<!-- WORK_RESULT:failed -->") {
        WorkResult::Failed
    } else {
        WorkResult::Unknown
    }
}
