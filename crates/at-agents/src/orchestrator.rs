//! Worker-side per-session supervisor (spec §4.8).
//!
//! Owns the whole lifecycle of one claimed session: scratch working-tree
//! creation, `.agent/` state bring-up, prompt selection, provider spawn,
//! cooperative event-stream pump, completion disposition, tracker status
//! transition, and working-tree teardown. One `SessionOrchestrator::run`
//! call drives exactly one session to a terminal state; the worker's poll
//! loop spawns one of these per claimed session, up to its capacity.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use at_core::config::{Config, OrchestratorConfig as OrchestratorSettings};
use at_core::session_store::SessionStore;
use at_core::store::Store;
use at_core::types::{
    parse_work_result_marker, QueuedWork, Session, SessionStatus, WorkResult, WorkType,
};
use at_core::worktree_manager::{WorktreeHandle, WorktreeManager, WorktreeManagerError};
use at_harness::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use at_integrations::tracker::{GraphQlTrackerClient, TrackerClient, TrackerError};
use at_session::session::{HeartbeatState, SupervisorStateDir, WorktreeState};

use crate::escalation::{EscalationError, EscalationTracker};
use crate::provider::{AgentEvent, AgentProvider, CliAgentProvider, Handle, ProviderError, SpawnConfig};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] at_core::store::StoreError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeManagerError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("escalation error: {0}")]
    Escalation(#[from] EscalationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent already running for session {0}")]
    AgentAlreadyRunning(String),
    #[error("max recovery attempts exhausted for session {0}")]
    MaxRecoveryAttempts(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Vendor auth vars stripped from the spawned agent's environment, regardless
/// of how they reached the worker process (spec §4.8 step 5).
const ENV_BLOCKLIST: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "LINEAR_API_KEY",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "DATADOG_API_KEY",
    "DD_API_KEY",
    "SLACK_BOT_TOKEN",
    "NPM_TOKEN",
    "VERCEL_TOKEN",
];

const COMMENT_CHUNK_CHARS: usize = 10_000;
const COMMENT_MAX_PARTS: usize = 10;
const COMMENT_PART_DELAY: Duration = Duration::from_millis(100);
const WATCHDOG_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

fn pr_url_regex(forge_host: &str) -> Regex {
    let escaped = regex::escape(forge_host);
    Regex::new(&format!(r"https://{escaped}/([^/\s]+)/([^/\s]+)/pull/(\d+)")).expect("valid PR URL regex")
}

/// Builtin per-work-type prompt used when no custom override or registry
/// template is configured (spec §4.8 step 4, tier 3).
fn builtin_prompt(work_type: WorkType, ticket_identifier: &str) -> String {
    match work_type {
        WorkType::Research => format!("Research the codebase context needed for {ticket_identifier} and summarize findings."),
        WorkType::BacklogCreation => format!("Draft a well-scoped backlog issue derived from {ticket_identifier}."),
        WorkType::Development | WorkType::Inflight => format!("Implement {ticket_identifier} end to end, including tests."),
        WorkType::Coordination => format!("Coordinate the next step for {ticket_identifier} based on the latest comment."),
        WorkType::Qa => format!("QA the implementation for {ticket_identifier}. End with a WORK_RESULT marker."),
        WorkType::Acceptance => format!("Perform acceptance review for {ticket_identifier}. End with a WORK_RESULT marker."),
        WorkType::Refinement => format!("Refine and tighten the spec/implementation for {ticket_identifier}."),
        WorkType::QaCoordination => format!("Coordinate QA follow-up for {ticket_identifier}. End with a WORK_RESULT marker."),
        WorkType::AcceptanceCoordination => {
            format!("Coordinate acceptance follow-up for {ticket_identifier}. End with a WORK_RESULT marker.")
        }
    }
}

/// Tool-related error-pattern classification used for in-stream
/// `error_during_execution` reporting (a narrower, immediate-response sibling
/// of the post-hoc log analyser's fuller rule set in spec §4.12).
fn classify_tool_error(message: &str) -> Option<&'static str> {
    let lower = message.to_lowercase();
    if lower.contains("enoent") || lower.contains("no such file") {
        Some("tool-issue")
    } else if lower.contains("permission denied") || lower.contains("eacces") {
        Some("permission")
    } else if lower.contains("timed out") || lower.contains("timeout") {
        Some("performance")
    } else if lower.contains("rate limit") || lower.contains("econnrefused") {
        Some("tool-misuse")
    } else {
        None
    }
}

/// Split a completion message into at most 10 chunks of at most 10 000
/// characters each (spec §4.8 step 8). Content beyond the tenth chunk is
/// dropped rather than silently truncating mid-chunk.
fn split_message(message: &str) -> Vec<String> {
    let chars: Vec<char> = message.chars().collect();
    chars
        .chunks(COMMENT_CHUNK_CHARS)
        .take(COMMENT_MAX_PARTS)
        .map(|c| c.iter().collect())
        .collect()
}

/// The spec §4.8 step 8 work-type × result → tracker-status table. An
/// unparseable result marker (`WorkResult::Unknown`) never transitions
/// status on a result-sensitive work type: the diagnostic comment in
/// `finish_result_sensitive` is the only user-visible effect.
fn next_tracker_status(work_type: WorkType, result: WorkResult) -> Option<&'static str> {
    match (work_type, result) {
        (_, WorkResult::Unknown) => None,
        (WorkType::Development | WorkType::Inflight | WorkType::Coordination, _) => Some("Finished"),
        (WorkType::Qa | WorkType::QaCoordination, WorkResult::Passed) => Some("Delivered"),
        (WorkType::Qa | WorkType::QaCoordination, WorkResult::Failed) => Some("Rejected"),
        (WorkType::Acceptance | WorkType::AcceptanceCoordination, WorkResult::Passed) => Some("Accepted"),
        (WorkType::Acceptance | WorkType::AcceptanceCoordination, WorkResult::Failed) => Some("Finished"),
        (WorkType::Research | WorkType::BacklogCreation | WorkType::Refinement, _) => None,
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// ---------------------------------------------------------------------------
// Public entry point — the API the worker poll loop calls
// ---------------------------------------------------------------------------

/// Build the production collaborators from `config` and drive `work` to
/// completion. This is the only entry point the worker process calls; tests
/// exercise [`SessionOrchestrator`] directly with scripted collaborators.
pub async fn run_session(store: Arc<dyn Store>, config: Config, worker_id: String, work: QueuedWork) -> Result<()> {
    let provider: Arc<dyn AgentProvider> = Arc::new(CliAgentProvider::new(
        config.orchestrator.agent_cli_binary.clone().unwrap_or_else(|| "claude".to_string()),
    ));

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
    let tracker: Arc<dyn TrackerClient> = Arc::new(GraphQlTrackerClient::new(
        config.tracker.api_base_url.clone().unwrap_or_else(|| "https://api.linear.app/graphql".to_string()),
        api_token,
        store.clone(),
        breaker,
        config.tracker.rate_limit_burst,
        config.tracker.rate_limit_per_second,
    ));

    let worktrees = Arc::new(WorktreeManager::new(
        expand_tilde(&config.orchestrator.main_repo_path),
        expand_tilde(&config.orchestrator.worktrees_root),
    ));

    let orchestrator = SessionOrchestrator::new(
        store.clone(),
        config.orchestrator,
        worker_id,
        provider,
        tracker,
        Arc::new(EscalationTracker::new(store)),
        worktrees,
    );
    orchestrator.run(work).await
}

// ---------------------------------------------------------------------------
// SessionOrchestrator
// ---------------------------------------------------------------------------

/// Outcome of the provider event-stream pump, decided once the stream ends.
enum PumpOutcome {
    Completed { final_message: String, cost_usd: f64 },
    Stopped { reason: &'static str },
    Failed { final_message: String },
}

pub struct SessionOrchestrator {
    store: Arc<dyn Store>,
    settings: OrchestratorSettings,
    worker_id: String,
    provider: Arc<dyn AgentProvider>,
    tracker: Arc<dyn TrackerClient>,
    escalation: Arc<EscalationTracker>,
    worktrees: Arc<WorktreeManager>,
    sessions: SessionStore,
    /// Work-type → custom prompt template registry (tier 2 of prompt
    /// selection); empty by default, populated by callers that load one.
    templates: HashMap<WorkType, String>,
}

impl SessionOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        settings: OrchestratorSettings,
        worker_id: impl Into<String>,
        provider: Arc<dyn AgentProvider>,
        tracker: Arc<dyn TrackerClient>,
        escalation: Arc<EscalationTracker>,
        worktrees: Arc<WorktreeManager>,
    ) -> Self {
        Self {
            sessions: SessionStore::new(store.clone()),
            store,
            settings,
            worker_id: worker_id.into(),
            provider,
            tracker,
            escalation,
            worktrees,
            templates: HashMap::new(),
        }
    }

    pub fn with_templates(mut self, templates: HashMap<WorkType, String>) -> Self {
        self.templates = templates;
        self
    }

    fn select_prompt(&self, work: &QueuedWork) -> String {
        if let Some(custom) = &work.prompt {
            return custom.clone();
        }
        if let Some(template) = self.templates.get(&work.work_type) {
            return template.clone();
        }
        builtin_prompt(work.work_type, &work.ticket_identifier)
    }

    fn filtered_environment(&self, work: &QueuedWork) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| !ENV_BLOCKLIST.contains(&k.as_str()))
            .collect();
        env.insert("TICKET_ID".into(), work.ticket_id.clone());
        env.insert("SESSION_ID".into(), work.session_id.clone());
        env.insert("WORK_TYPE".into(), format!("{:?}", work.work_type));
        env.insert("TASK_LIST_ID".into(), work.ticket_id.clone());
        env
    }

    /// Drive one claimed session to a terminal state end to end.
    pub async fn run(&self, work: QueuedWork) -> Result<()> {
        let session_id = work.session_id.clone();
        let mut session = match self.sessions.load(&session_id).await? {
            Some(existing) => existing,
            None => {
                let mut s = Session::new(
                    session_id.clone(),
                    work.ticket_id.clone(),
                    work.ticket_identifier.clone(),
                    work.work_type,
                    work.organisation_id.clone(),
                    work.priority,
                );
                s.transition(SessionStatus::Claimed).ok();
                s
            }
        };
        session.worker_id = Some(self.worker_id.clone());
        if session.status == SessionStatus::Claimed {
            session.transition(SessionStatus::Running).ok();
        }
        self.sessions.save(&session).await?;

        // Step 1/2: scratch working tree, recovery-aware.
        let existing = self.worktrees.attach_existing(&work.ticket_identifier, work.work_type);
        let (worktree, recovery_attempts, recovery_prompt) = match existing {
            Some(handle) => self.recover_or_refuse(&session, &handle).await?,
            None => {
                let handle = self.worktrees.create(&work.ticket_identifier, work.work_type).await?;
                self.worktrees.link_dependencies(&handle, "node_modules", Some(("npm", &["install"])));
                (handle, 0u32, None)
            }
        };

        let state_dir = SupervisorStateDir::new(&worktree.path);
        state_dir.ensure()?;
        state_dir.write_state(&WorktreeState {
            ticket_id: work.ticket_id.clone(),
            provider_session_id: session.provider_session_id.clone(),
            work_type: work.work_type,
            status: SessionStatus::Running,
            phase: "starting".into(),
            recovery_attempts,
            pid: None,
            updated_at: Utc::now(),
        })?;
        state_dir.append_progress("session_start", &work.session_id, self.settings.progress_log_max_bytes)?;

        let prompt = recovery_prompt.unwrap_or_else(|| self.select_prompt(&work));
        let env = self.filtered_environment(&work);
        let abort_token = CancellationToken::new();

        let spawn_config = SpawnConfig {
            prompt,
            working_dir: worktree.path.clone(),
            env,
            abort_token: abort_token.clone(),
            autonomous: true,
            sandbox: false,
        };

        let spawn_result = match session.provider_session_id.clone() {
            Some(psid) => self.provider.resume(&psid, spawn_config).await,
            None => self.provider.spawn(spawn_config).await,
        };
        let handle = match spawn_result {
            Ok(h) => h,
            Err(e) => {
                self.cleanup_worktree(&work, &worktree, true).await;
                return Err(e.into());
            }
        };

        let last_activity = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
        let started_at = Utc::now();
        let watchdog_token = abort_token.clone();
        let watchdog_activity = last_activity.clone();
        let inactivity_timeout = chrono::Duration::seconds(self.settings.inactivity_timeout_secs);
        let max_session_timeout = self.settings.max_session_timeout_secs.map(chrono::Duration::seconds);
        let watchdog = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watchdog_token.cancelled() => break,
                    _ = tokio::time::sleep(WATCHDOG_SAMPLE_INTERVAL) => {
                        let now = Utc::now();
                        let last = watchdog_activity.load(Ordering::Relaxed);
                        let last_dt = DateTime::from_timestamp_millis(last).unwrap_or(now);
                        let inactive_too_long = now.signed_duration_since(last_dt) > inactivity_timeout;
                        let over_session_budget = max_session_timeout
                            .map(|budget| now.signed_duration_since(started_at) > budget)
                            .unwrap_or(false);
                        if inactive_too_long || over_session_budget {
                            watchdog_token.cancel();
                            break;
                        }
                    }
                }
            }
        });

        let heartbeat_token = abort_token.clone();
        let heartbeat_dir = state_dir.clone();
        let heartbeat_interval = Duration::from_secs(self.settings.heartbeat_writer_interval_secs);
        let heartbeat_activity = last_activity.clone();
        let heartbeat_writer = tokio::spawn(async move {
            let mut tool_calls: u64 = 0;
            loop {
                tokio::select! {
                    _ = heartbeat_token.cancelled() => break,
                    _ = tokio::time::sleep(heartbeat_interval) => {
                        tool_calls += 1;
                        let last = heartbeat_activity.load(Ordering::Relaxed);
                        let last_dt = DateTime::from_timestamp_millis(last).unwrap_or_else(Utc::now);
                        let _ = heartbeat_dir.write_heartbeat(&HeartbeatState {
                            timestamp: Utc::now(),
                            memory_mb: None,
                            uptime_secs: Utc::now().signed_duration_since(started_at).num_seconds().max(0) as u64,
                            last_activity: last_dt,
                            tool_call_count: tool_calls,
                        });
                    }
                }
            }
        });

        let pump_result = self
            .pump(&work, &handle, &state_dir, &last_activity, abort_token.clone())
            .await;

        abort_token.cancel();
        watchdog.abort();
        heartbeat_writer.abort();

        match pump_result {
            Ok(outcome) => self.finalize(&mut session, &work, &worktree, outcome).await,
            Err(e) => {
                self.cleanup_worktree(&work, &worktree, true).await;
                session.transition(SessionStatus::Finalizing).ok();
                session.transition(SessionStatus::Failed).ok();
                self.sessions.save(&session).await.ok();
                Err(e)
            }
        }
    }

    /// Recovery path for a worktree left behind by a crashed prior run.
    async fn recover_or_refuse(
        &self,
        session: &Session,
        handle: &WorktreeHandle,
    ) -> Result<(WorktreeHandle, u32, Option<String>)> {
        let state_dir = SupervisorStateDir::new(&handle.path);
        let stale_after = chrono::Duration::seconds(self.settings.agent_heartbeat_timeout_secs);
        let fresh = !state_dir.is_heartbeat_stale(Utc::now(), stale_after);
        if fresh {
            return Err(OrchestratorError::AgentAlreadyRunning(session.id.clone()));
        }
        let prior_state = state_dir.read_state().ok().flatten();
        let attempts = prior_state.as_ref().map(|s| s.recovery_attempts).unwrap_or(0);
        if attempts >= self.settings.max_recovery_attempts {
            return Err(OrchestratorError::MaxRecoveryAttempts(session.id.clone()));
        }
        let todos = state_dir.read_todos().ok().flatten();
        let phase = prior_state.as_ref().map(|s| s.phase.clone()).unwrap_or_else(|| "unknown".into());
        let recovery_prompt = format!(
            "Resuming after an interruption during phase '{phase}'. \
             Previously tracked todos: {}. Continue the original task: {}",
            todos.map(|t| t.to_string()).unwrap_or_else(|| "none recorded".into()),
            session.prompt.clone().unwrap_or_default(),
        );
        info!(session_id = %session.id, attempts, "recovering crashed session from stale worktree");
        Ok((handle.clone(), attempts + 1, Some(recovery_prompt)))
    }

    /// Pump the provider's event stream (spec §4.8 step 7) until it ends or
    /// is cancelled by the watchdog.
    async fn pump(
        &self,
        work: &QueuedWork,
        handle: &Handle,
        state_dir: &SupervisorStateDir,
        last_activity: &Arc<AtomicI64>,
        abort_token: CancellationToken,
    ) -> Result<PumpOutcome> {
        let pr_regex = pr_url_regex(self.settings.forge_host.as_deref().unwrap_or("github.com"));
        let mut final_message = String::new();
        let mut cost_usd = 0.0;
        let mut success = false;
        let mut saw_result = false;

        loop {
            if abort_token.is_cancelled() && !saw_result {
                return Ok(PumpOutcome::Stopped { reason: "timeout" });
            }
            let Some(event) = handle.recv().await else { break };
            last_activity.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            if let Ok(value) = serde_json::to_value(&event) {
                state_dir.append_event(&value).ok();
            }

            match event {
                AgentEvent::Init { session_id: provider_session_id } => {
                    debug!(provider_session_id, "agent initialised");
                }
                AgentEvent::System { .. } => {}
                AgentEvent::AssistantText { .. } => {
                    state_dir.append_progress("thought", "assistant turn", self.settings.progress_log_max_bytes).ok();
                }
                AgentEvent::ToolUse { tool_name, input, .. } => {
                    state_dir.append_progress("tool_call", &tool_name, self.settings.progress_log_max_bytes).ok();
                    if tool_name.to_lowercase().contains("todo") {
                        state_dir.write_todos(&input).ok();
                    }
                }
                AgentEvent::ToolProgress { .. } => {}
                AgentEvent::ToolResult { content, .. } => {
                    if let Some(caps) = pr_regex.captures(&content) {
                        let url = caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default();
                        self.tracker
                            .set_external_urls(&work.organisation_id, &work.ticket_id, &[url])
                            .await
                            .ok();
                    }
                }
                AgentEvent::Result { success: ok, message, cost_usd: cost, errors, error_subtype } => {
                    saw_result = true;
                    success = ok;
                    final_message = message;
                    cost_usd = cost.unwrap_or(0.0);
                    if !ok && error_subtype.as_deref() == Some("error_during_execution") {
                        for err in errors.unwrap_or_default() {
                            self.report_tool_error(work, &err).await;
                        }
                    }
                }
                AgentEvent::Error { message, .. } => {
                    warn!(session_id = %work.session_id, error = %message, "agent stream error event");
                }
            }
        }

        if saw_result {
            if success {
                Ok(PumpOutcome::Completed { final_message, cost_usd })
            } else {
                Ok(PumpOutcome::Failed { final_message })
            }
        } else {
            Ok(PumpOutcome::Stopped { reason: "stream_ended" })
        }
    }

    async fn report_tool_error(&self, work: &QueuedWork, error_message: &str) {
        let Some(pattern_type) = classify_tool_error(error_message) else { return };
        let signature = at_core::types::tracked_issue_signature(pattern_type, error_message);
        let key = format!("tracked:issue:{signature}");
        match self.store.exists(&key).await {
            Ok(true) => {
                let _ = self
                    .tracker
                    .create_comment(&work.organisation_id, &work.ticket_id, "Recurring tool error observed again.")
                    .await;
            }
            Ok(false) => {
                if let Ok(issue) = self
                    .tracker
                    .create_issue(
                        &work.organisation_id,
                        &work.organisation_id,
                        &format!("Tool error ({pattern_type}) during {}", work.ticket_identifier),
                        error_message,
                    )
                    .await
                {
                    let _ = self.store.set(&key, &issue.id, Some(Duration::from_secs(30 * 86_400))).await;
                }
            }
            Err(e) => warn!(error = %e, "tracked-issue dedup lookup failed"),
        }
    }

    /// Steps 8-10: completion disposition, tracker status transition,
    /// unassign, completion comments, escalation feed, then step 9 teardown.
    async fn finalize(
        &self,
        session: &mut Session,
        work: &QueuedWork,
        worktree: &WorktreeHandle,
        outcome: PumpOutcome,
    ) -> Result<()> {
        session.transition(SessionStatus::Finalizing).ok();

        match outcome {
            PumpOutcome::Stopped { reason } => {
                session.transition(SessionStatus::Stopped).ok();
                self.sessions.save(session).await?;
                info!(session_id = %session.id, reason, "session stopped without a result");
                self.cleanup_worktree(work, worktree, true).await;
                Ok(())
            }
            PumpOutcome::Completed { final_message, cost_usd } => {
                session.accumulate_cost(cost_usd, 0, 0);
                self.finish_result_sensitive(session, work, worktree, &final_message, true).await
            }
            PumpOutcome::Failed { final_message } => {
                self.finish_result_sensitive(session, work, worktree, &final_message, false).await
            }
        }
    }

    async fn finish_result_sensitive(
        &self,
        session: &mut Session,
        work: &QueuedWork,
        worktree: &WorktreeHandle,
        final_message: &str,
        provider_success: bool,
    ) -> Result<()> {
        let result = if work.work_type.is_result_sensitive() {
            let parsed = parse_work_result_marker(final_message);
            if parsed == WorkResult::Unknown {
                self.tracker
                    .create_comment(
                        &work.organisation_id,
                        &work.ticket_id,
                        "No WORK_RESULT marker found in the agent's final message; status left unchanged.",
                    )
                    .await
                    .ok();
            }
            parsed
        } else if provider_success {
            WorkResult::Passed
        } else {
            WorkResult::Failed
        };

        if self.settings.auto_transition {
            if let Some(status) = next_tracker_status(work.work_type, result) {
                self.tracker.transition_issue(&work.organisation_id, &work.ticket_id, status).await.ok();
            }
        }

        if work.work_type != WorkType::Research {
            self.tracker.unassign(&work.organisation_id, &work.ticket_id).await.ok();
        }

        for (i, part) in split_message(final_message).into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(COMMENT_PART_DELAY).await;
            }
            self.tracker.create_comment(&work.organisation_id, &work.ticket_id, &part).await.ok();
        }

        if work.work_type.feeds_escalation() && matches!(result, WorkResult::Failed | WorkResult::Unknown) {
            self.escalation
                .increment_cycle_count(
                    &work.ticket_id,
                    work.work_type,
                    &work.session_id,
                    session.cost_usd,
                    &format!("{:?} result on {:?}", result, work.work_type),
                )
                .await?;
        } else if result == WorkResult::Passed && work.work_type == WorkType::Acceptance {
            self.escalation.clear(&work.ticket_id).await.ok();
        }

        let final_status = if provider_success { SessionStatus::Completed } else { SessionStatus::Failed };
        session.transition(final_status).ok();
        self.sessions.save(session).await?;

        let preserve_eligible = matches!(work.work_type, WorkType::Development | WorkType::Inflight);
        self.cleanup_worktree(work, worktree, !preserve_eligible).await;
        Ok(())
    }

    /// Step 9: worktree teardown. `force` skips the incomplete-work check
    /// (always true for non-development/inflight work types, and for the
    /// stopped/error paths where nothing should be preserved).
    async fn cleanup_worktree(&self, work: &QueuedWork, worktree: &WorktreeHandle, force: bool) {
        if !force {
            match self.worktrees.has_incomplete_work(worktree) {
                Ok(true) if self.settings.preserve_work_on_pr_failure => {
                    info!(
                        ticket = %work.ticket_identifier,
                        worktree = %worktree.identifier,
                        "preserving worktree with incomplete work"
                    );
                    return;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "incomplete-work check failed, removing worktree anyway"),
            }
        }
        if let Err(e) = self.worktrees.remove(worktree) {
            warn!(error = %e, worktree = %worktree.identifier, "failed to remove worktree");
        }
    }
}
