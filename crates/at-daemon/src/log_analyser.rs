//! Post-hoc `events.jsonl` analyser (spec §4.12).
//!
//! Walks a session's event log, classifies each error-bearing event through
//! an ordered regex rule table into a named pattern, and — once a pattern
//! crosses its severity/frequency threshold — creates or comments on a
//! deduplicated tracked issue. Grounded on `security.rs`'s ordered
//! rule-table-plus-classification idiom and on `tracked_issue_signature`,
//! the same dedup primitive the in-flight orchestrator's `report_tool_error`
//! uses, generalized here to a full [`TrackedIssue`] record instead of a
//! bare issue-id string so the analyser can track first/last-seen and the
//! sessions that hit the same pattern.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use at_core::session_store::SessionStore;
use at_core::store::Store;
use at_core::types::{tracked_issue_signature, SessionStatus, TrackedIssue};
use at_integrations::tracker::TrackerClient;
use chrono::Utc;
use regex::Regex;
use tracing::{info, warn};

const TRACKED_ISSUE_TTL: Duration = Duration::from_secs(30 * 86_400);
const SWEEP_DEBOUNCE_KEY: &str = "log_analyser:debounce";
const SWEEP_DEBOUNCE_WINDOW: Duration = Duration::from_secs(300);
const SESSION_KEY_PREFIX: &str = "agent:session:";
const REPEATED_FAILURE_THRESHOLD: u32 = 3;
const MEDIUM_REPORT_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternType {
    Permission,
    ToolIssue,
    ToolMisuse,
    Performance,
    RepeatedFailure,
    ApprovalRequired,
}

impl PatternType {
    fn as_str(&self) -> &'static str {
        match self {
            PatternType::Permission => "permission",
            PatternType::ToolIssue => "tool-issue",
            PatternType::ToolMisuse => "tool-misuse",
            PatternType::Performance => "performance",
            PatternType::RepeatedFailure => "repeated-failure",
            PatternType::ApprovalRequired => "approval-required",
        }
    }
}

struct Rule {
    name: &'static str,
    pattern: Regex,
    category: PatternType,
    severity: Severity,
}

/// Ordered rule table: first match wins, so more specific rules (e.g.
/// `sandbox`) precede the generic catch-all.
fn rules() -> Vec<Rule> {
    let compile = |p: &str| Regex::new(p).expect("log analyser rule patterns are static and valid");
    vec![
        Rule {
            name: "command-approval",
            pattern: compile(r"(?i)requires (your )?approval|awaiting approval|needs approval"),
            category: PatternType::ApprovalRequired,
            severity: Severity::High,
        },
        Rule {
            name: "write-before-read",
            pattern: compile(r"(?i)must read .* before (writing|editing)|read the file before"),
            category: PatternType::ToolMisuse,
            severity: Severity::Medium,
        },
        Rule {
            name: "missing-file",
            pattern: compile(r"(?i)file not found|no such file or directory"),
            category: PatternType::ToolIssue,
            severity: Severity::Medium,
        },
        Rule {
            name: "sandbox",
            pattern: compile(r"(?i)sandbox (violation|denied|blocked)"),
            category: PatternType::Permission,
            severity: Severity::High,
        },
        Rule {
            name: "permission",
            pattern: compile(r"(?i)permission denied|eacces"),
            category: PatternType::Permission,
            severity: Severity::High,
        },
        Rule {
            name: "enoent",
            pattern: compile(r"(?i)enoent"),
            category: PatternType::ToolIssue,
            severity: Severity::Medium,
        },
        Rule {
            name: "timeout",
            pattern: compile(r"(?i)timed out|timeout"),
            category: PatternType::Performance,
            severity: Severity::Medium,
        },
        Rule {
            name: "rate-limit",
            pattern: compile(r"(?i)rate limit|too many requests|\b429\b"),
            category: PatternType::Performance,
            severity: Severity::Medium,
        },
        Rule {
            name: "econnrefused",
            pattern: compile(r"(?i)econnrefused|connection refused"),
            category: PatternType::ToolIssue,
            severity: Severity::Medium,
        },
        Rule {
            name: "worktree-conflict",
            pattern: compile(r"(?i)worktree.*(conflict|already exists|locked)"),
            category: PatternType::ToolMisuse,
            severity: Severity::Medium,
        },
        Rule {
            name: "generic-tool-failure",
            pattern: compile(r"(?i)error|failed|exception"),
            category: PatternType::ToolIssue,
            severity: Severity::Low,
        },
    ]
}

fn classify<'a>(message: &str, rules: &'a [Rule]) -> Option<&'a Rule> {
    rules.iter().find(|r| r.pattern.is_match(message))
}

/// Error-bearing events from a single `events.jsonl` line: a failed tool
/// result's `content`, a stream-level `error`'s `message`, or each string in
/// a failed `result`'s `errors` array.
fn error_messages(line: &str) -> Vec<String> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return Vec::new();
    };
    match value.get("kind").and_then(|k| k.as_str()) {
        Some("tool_result") if value.get("is_error").and_then(|v| v.as_bool()) == Some(true) => value
            .get("content")
            .and_then(|c| c.as_str())
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        Some("error") => value
            .get("message")
            .and_then(|m| m.as_str())
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        Some("result") if value.get("success").and_then(|v| v.as_bool()) == Some(false) => value
            .get("errors")
            .and_then(|e| e.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub rule: &'static str,
    pub pattern_type: PatternType,
    pub severity: Severity,
    pub message: String,
    pub occurrences: u32,
}

/// Scans one `events.jsonl` file and returns one [`Finding`] per distinct
/// (rule, message-prefix) pair observed, in first-seen order. A finding
/// whose occurrence count reaches [`REPEATED_FAILURE_THRESHOLD`] is
/// reclassified as `repeated-failure` regardless of its rule's own category.
pub fn scan_file(path: &Path) -> std::io::Result<Vec<Finding>> {
    let content = std::fs::read_to_string(path)?;
    Ok(scan_lines(content.lines()))
}

fn scan_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<Finding> {
    let rule_table = rules();
    let mut counts: HashMap<(&'static str, String), u32> = HashMap::new();
    let mut meta: HashMap<(&'static str, String), (PatternType, Severity)> = HashMap::new();
    let mut order: Vec<(&'static str, String)> = Vec::new();

    for line in lines {
        for message in error_messages(line) {
            let Some(rule) = classify(&message, &rule_table) else { continue };
            let key_message: String = message.chars().take(120).collect();
            let key = (rule.name, key_message);
            if !counts.contains_key(&key) {
                order.push(key.clone());
                meta.insert(key.clone(), (rule.category, rule.severity));
            }
            *counts.entry(key).or_insert(0) += 1;
        }
    }

    order
        .into_iter()
        .map(|key| {
            let occurrences = counts[&key];
            let (category, severity) = meta[&key];
            let pattern_type = if occurrences >= REPEATED_FAILURE_THRESHOLD {
                PatternType::RepeatedFailure
            } else {
                category
            };
            Finding { rule: key.0, pattern_type, severity, message: key.1, occurrences }
        })
        .collect()
}

/// Whether `findings` clears the reporting bar: any high/critical severity,
/// any medium severity with at least [`MEDIUM_REPORT_THRESHOLD`]
/// occurrences, or two or more distinct rules sharing the same pattern type.
pub fn qualifying<'a>(findings: &'a [Finding]) -> Vec<&'a Finding> {
    let mut rules_per_type: HashMap<PatternType, std::collections::HashSet<&'static str>> = HashMap::new();
    for f in findings {
        rules_per_type.entry(f.pattern_type).or_default().insert(f.rule);
    }

    findings
        .iter()
        .filter(|f| {
            f.severity >= Severity::High
                || (f.severity == Severity::Medium && f.occurrences >= MEDIUM_REPORT_THRESHOLD)
                || rules_per_type.get(&f.pattern_type).map(|s| s.len()).unwrap_or(0) >= 2
        })
        .collect()
}

fn dedup_key(signature: &str) -> String {
    format!("tracked:issue:{signature}")
}

/// Context the store/event log doesn't carry itself: which tracker
/// organisation/team and session the finding originated from.
pub struct AnalysisContext<'a> {
    pub org_id: &'a str,
    pub team_id: &'a str,
    pub session_id: &'a str,
    pub ticket_identifier: &'a str,
}

/// Creates a new tracked issue for a qualifying finding, or comments on the
/// existing one and bumps its session count, via the same
/// `tracked:issue:<signature>` dedup key the in-flight orchestrator writes.
pub async fn report_finding(
    store: &Arc<dyn Store>,
    tracker: &dyn TrackerClient,
    ctx: &AnalysisContext<'_>,
    finding: &Finding,
) -> Result<(), at_integrations::tracker::TrackerError> {
    let signature = tracked_issue_signature(finding.pattern_type.as_str(), &finding.message);
    let key = dedup_key(&signature);

    match store.get(&key).await {
        Ok(Some(raw)) => {
            let mut tracked: TrackedIssue = match serde_json::from_str(&raw) {
                Ok(t) => t,
                Err(_) => return Ok(()), // pre-existing bare-id record from the in-flight reporter; leave it alone
            };
            tracked.last_seen = Utc::now();
            tracked.session_count += 1;
            if !tracked.session_ids.contains(&ctx.session_id.to_string()) {
                tracked.session_ids.push(ctx.session_id.to_string());
            }
            tracker
                .create_comment(
                    ctx.org_id,
                    &tracked.tracker_id,
                    &format!(
                        "Recurring `{}` pattern observed again ({} occurrences this scan).",
                        finding.rule, finding.occurrences
                    ),
                )
                .await?;
            let payload = serde_json::to_string(&tracked).expect("TrackedIssue serializes");
            store.set(&key, &payload, Some(TRACKED_ISSUE_TTL)).await.ok();
            info!(signature, ticket = %tracked.identifier, "commented on existing tracked issue");
        }
        Ok(None) => {
            let title = format!(
                "[{}] {} during {}",
                finding.pattern_type.as_str(),
                finding.rule,
                ctx.ticket_identifier
            );
            let issue = tracker.create_issue(ctx.org_id, ctx.team_id, &title, &finding.message).await?;
            let now = Utc::now();
            let tracked = TrackedIssue {
                signature: signature.clone(),
                tracker_id: issue.id,
                identifier: issue.identifier,
                first_seen: now,
                last_seen: now,
                session_count: 1,
                session_ids: vec![ctx.session_id.to_string()],
            };
            let payload = serde_json::to_string(&tracked).expect("TrackedIssue serializes");
            store.set(&key, &payload, Some(TRACKED_ISSUE_TTL)).await.ok();
            info!(signature, ticket = %tracked.identifier, "created tracked issue from log analysis");
        }
        Err(e) => warn!(error = %e, "tracked-issue dedup lookup failed, skipping report"),
    }
    Ok(())
}

/// Scans `path` and reports every qualifying finding.
pub async fn analyse_and_report(
    store: &Arc<dyn Store>,
    tracker: &dyn TrackerClient,
    ctx: &AnalysisContext<'_>,
    path: &Path,
) -> std::io::Result<usize> {
    let findings = scan_file(path)?;
    let qualifying = qualifying(&findings);
    let mut reported = 0;
    for finding in qualifying {
        if report_finding(store, tracker, ctx, finding).await.is_ok() {
            reported += 1;
        }
    }
    Ok(reported)
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("store error: {0}")]
    Store(#[from] at_core::store::StoreError),
    #[error("io error reading {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn analysed_key(session_id: &str) -> String {
    format!("log_analysis:done:{session_id}")
}

/// Periodic sweep over terminal sessions' `events.jsonl`, run once per
/// [`SWEEP_DEBOUNCE_WINDOW`] via a store-backed debounce guard, mirroring
/// [`crate::cleanup::CleanupSweep`]'s shape. Each terminal session is
/// analysed at most once; the done-marker never expires so a session is
/// never re-scanned after its working tree is torn down.
pub struct LogAnalyserSweep {
    store: Arc<dyn Store>,
    sessions: SessionStore,
    tracker: Arc<dyn TrackerClient>,
}

impl LogAnalyserSweep {
    pub fn new(store: Arc<dyn Store>, tracker: Arc<dyn TrackerClient>) -> Self {
        let sessions = SessionStore::new(store.clone());
        Self { store, sessions, tracker }
    }

    pub async fn run_debounced(&self) -> Result<Option<usize>, SweepError> {
        if !self.store.setnx(SWEEP_DEBOUNCE_KEY, "1", Some(SWEEP_DEBOUNCE_WINDOW)).await? {
            return Ok(None);
        }
        Ok(Some(self.run().await?))
    }

    /// Returns the number of sessions whose logs produced at least one
    /// qualifying finding.
    pub async fn run(&self) -> Result<usize, SweepError> {
        let mut reported_sessions = 0;
        for key in self.store.keys(SESSION_KEY_PREFIX).await? {
            let Some(sid) = key.strip_prefix(SESSION_KEY_PREFIX) else { continue };
            if self.store.exists(&analysed_key(sid)).await? {
                continue;
            }
            let Some(session) = self.sessions.load(sid).await? else { continue };
            if !session.status.is_terminal() || session.status == SessionStatus::Stopped {
                continue;
            }
            let Some(working_tree) = &session.working_tree_path else {
                continue;
            };
            let events_path = at_session::session::SupervisorStateDir::new(working_tree).events_path();
            if !events_path.exists() {
                continue;
            }
            let ctx = AnalysisContext {
                org_id: &session.organisation_id,
                team_id: &session.organisation_id,
                session_id: &session.id,
                ticket_identifier: &session.ticket_identifier,
            };
            let reported = analyse_and_report(&self.store, self.tracker.as_ref(), &ctx, &events_path)
                .await
                .map_err(|source| SweepError::Io { path: events_path.clone(), source })?;
            if reported > 0 {
                reported_sessions += 1;
                info!(session_id = %session.id, reported, "log analyser reported findings");
            }
            self.store.set(&analysed_key(sid), "1", None).await?;
        }
        Ok(reported_sessions)
    }
}
