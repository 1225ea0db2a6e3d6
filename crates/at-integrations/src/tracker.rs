//! Tracker client (spec §4.2) — wraps a remote issue-tracker GraphQL API
//! behind a token bucket, a per-organisation circuit breaker, and a quota
//! snapshot cache, grounded on the teacher's `linear` client shape (GraphQL
//! POST + bearer auth) generalized to the capability set the dispatch
//! pipeline actually calls.

use std::sync::Arc;
use std::time::Duration;

use at_core::store::Store;
use at_harness::circuit_breaker::CircuitBreaker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("rate limit acquire timed out after 30s")]
    RateLimitTimeout,
    #[error("circuit breaker open for organisation {0}")]
    CircuitOpen(String),
    #[error("tracker API error: {0}")]
    Api(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store error: {0}")]
    Store(#[from] at_core::store::StoreError),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

fn token_bucket_key(org_id: &str) -> String {
    format!("tracker:tokens:{org_id}")
}

fn quota_key(org_id: &str) -> String {
    format!("tracker:quota:{org_id}")
}

const TOKEN_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_ACQUIRE_POLL: Duration = Duration::from_millis(500);
const QUOTA_TTL: Duration = Duration::from_secs(7_200);
const QUOTA_FRESHNESS: chrono::Duration = chrono::Duration::minutes(5);
const QUOTA_LOW_THRESHOLD: i64 = 500;

/// Classifies a response as auth-or-rate per spec §4.2: HTTP status in
/// {400,401,403}, a GraphQL `RATELIMITED` extension code, or a message
/// matching the access-denied/unauthorized/forbidden/RATELIMITED family.
pub fn classify_auth_or_rate(status: Option<u16>, body: &str) -> bool {
    if matches!(status, Some(400) | Some(401) | Some(403)) {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("ratelimited")
        || lower.contains("access denied")
        || lower.contains("unauthorized")
        || lower.contains("forbidden")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub requests_remaining: Option<i64>,
    pub complexity_remaining: Option<i64>,
    pub fetched_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerIssue {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub description: Option<String>,
    pub state_name: String,
    pub url: String,
}

#[async_trait::async_trait]
pub trait TrackerClient: Send + Sync {
    async fn get_issue(&self, org_id: &str, issue_id: &str) -> Result<TrackerIssue>;
    async fn update_status(&self, org_id: &str, issue_id: &str, status: &str) -> Result<()>;
    async fn create_comment(&self, org_id: &str, issue_id: &str, body: &str) -> Result<()>;
    async fn unassign(&self, org_id: &str, issue_id: &str) -> Result<()>;
    async fn create_issue(&self, org_id: &str, team_id: &str, title: &str, description: &str) -> Result<TrackerIssue>;
    async fn create_relation(&self, org_id: &str, issue_id: &str, related_issue_id: &str, kind: &str) -> Result<()>;
    async fn list_sub_issues(&self, org_id: &str, issue_id: &str) -> Result<Vec<TrackerIssue>>;
    async fn set_external_urls(&self, org_id: &str, issue_id: &str, urls: &[String]) -> Result<()>;
    async fn transition_issue(&self, org_id: &str, issue_id: &str, target_state: &str) -> Result<()>;
}

/// GraphQL-backed tracker client. `base_url` defaults to the teacher's
/// Linear endpoint but is configurable so a differently-shaped tracker can
/// be pointed at without touching callers.
pub struct GraphQlTrackerClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
    store: Arc<dyn Store>,
    breaker: CircuitBreaker,
    rate_limit_burst: f64,
    rate_limit_per_second: f64,
}

impl GraphQlTrackerClient {
    pub fn new(
        base_url: impl Into<String>,
        api_token: impl Into<String>,
        store: Arc<dyn Store>,
        breaker: CircuitBreaker,
        rate_limit_burst: f64,
        rate_limit_per_second: f64,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_token: api_token.into(),
            store,
            breaker,
            rate_limit_burst,
            rate_limit_per_second,
        }
    }

    async fn acquire_token(&self, org_id: &str) -> Result<()> {
        let deadline = std::time::Instant::now() + TOKEN_ACQUIRE_TIMEOUT;
        loop {
            match self
                .store
                .try_acquire_token(&token_bucket_key(org_id), self.rate_limit_per_second, self.rate_limit_burst, 1.0)
                .await?
            {
                at_core::store::TokenAcquireResult::Acquired { .. } => return Ok(()),
                at_core::store::TokenAcquireResult::Denied { retry_after } => {
                    if std::time::Instant::now() + retry_after >= deadline {
                        return Err(TrackerError::RateLimitTimeout);
                    }
                    tokio::time::sleep(TOKEN_ACQUIRE_POLL.min(retry_after)).await;
                }
            }
        }
    }

    async fn save_quota(&self, org_id: &str, snapshot: &QuotaSnapshot) {
        if let Ok(payload) = serde_json::to_string(snapshot) {
            if let Err(e) = self.store.set(&quota_key(org_id), &payload, Some(QUOTA_TTL)).await {
                warn!(error = %e, org_id, "failed to persist tracker quota snapshot");
            }
        }
    }

    /// True only when the last snapshot is fresher than 5 minutes and shows
    /// fewer than 500 requests remaining. Unknown quota never blocks.
    pub async fn is_quota_low(&self, org_id: &str) -> bool {
        let Ok(Some(raw)) = self.store.get(&quota_key(org_id)).await else {
            return false;
        };
        let Ok(snapshot) = serde_json::from_str::<QuotaSnapshot>(&raw) else {
            return false;
        };
        let Some(fetched_at) = snapshot.fetched_at else {
            return false;
        };
        if Utc::now().signed_duration_since(fetched_at) >= QUOTA_FRESHNESS {
            return false;
        }
        snapshot.requests_remaining.map(|r| r < QUOTA_LOW_THRESHOLD).unwrap_or(false)
    }

    fn parse_quota_headers(headers: &reqwest::header::HeaderMap) -> QuotaSnapshot {
        let parse = |name: &str| -> Option<i64> {
            headers.get(name)?.to_str().ok()?.parse().ok()
        };
        QuotaSnapshot {
            requests_remaining: parse("x-ratelimit-requests-remaining"),
            complexity_remaining: parse("x-ratelimit-complexity-remaining"),
            fetched_at: Some(Utc::now()),
        }
    }

    async fn graphql(
        &self,
        org_id: &str,
        query: &str,
        variables: Value,
    ) -> Result<Value> {
        if !self.breaker.can_proceed(org_id).await {
            return Err(TrackerError::CircuitOpen(org_id.to_string()));
        }
        self.acquire_token(org_id).await?;

        let payload = serde_json::json!({ "query": query, "variables": variables });
        let response = self
            .http
            .post(&self.base_url)
            .header("Authorization", &self.api_token)
            .json(&payload)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.breaker.record_failure(org_id, false).await;
                return Err(TrackerError::Http(e));
            }
        };

        let status = response.status().as_u16();
        let quota = Self::parse_quota_headers(response.headers());
        self.save_quota(org_id, &quota).await;

        let body = response.text().await.unwrap_or_default();
        let is_auth_or_rate = classify_auth_or_rate(Some(status), &body);
        if is_auth_or_rate {
            self.breaker.record_failure(org_id, true).await;
            return Err(TrackerError::Api(format!("auth/rate error ({status}): {body}")));
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|e| TrackerError::Api(e.to_string()))?;
        if let Some(errors) = parsed.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                let msg = errors.to_string();
                if classify_auth_or_rate(None, &msg) {
                    self.breaker.record_failure(org_id, true).await;
                } else {
                    self.breaker.record_failure(org_id, false).await;
                }
                return Err(TrackerError::Api(msg));
            }
        }

        self.breaker.record_success(org_id).await;
        Ok(parsed)
    }

    fn issue_from_json(value: &Value) -> Result<TrackerIssue> {
        serde_json::from_value(value.clone()).map_err(|e| TrackerError::Api(format!("malformed issue payload: {e}")))
    }
}

#[async_trait::async_trait]
impl TrackerClient for GraphQlTrackerClient {
    async fn get_issue(&self, org_id: &str, issue_id: &str) -> Result<TrackerIssue> {
        let query = "query($id: String!) { issue(id: $id) { id identifier title description stateName: state { name } url } }";
        let vars = serde_json::json!({ "id": issue_id });
        let data = self.graphql(org_id, query, vars).await?;
        Self::issue_from_json(data.pointer("/data/issue").unwrap_or(&Value::Null))
    }

    async fn update_status(&self, org_id: &str, issue_id: &str, status: &str) -> Result<()> {
        let query = "mutation($id: String!, $status: String!) { issueUpdate(id: $id, input: { stateId: $status }) { success } }";
        let vars = serde_json::json!({ "id": issue_id, "status": status });
        self.graphql(org_id, query, vars).await?;
        Ok(())
    }

    async fn create_comment(&self, org_id: &str, issue_id: &str, body: &str) -> Result<()> {
        let query = "mutation($id: String!, $body: String!) { commentCreate(input: { issueId: $id, body: $body }) { success } }";
        let vars = serde_json::json!({ "id": issue_id, "body": body });
        self.graphql(org_id, query, vars).await?;
        Ok(())
    }

    async fn unassign(&self, org_id: &str, issue_id: &str) -> Result<()> {
        let query = "mutation($id: String!) { issueUpdate(id: $id, input: { assigneeId: null }) { success } }";
        let vars = serde_json::json!({ "id": issue_id });
        self.graphql(org_id, query, vars).await?;
        Ok(())
    }

    async fn create_issue(&self, org_id: &str, team_id: &str, title: &str, description: &str) -> Result<TrackerIssue> {
        let query = "mutation($teamId: String!, $title: String!, $description: String!) { issueCreate(input: { teamId: $teamId, title: $title, description: $description }) { issue { id identifier title description stateName: state { name } url } } }";
        let vars = serde_json::json!({ "teamId": team_id, "title": title, "description": description });
        let data = self.graphql(org_id, query, vars).await?;
        Self::issue_from_json(data.pointer("/data/issueCreate/issue").unwrap_or(&Value::Null))
    }

    async fn create_relation(&self, org_id: &str, issue_id: &str, related_issue_id: &str, kind: &str) -> Result<()> {
        let query = "mutation($id: String!, $relatedId: String!, $kind: String!) { issueRelationCreate(input: { issueId: $id, relatedIssueId: $relatedId, type: $kind }) { success } }";
        let vars = serde_json::json!({ "id": issue_id, "relatedId": related_issue_id, "kind": kind });
        self.graphql(org_id, query, vars).await?;
        Ok(())
    }

    async fn list_sub_issues(&self, org_id: &str, issue_id: &str) -> Result<Vec<TrackerIssue>> {
        let query = "query($id: String!) { issue(id: $id) { children { nodes { id identifier title description stateName: state { name } url } } } }";
        let vars = serde_json::json!({ "id": issue_id });
        let data = self.graphql(org_id, query, vars).await?;
        let nodes = data
            .pointer("/data/issue/children/nodes")
            .and_then(|n| n.as_array())
            .cloned()
            .unwrap_or_default();
        nodes.iter().map(Self::issue_from_json).collect()
    }

    async fn set_external_urls(&self, org_id: &str, issue_id: &str, urls: &[String]) -> Result<()> {
        let query = "mutation($id: String!, $urls: [String!]!) { issueUpdate(id: $id, input: { externalUrls: $urls }) { success } }";
        let vars = serde_json::json!({ "id": issue_id, "urls": urls });
        self.graphql(org_id, query, vars).await?;
        Ok(())
    }

    async fn transition_issue(&self, org_id: &str, issue_id: &str, target_state: &str) -> Result<()> {
        self.update_status(org_id, issue_id, target_state).await
    }
}

/// Replays canned responses; used by orchestrator/dispatcher tests so they
/// don't need network access or a live tracker.
#[cfg(any(test, feature = "test-util"))]
pub struct ScriptedTrackerClient {
    pub comments: std::sync::Mutex<Vec<(String, String)>>,
    pub status_updates: std::sync::Mutex<Vec<(String, String)>>,
    pub unassigned: std::sync::Mutex<Vec<String>>,
    /// (team_id, title, description) for every `create_issue` call.
    pub created_issues: std::sync::Mutex<Vec<(String, String, String)>>,
}

#[cfg(any(test, feature = "test-util"))]
impl Default for ScriptedTrackerClient {
    fn default() -> Self {
        Self {
            comments: std::sync::Mutex::new(Vec::new()),
            status_updates: std::sync::Mutex::new(Vec::new()),
            unassigned: std::sync::Mutex::new(Vec::new()),
            created_issues: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait::async_trait]
impl TrackerClient for ScriptedTrackerClient {
    async fn get_issue(&self, _org_id: &str, issue_id: &str) -> Result<TrackerIssue> {
        Ok(TrackerIssue {
            id: issue_id.to_string(),
            identifier: issue_id.to_string(),
            title: "stub".to_string(),
            description: None,
            state_name: "Todo".to_string(),
            url: format!("https://tracker.example/issue/{issue_id}"),
        })
    }

    async fn update_status(&self, _org_id: &str, issue_id: &str, status: &str) -> Result<()> {
        self.status_updates.lock().unwrap().push((issue_id.to_string(), status.to_string()));
        Ok(())
    }

    async fn create_comment(&self, _org_id: &str, issue_id: &str, body: &str) -> Result<()> {
        self.comments.lock().unwrap().push((issue_id.to_string(), body.to_string()));
        Ok(())
    }

    async fn unassign(&self, _org_id: &str, issue_id: &str) -> Result<()> {
        self.unassigned.lock().unwrap().push(issue_id.to_string());
        Ok(())
    }

    async fn create_issue(&self, _org_id: &str, team_id: &str, title: &str, description: &str) -> Result<TrackerIssue> {
        self.created_issues
            .lock()
            .unwrap()
            .push((team_id.to_string(), title.to_string(), description.to_string()));
        Ok(TrackerIssue {
            id: uuid::Uuid::new_v4().to_string(),
            identifier: "STUB-1".to_string(),
            title: title.to_string(),
            description: Some(description.to_string()),
            state_name: "Todo".to_string(),
            url: "https://tracker.example/issue/STUB-1".to_string(),
        })
    }

    async fn create_relation(&self, _org_id: &str, _issue_id: &str, _related_issue_id: &str, _kind: &str) -> Result<()> {
        Ok(())
    }

    async fn list_sub_issues(&self, _org_id: &str, _issue_id: &str) -> Result<Vec<TrackerIssue>> {
        Ok(Vec::new())
    }

    async fn set_external_urls(&self, _org_id: &str, _issue_id: &str, _urls: &[String]) -> Result<()> {
        Ok(())
    }

    async fn transition_issue(&self, _org_id: &str, issue_id: &str, target_state: &str) -> Result<()> {
        self.update_status(_org_id, issue_id, target_state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        assert!(classify_auth_or_rate(Some(401), ""));
        assert!(classify_auth_or_rate(Some(403), ""));
        assert!(!classify_auth_or_rate(Some(500), ""));
    }

    #[test]
    fn classifies_graphql_ratelimited_message() {
        assert!(classify_auth_or_rate(Some(200), "RATELIMITED: too many requests"));
        assert!(classify_auth_or_rate(None, "Access Denied"));
        assert!(!classify_auth_or_rate(Some(200), "issue not found"));
    }

    #[tokio::test]
    async fn scripted_client_records_comments_and_unassign() {
        let client = ScriptedTrackerClient::default();
        client.create_comment("org1", "ENG-1", "done").await.unwrap();
        client.unassign("org1", "ENG-1").await.unwrap();
        assert_eq!(client.comments.lock().unwrap().len(), 1);
        assert_eq!(client.unassigned.lock().unwrap()[0], "ENG-1");
    }

    #[tokio::test]
    async fn quota_low_false_when_no_snapshot() {
        let store: Arc<dyn Store> = Arc::new(at_core::store::MemoryStore::default());
        let breaker = CircuitBreaker::new(store.clone(), Default::default());
        let client = GraphQlTrackerClient::new("https://tracker.example/graphql", "token", store, breaker, 80.0, 1.5);
        assert!(!client.is_quota_low("org1").await);
    }
}
