//! Per-organisation circuit breaker fronting the tracker client (spec §4.2).
//!
//! State lives in the shared [`Store`] under `linear:circuit:<org>` so every
//! worker process and host observes the same breaker, not just the process
//! that tripped it. `can_proceed` is a read-then-write pair against the
//! store rather than a single compound script (the store abstraction's
//! scripted-execute surface is a small closed set of named methods per
//! `at-core::store`'s grounding note, and this breaker isn't one of them);
//! any store error is treated as fail-open, per spec §5/§7.
use std::time::Duration;

use at_core::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive auth/rate errors before the circuit opens.
    pub failure_threshold: u32,
    /// Initial open→half-open timeout.
    pub reset_timeout: Duration,
    /// Cap on the reset timeout after repeated doubling.
    pub reset_timeout_max: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            reset_timeout_max: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    reset_timeout_secs: u64,
}

impl PersistedState {
    fn closed(reset_timeout_secs: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            reset_timeout_secs,
        }
    }
}

/// Store-backed, per-organisation circuit breaker for the tracker client.
pub struct CircuitBreaker {
    store: std::sync::Arc<dyn Store>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: std::sync::Arc<dyn Store>, config: CircuitBreakerConfig) -> Self {
        Self { store, config }
    }

    fn key(org_id: &str) -> String {
        format!("linear:circuit:{org_id}")
    }

    async fn load(&self, org_id: &str) -> PersistedState {
        match self.store.get(&Self::key(org_id)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw)
                .unwrap_or_else(|_| PersistedState::closed(self.config.reset_timeout.as_secs())),
            Ok(None) => PersistedState::closed(self.config.reset_timeout.as_secs()),
            Err(e) => {
                warn!(error = %e, org_id, "circuit breaker store read failed, assuming closed");
                PersistedState::closed(self.config.reset_timeout.as_secs())
            }
        }
    }

    async fn save(&self, org_id: &str, state: &PersistedState) {
        if let Ok(payload) = serde_json::to_string(state) {
            if let Err(e) = self.store.set(&Self::key(org_id), &payload, None).await {
                warn!(error = %e, org_id, "circuit breaker store write failed");
            }
        }
    }

    /// Whether a call may proceed. Transitions Open→HalfOpen once the
    /// current reset timeout has elapsed. Fails open on store errors.
    pub async fn can_proceed(&self, org_id: &str) -> bool {
        let mut state = self.load(org_id).await;
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| Utc::now().signed_duration_since(t))
                    .unwrap_or(chrono::Duration::zero());
                if elapsed >= chrono::Duration::seconds(state.reset_timeout_secs as i64) {
                    info!(org_id, "circuit breaker Open -> HalfOpen");
                    state.state = CircuitState::HalfOpen;
                    self.save(org_id, &state).await;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self, org_id: &str) {
        let mut state = self.load(org_id).await;
        match state.state {
            CircuitState::HalfOpen => {
                info!(org_id, "circuit breaker HalfOpen -> Closed");
                state = PersistedState::closed(self.config.reset_timeout.as_secs());
            }
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
        self.save(org_id, &state).await;
    }

    /// Record a call failure. Only auth/rate-classified errors count toward
    /// the open trigger (spec §4.2); other failures are no-ops here.
    pub async fn record_failure(&self, org_id: &str, is_auth_or_rate: bool) {
        if !is_auth_or_rate {
            return;
        }
        let mut state = self.load(org_id).await;
        match state.state {
            CircuitState::HalfOpen => {
                warn!(org_id, "circuit breaker HalfOpen -> Open (probe failed)");
                let doubled = (state.reset_timeout_secs * 2).min(self.config.reset_timeout_max.as_secs());
                state.state = CircuitState::Open;
                state.opened_at = Some(Utc::now());
                state.reset_timeout_secs = doubled;
                state.consecutive_failures = 0;
            }
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        org_id,
                        failures = state.consecutive_failures,
                        "circuit breaker Closed -> Open"
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Utc::now());
                    state.reset_timeout_secs = self.config.reset_timeout.as_secs();
                }
            }
            CircuitState::Open => {}
        }
        self.save(org_id, &state).await;
    }

    pub async fn state(&self, org_id: &str) -> CircuitState {
        self.load(org_id).await.state
    }
}
