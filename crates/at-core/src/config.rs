use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.at-dispatch/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            store: StoreConfig::default(),
            tracker: TrackerConfig::default(),
            worker: WorkerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            security: SecurityConfig::default(),
            daemon: DaemonConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `~/.at-dispatch/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
            let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
            Ok(cfg)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".at-dispatch")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            environment: default_environment(),
        }
    }
}

fn default_project_name() -> String {
    "at-dispatch".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_environment() -> String {
    "development".into()
}

/// Backing store (embedded SQLite by default; spec treats it as a KV+list+
/// set+zset+hash server, so a networked backend is a drop-in swap behind the
/// `Store` trait without a config shape change).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.at-dispatch/store.db".into()
}

/// Issue-tracker client tuning: token bucket + circuit breaker + quota cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub api_token_env: Option<String>,
    #[serde(default = "default_tracker_burst")]
    pub rate_limit_burst: f64,
    #[serde(default = "default_tracker_refill")]
    pub rate_limit_per_second: f64,
    #[serde(default = "default_circuit_reset_secs")]
    pub circuit_reset_timeout_secs: u64,
    #[serde(default = "default_circuit_reset_max_secs")]
    pub circuit_reset_timeout_max_secs: u64,
    #[serde(default = "default_quota_ttl_secs")]
    pub quota_cache_ttl_secs: u64,
    #[serde(default = "default_worked_window_days")]
    pub agent_worked_window_days: i64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            api_token_env: None,
            rate_limit_burst: default_tracker_burst(),
            rate_limit_per_second: default_tracker_refill(),
            circuit_reset_timeout_secs: default_circuit_reset_secs(),
            circuit_reset_timeout_max_secs: default_circuit_reset_max_secs(),
            quota_cache_ttl_secs: default_quota_ttl_secs(),
            agent_worked_window_days: default_worked_window_days(),
        }
    }
}

fn default_tracker_burst() -> f64 {
    80.0
}
fn default_tracker_refill() -> f64 {
    1.5
}
fn default_circuit_reset_secs() -> u64 {
    60
}
fn default_circuit_reset_max_secs() -> u64 {
    300
}
fn default_quota_ttl_secs() -> u64 {
    120
}
fn default_worked_window_days() -> i64 {
    7
}

/// Per-process worker pool tuning: capacity, polling cadence, heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_capacity")]
    pub capacity: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_registration_ttl_secs")]
    pub registration_ttl_secs: u64,
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default)]
    pub project_allowlist: Option<Vec<String>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            capacity: default_worker_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            registration_ttl_secs: default_registration_ttl_secs(),
            claim_ttl_secs: default_claim_ttl_secs(),
            store_path: default_store_path(),
            project_allowlist: None,
        }
    }
}

fn default_worker_capacity() -> u32 {
    4
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_heartbeat_timeout_secs() -> u64 {
    90
}
fn default_registration_ttl_secs() -> u64 {
    120
}
fn default_claim_ttl_secs() -> u64 {
    7_200
}

/// Per-session supervisor tuning: escalation thresholds, log rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_issue_lock_ttl_secs")]
    pub issue_lock_ttl_secs: u64,
    #[serde(default = "default_progress_log_max_bytes")]
    pub progress_log_max_bytes: u64,
    #[serde(default = "default_vcs_binary")]
    pub vcs_binary: String,
    #[serde(default)]
    pub agent_cli_binary: Option<String>,
    #[serde(default = "default_main_repo_path")]
    pub main_repo_path: String,
    #[serde(default = "default_worktrees_root")]
    pub worktrees_root: String,
    #[serde(default = "default_heartbeat_writer_interval_secs")]
    pub heartbeat_writer_interval_secs: u64,
    #[serde(default = "default_agent_heartbeat_timeout_secs")]
    pub agent_heartbeat_timeout_secs: i64,
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: i64,
    #[serde(default)]
    pub max_session_timeout_secs: Option<i64>,
    #[serde(default)]
    pub max_cost_usd: f64,
    #[serde(default)]
    pub preserve_work_on_pr_failure: bool,
    #[serde(default = "default_auto_transition")]
    pub auto_transition: bool,
    #[serde(default)]
    pub forge_host: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            issue_lock_ttl_secs: default_issue_lock_ttl_secs(),
            progress_log_max_bytes: default_progress_log_max_bytes(),
            vcs_binary: default_vcs_binary(),
            agent_cli_binary: None,
            main_repo_path: default_main_repo_path(),
            worktrees_root: default_worktrees_root(),
            heartbeat_writer_interval_secs: default_heartbeat_writer_interval_secs(),
            agent_heartbeat_timeout_secs: default_agent_heartbeat_timeout_secs(),
            max_recovery_attempts: default_max_recovery_attempts(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            max_session_timeout_secs: None,
            max_cost_usd: 0.0,
            preserve_work_on_pr_failure: true,
            auto_transition: default_auto_transition(),
            forge_host: None,
        }
    }
}

fn default_issue_lock_ttl_secs() -> u64 {
    7_200
}
fn default_progress_log_max_bytes() -> u64 {
    1024 * 1024
}
fn default_vcs_binary() -> String {
    "git".into()
}
fn default_main_repo_path() -> String {
    ".".into()
}
fn default_worktrees_root() -> String {
    "~/.at-dispatch/worktrees".into()
}
fn default_heartbeat_writer_interval_secs() -> u64 {
    10
}
fn default_agent_heartbeat_timeout_secs() -> i64 {
    30
}
fn default_max_recovery_attempts() -> u32 {
    3
}
fn default_inactivity_timeout_secs() -> i64 {
    300
}
fn default_auto_transition() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub worker_api_key_env: Option<String>,
    #[serde(default)]
    pub webhook_secret_env: Option<String>,
    #[serde(default)]
    pub cron_secret_env: Option<String>,
    #[serde(default)]
    pub session_hash_salt_env: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            worker_api_key_env: None,
            webhook_secret_env: None,
            cron_secret_env: None,
            session_hash_salt_env: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_daemon_host")]
    pub host: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_daemon_port(),
            host: default_daemon_host(),
        }
    }
}

fn default_daemon_port() -> u16 {
    8787
}
fn default_daemon_host() -> String {
    "127.0.0.1".into()
}

/// Public-endpoint rate limiting (distinct from the tracker's outbound
/// token bucket): bounded-memory LRU of per-key windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rl_max_keys")]
    pub max_keys: usize,
    #[serde(default = "default_rl_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_rl_max_requests")]
    pub max_requests_per_window: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_keys: default_rl_max_keys(),
            window_secs: default_rl_window_secs(),
            max_requests_per_window: default_rl_max_requests(),
        }
    }
}

fn default_rl_max_keys() -> usize {
    10_000
}
fn default_rl_window_secs() -> u64 {
    60
}
fn default_rl_max_requests() -> u32 {
    120
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = Config::default();
        let toml = cfg.to_toml().unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.worker.capacity, cfg.worker.capacity);
        assert_eq!(parsed.tracker.rate_limit_burst, cfg.tracker.rate_limit_burst);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let partial = "[worker]\ncapacity = 16\n";
        let cfg: Config = toml::from_str(partial).unwrap();
        assert_eq!(cfg.worker.capacity, 16);
        assert_eq!(cfg.worker.poll_interval_ms, default_poll_interval_ms());
        assert_eq!(cfg.tracker.rate_limit_burst, default_tracker_burst());
    }
}
