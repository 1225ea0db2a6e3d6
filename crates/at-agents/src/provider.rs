//! Agent provider — the pluggable capability that spawns, resumes, and
//! multiplexes a child coding-agent process (spec §4.3).
//!
//! The orchestrator never shells out to a specific agent CLI directly; it
//! talks to whatever implements [`AgentProvider`]. [`CliAgentProvider`] is
//! the production implementation (spawns a configured binary as a child
//! process and parses its stdout as newline-delimited JSON events);
//! [`ScriptedAgentProvider`] is a test double that replays a canned event
//! list without touching the filesystem.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(String),
    #[error("stream aborted")]
    StreamAborted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Input configuration for `spawn`/`resume`.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub abort_token: CancellationToken,
    pub autonomous: bool,
    pub sandbox: bool,
}

/// Tagged event yielded by a running agent's stream (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    Init { session_id: String },
    System { subtype: String, message: String, raw: Option<serde_json::Value> },
    AssistantText { text: String },
    ToolUse { tool_name: String, input: serde_json::Value, tool_use_id: String },
    ToolProgress { tool_name: String, elapsed_seconds: f64 },
    ToolResult { tool_use_id: String, content: String, is_error: bool },
    Result {
        success: bool,
        message: String,
        cost_usd: Option<f64>,
        errors: Option<Vec<String>>,
        error_subtype: Option<String>,
    },
    Error { message: String, code: Option<String> },
}

/// A running (or resumed) agent process and its event stream.
pub struct Handle {
    pub pid: Option<u32>,
    events: Mutex<mpsc::Receiver<AgentEvent>>,
    inject_tx: Option<mpsc::Sender<String>>,
    abort_token: CancellationToken,
    child: Mutex<Option<tokio::process::Child>>,
}

impl Handle {
    /// Receive the next event, or `None` once the stream is exhausted.
    pub async fn recv(&self) -> Option<AgentEvent> {
        self.events.lock().await.recv().await
    }

    pub async fn inject_message(&self, text: &str) -> Result<(), ProviderError> {
        if let Some(tx) = &self.inject_tx {
            tx.send(text.to_string())
                .await
                .map_err(|_| ProviderError::StreamAborted)?;
            Ok(())
        } else {
            Err(ProviderError::StreamAborted)
        }
    }

    pub async fn cancel(&self) {
        self.abort_token.cancel();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
pub trait AgentProvider: Send + Sync {
    async fn spawn(&self, config: SpawnConfig) -> Result<Handle, ProviderError>;
    async fn resume(&self, provider_session_id: &str, config: SpawnConfig) -> Result<Handle, ProviderError>;
}

// ---------------------------------------------------------------------------
// CliAgentProvider — spawns a configured binary, parses NDJSON stdout
// ---------------------------------------------------------------------------

pub struct CliAgentProvider {
    binary: String,
    extra_args: Vec<String>,
}

impl CliAgentProvider {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    async fn spawn_inner(&self, config: SpawnConfig, resume_id: Option<&str>) -> Result<Handle, ProviderError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.extra_args)
            .current_dir(&config.working_dir)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(sid) = resume_id {
            cmd.arg("--resume").arg(sid);
        }
        if config.autonomous {
            cmd.arg("--autonomous");
        }
        if config.sandbox {
            cmd.arg("--sandbox");
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProviderError::SpawnFailed(e.to_string()))?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            ProviderError::SpawnFailed("child process has no stdout handle".into())
        })?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (inject_tx, mut inject_rx) = mpsc::channel::<String>(16);
        let abort_token = config.abort_token.clone();

        if let Some(mut stdin) = stdin {
            let prompt = config.prompt.clone();
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                let _ = stdin.write_all(prompt.as_bytes()).await;
                let _ = stdin.write_all(b"\n").await;
                while let Some(msg) = inject_rx.recv().await {
                    if stdin.write_all(msg.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdin.write_all(b"\n").await;
                }
            });
        }

        let read_token = abort_token.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = read_token.cancelled() => break,
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(raw)) => {
                                match serde_json::from_str::<AgentEvent>(&raw) {
                                    Ok(event) => {
                                        if event_tx.send(event).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => debug!(error = %e, "dropping unparseable agent event line"),
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "error reading agent stdout");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Handle {
            pid,
            events: Mutex::new(event_rx),
            inject_tx: Some(inject_tx),
            abort_token,
            child: Mutex::new(Some(child)),
        })
    }
}

#[async_trait]
impl AgentProvider for CliAgentProvider {
    async fn spawn(&self, config: SpawnConfig) -> Result<Handle, ProviderError> {
        self.spawn_inner(config, None).await
    }

    async fn resume(&self, provider_session_id: &str, config: SpawnConfig) -> Result<Handle, ProviderError> {
        self.spawn_inner(config, Some(provider_session_id)).await
    }
}

// ---------------------------------------------------------------------------
// ScriptedAgentProvider — test double that replays a canned event list
// ---------------------------------------------------------------------------

pub struct ScriptedAgentProvider {
    script: Arc<Vec<AgentEvent>>,
}

impl ScriptedAgentProvider {
    pub fn new(script: Vec<AgentEvent>) -> Self {
        Self {
            script: Arc::new(script),
        }
    }

    async fn replay(&self, abort_token: CancellationToken) -> Handle {
        let (tx, rx) = mpsc::channel(self.script.len().max(1));
        for event in self.script.iter().cloned() {
            let _ = tx.send(event).await;
        }
        drop(tx);
        Handle {
            pid: None,
            events: Mutex::new(rx),
            inject_tx: None,
            abort_token,
            child: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AgentProvider for ScriptedAgentProvider {
    async fn spawn(&self, config: SpawnConfig) -> Result<Handle, ProviderError> {
        Ok(self.replay(config.abort_token).await)
    }

    async fn resume(&self, _provider_session_id: &str, config: SpawnConfig) -> Result<Handle, ProviderError> {
        Ok(self.replay(config.abort_token).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SpawnConfig {
        SpawnConfig {
            prompt: "do the thing".into(),
            working_dir: std::env::temp_dir(),
            env: HashMap::new(),
            abort_token: CancellationToken::new(),
            autonomous: true,
            sandbox: false,
        }
    }

    #[tokio::test]
    async fn scripted_provider_replays_events_in_order() {
        let provider = ScriptedAgentProvider::new(vec![
            AgentEvent::Init { session_id: "p-1".into() },
            AgentEvent::AssistantText { text: "working".into() },
            AgentEvent::Result {
                success: true,
                message: "done".into(),
                cost_usd: Some(0.02),
                errors: None,
                error_subtype: None,
            },
        ]);
        let handle = provider.spawn(cfg()).await.unwrap();
        assert!(matches!(handle.recv().await, Some(AgentEvent::Init { .. })));
        assert!(matches!(handle.recv().await, Some(AgentEvent::AssistantText { .. })));
        assert!(matches!(handle.recv().await, Some(AgentEvent::Result { success: true, .. })));
        assert!(handle.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancel_trips_the_abort_token() {
        let provider = ScriptedAgentProvider::new(vec![]);
        let config = cfg();
        let token = config.abort_token.clone();
        let handle = provider.spawn(config).await.unwrap();
        handle.cancel().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn inject_message_without_channel_errors() {
        let provider = ScriptedAgentProvider::new(vec![]);
        let handle = provider.spawn(cfg()).await.unwrap();
        assert!(handle.inject_message("follow up").await.is_err());
    }
}
