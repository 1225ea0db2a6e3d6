//! Supervisor-state writer — the `.agent/` directory inside a session's
//! scratch working tree (spec §3/§6). This is the orchestrator's own
//! crash-recovery record: authoritative for a single worktree, never shared
//! across nodes (that's what the `Store` abstraction is for).
//!
//! All structured writes (`state.json`, `heartbeat.json`, `todos.json`) are
//! atomic: write to a `.tmp` sibling, then rename over the target, so a
//! reader never observes a half-written file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use at_core::types::{SessionStatus, WorkType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeState {
    pub ticket_id: String,
    pub provider_session_id: Option<String>,
    pub work_type: WorkType,
    pub status: SessionStatus,
    pub phase: String,
    pub recovery_attempts: u32,
    pub pid: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatState {
    pub timestamp: DateTime<Utc>,
    pub memory_mb: Option<u64>,
    pub uptime_secs: u64,
    pub last_activity: DateTime<Utc>,
    pub tool_call_count: u64,
}

/// Owns the `.agent/` directory for one worktree.
#[derive(Debug, Clone)]
pub struct SupervisorStateDir {
    root: PathBuf,
}

impl SupervisorStateDir {
    pub fn new(worktree_path: impl AsRef<Path>) -> Self {
        Self {
            root: worktree_path.as_ref().join(".agent"),
        }
    }

    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn write_state(&self, state: &WorktreeState) -> io::Result<()> {
        self.write_json("state.json", state)
    }

    pub fn read_state(&self) -> io::Result<Option<WorktreeState>> {
        self.read_json("state.json")
    }

    pub fn write_heartbeat(&self, hb: &HeartbeatState) -> io::Result<()> {
        self.write_json("heartbeat.json", hb)
    }

    pub fn read_heartbeat(&self) -> io::Result<Option<HeartbeatState>> {
        self.read_json("heartbeat.json")
    }

    /// Half-open: exactly at `timeout` the heartbeat is already stale.
    pub fn is_heartbeat_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        match self.read_heartbeat() {
            Ok(Some(hb)) => now.signed_duration_since(hb.timestamp) >= timeout,
            // No heartbeat at all is treated as stale so recovery can proceed.
            Ok(None) | Err(_) => true,
        }
    }

    pub fn write_todos(&self, todos: &serde_json::Value) -> io::Result<()> {
        self.write_json("todos.json", todos)
    }

    pub fn read_todos(&self) -> io::Result<Option<serde_json::Value>> {
        self.read_json("todos.json")
    }

    /// Append-only `progress.log`; rotates to `progress.log.1` once the
    /// current file would exceed `max_bytes`.
    pub fn append_progress(&self, event_type: &str, details: &str, max_bytes: u64) -> io::Result<()> {
        let path = self.path("progress.log");
        let line = format!("{}|{}|{}\n", Utc::now().to_rfc3339(), event_type, details);

        if let Ok(meta) = fs::metadata(&path) {
            if meta.len() + line.len() as u64 > max_bytes {
                let rotated = self.path("progress.log.1");
                let _ = fs::rename(&path, rotated);
            }
        }

        use std::io::Write;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())
    }

    /// Append one JSON event per line to the optional `events.jsonl` log
    /// used by the post-hoc log analyser.
    pub fn append_event(&self, event: &serde_json::Value) -> io::Result<()> {
        use std::io::Write;
        let path = self.path("events.jsonl");
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let line = serde_json::to_string(event).unwrap_or_default();
        writeln!(file, "{line}")
    }

    pub fn events_path(&self) -> PathBuf {
        self.path("events.jsonl")
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> io::Result<()> {
        self.ensure()?;
        let path = self.path(name);
        let tmp = self.path(&format!("{name}.tmp"));
        let payload = serde_json::to_vec_pretty(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &path)
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, name: &str) -> io::Result<Option<T>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
