//! Scratch working-tree lifecycle for a claimed session.
//!
//! Each claimed session gets its own `git worktree` checked out under a
//! configured worktrees root, named `<ticket-identifier>-<WORKTYPE-suffix>`
//! (spec §4.8 step 1). All mutation goes through the external `git` binary
//! via [`GitRunner`], never through the main working tree directly.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::types::WorkType;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeManagerError {
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worktree path {0} escapes the configured worktrees root")]
    OutsideRoot(String),
    #[error("worktree already exists: {0}")]
    AlreadyExists(String),
}

pub type Result<T> = std::result::Result<T, WorktreeManagerError>;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI invocations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Real git runner that shells out to the configured VCS binary.
pub struct RealGitRunner {
    binary: String,
}

impl RealGitRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for RealGitRunner {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new(&self.binary)
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// WorktreeHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeHandle {
    pub identifier: String,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
}

/// `<ticket-identifier>-<WORKTYPE suffix>`, per spec §4.8 step 1.
pub fn worktree_identifier(ticket_identifier: &str, work_type: WorkType) -> String {
    format!("{ticket_identifier}-{}", work_type.suffix())
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

/// Owns the scratch-working-tree lifecycle for the orchestrator: creation,
/// best-effort dependency linking, the incomplete-work check used before
/// removal, and removal itself.
pub struct WorktreeManager {
    main_repo: PathBuf,
    worktrees_root: PathBuf,
    git: Box<dyn GitRunner>,
}

impl WorktreeManager {
    pub fn new(main_repo: impl Into<PathBuf>, worktrees_root: impl Into<PathBuf>) -> Self {
        Self::with_git_runner(main_repo, worktrees_root, Box::new(RealGitRunner::default()))
    }

    pub fn with_git_runner(
        main_repo: impl Into<PathBuf>,
        worktrees_root: impl Into<PathBuf>,
        git: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            main_repo: main_repo.into(),
            worktrees_root: worktrees_root.into(),
            git,
        }
    }

    fn path_for(&self, identifier: &str) -> Result<PathBuf> {
        let path = self.worktrees_root.join(identifier);
        // Guard: the computed path must stay inside the configured worktrees
        // root even for a maliciously-crafted ticket identifier.
        let normalized = normalize(&path);
        let root_normalized = normalize(&self.worktrees_root);
        if !normalized.starts_with(&root_normalized) {
            return Err(WorktreeManagerError::OutsideRoot(path.display().to_string()));
        }
        Ok(path)
    }

    /// Path a worktree for `ticket_identifier`/`work_type` would occupy,
    /// without touching the filesystem.
    pub fn identifier_path(&self, ticket_identifier: &str, work_type: WorkType) -> Result<PathBuf> {
        self.path_for(&worktree_identifier(ticket_identifier, work_type))
    }

    /// Attach to a worktree left behind by a crashed prior run, if its
    /// directory still exists on disk. Used by the orchestrator's recovery
    /// path instead of `create`, which would fail with `AlreadyExists`.
    pub fn attach_existing(&self, ticket_identifier: &str, work_type: WorkType) -> Option<WorktreeHandle> {
        let identifier = worktree_identifier(ticket_identifier, work_type);
        let path = self.path_for(&identifier).ok()?;
        if !path.exists() {
            return None;
        }
        Some(WorktreeHandle {
            identifier: identifier.clone(),
            branch: format!("agent/{identifier}"),
            path,
            created_at: Utc::now(),
        })
    }

    /// Create the scratch working tree at
    /// `<worktrees-root>/<ticket-identifier>-<WORKTYPE suffix>`, branched
    /// from the main repository's current `HEAD`.
    pub async fn create(&self, ticket_identifier: &str, work_type: WorkType) -> Result<WorktreeHandle> {
        let identifier = worktree_identifier(ticket_identifier, work_type);
        let path = self.path_for(&identifier)?;

        if path.exists() {
            return Err(WorktreeManagerError::AlreadyExists(path.display().to_string()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let branch = format!("agent/{identifier}");
        let main_repo_str = self.main_repo.to_str().unwrap_or(".");
        let path_str = path.to_str().unwrap_or(".");

        info!(identifier = %identifier, branch = %branch, path = %path.display(), "creating scratch worktree");

        let output = self
            .git
            .run_git(main_repo_str, &["worktree", "add", "-b", &branch, path_str, "HEAD"])
            .map_err(WorktreeManagerError::GitCommand)?;

        if !output.success {
            return Err(WorktreeManagerError::GitCommand(output.stderr));
        }

        Ok(WorktreeHandle {
            identifier,
            path,
            branch,
            created_at: Utc::now(),
        })
    }

    /// Best-effort link of the main repository's dependency tree into the
    /// new worktree by symlinking `dep_dir` (e.g. `node_modules`); falls
    /// back to running `install_cmd` inside the worktree only if the
    /// symlink attempt fails (spec §4.8 step 2).
    pub fn link_dependencies(&self, handle: &WorktreeHandle, dep_dir: &str, install_cmd: Option<(&str, &[&str])>) {
        let source = self.main_repo.join(dep_dir);
        if !source.exists() {
            return;
        }
        let target = handle.path.join(dep_dir);
        let symlink_result = symlink(&source, &target);
        match symlink_result {
            Ok(()) => {
                info!(dep_dir, worktree = %handle.identifier, "linked dependency tree via symlink");
            }
            Err(e) => {
                warn!(dep_dir, error = %e, worktree = %handle.identifier, "symlink failed, falling back to native install");
                if let Some((cmd, args)) = install_cmd {
                    let status = std::process::Command::new(cmd)
                        .args(args)
                        .current_dir(&handle.path)
                        .status();
                    if let Err(e) = status {
                        warn!(error = %e, worktree = %handle.identifier, "fallback dependency install failed");
                    }
                }
            }
        }
    }

    /// Uncommitted changes *or* unpushed commits *or* branch not pushed to
    /// remote at all — any of these means the worktree holds recoverable
    /// work that cleanup must not silently discard (spec §4.8 step 9).
    pub fn has_incomplete_work(&self, handle: &WorktreeHandle) -> Result<bool> {
        let path_str = handle.path.to_str().unwrap_or(".");

        let status = self
            .git
            .run_git(path_str, &["status", "--porcelain"])
            .map_err(WorktreeManagerError::GitCommand)?;
        if !status.stdout.trim().is_empty() {
            return Ok(true);
        }

        let remote_branches = self
            .git
            .run_git(path_str, &["ls-remote", "--heads", "origin", &handle.branch])
            .map_err(WorktreeManagerError::GitCommand)?;
        if remote_branches.stdout.trim().is_empty() {
            // branch not pushed to remote at all
            return Ok(true);
        }

        let unpushed = self.git.run_git(
            path_str,
            &["rev-list", "--count", &format!("origin/{}..HEAD", handle.branch)],
        );
        if let Ok(output) = unpushed {
            if output.success {
                let count: i64 = output.stdout.trim().parse().unwrap_or(0);
                if count > 0 {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Remove the worktree. Never touches the main working tree: the
    /// command always targets `handle.path`, resolved through `main_repo`.
    pub fn remove(&self, handle: &WorktreeHandle) -> Result<()> {
        let main_repo_str = self.main_repo.to_str().unwrap_or(".");
        let path_str = handle.path.to_str().unwrap_or(".");

        info!(identifier = %handle.identifier, "removing scratch worktree");

        let output = self
            .git
            .run_git(main_repo_str, &["worktree", "remove", "--force", path_str])
            .map_err(WorktreeManagerError::GitCommand)?;

        if !output.success {
            warn!(identifier = %handle.identifier, stderr = %output.stderr, "git worktree remove failed");
            // Fall back to a plain directory removal so a dangling
            // administrative record in `.git/worktrees` doesn't leave the
            // scratch directory itself on disk.
            if handle.path.exists() {
                std::fs::remove_dir_all(&handle.path)?;
            }
        }

        Ok(())
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

#[cfg(unix)]
fn symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(not(unix))]
fn symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(source, target)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockGitRunner {
        responses: Mutex<Vec<GitOutput>>,
        commands: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl MockGitRunner {
        fn new(responses: Vec<GitOutput>) -> Self {
            Self {
                responses: Mutex::new(responses),
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    impl GitRunner for MockGitRunner {
        fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
            self.commands
                .lock()
                .unwrap()
                .push((dir.to_string(), args.iter().map(|s| s.to_string()).collect()));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(GitOutput {
                    success: true,
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            Ok(responses.remove(0))
        }
    }

    fn ok(stdout: &str) -> GitOutput {
        GitOutput {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn worktree_identifier_uses_ticket_and_suffix() {
        assert_eq!(worktree_identifier("ENG-42", WorkType::Development), "ENG-42-DEV");
        assert_eq!(
            worktree_identifier("ENG-42", WorkType::QaCoordination),
            "ENG-42-QA-COORD"
        );
    }

    #[tokio::test]
    async fn create_rejects_path_escaping_root() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorktreeManager::with_git_runner(
            tmp.path(),
            tmp.path().join("worktrees"),
            Box::new(MockGitRunner::new(vec![])),
        );
        // A ticket identifier containing `..` must not let the worktree
        // escape the configured root.
        let err = mgr.create("../../etc", WorkType::Development).await.unwrap_err();
        assert!(matches!(err, WorktreeManagerError::OutsideRoot(_)));
    }

    #[tokio::test]
    async fn create_invokes_git_worktree_add() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = MockGitRunner::new(vec![ok("")]);
        let mgr = WorktreeManager::with_git_runner(tmp.path(), tmp.path().join("worktrees"), Box::new(runner));
        let handle = mgr.create("ENG-1", WorkType::Development).await.unwrap();
        assert_eq!(handle.identifier, "ENG-1-DEV");
        assert_eq!(handle.branch, "agent/ENG-1-DEV");
        assert!(handle.path.starts_with(tmp.path().join("worktrees")));
    }

    #[tokio::test]
    async fn incomplete_work_detects_uncommitted_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = MockGitRunner::new(vec![ok(" M src/main.rs\n")]);
        let mgr = WorktreeManager::with_git_runner(tmp.path(), tmp.path().join("worktrees"), Box::new(runner));
        let handle = WorktreeHandle {
            identifier: "ENG-1-DEV".into(),
            path: tmp.path().to_path_buf(),
            branch: "agent/ENG-1-DEV".into(),
            created_at: Utc::now(),
        };
        assert!(mgr.has_incomplete_work(&handle).unwrap());
    }

    #[tokio::test]
    async fn incomplete_work_detects_unpushed_branch() {
        let tmp = tempfile::tempdir().unwrap();
        // clean status, empty ls-remote (branch never pushed)
        let runner = MockGitRunner::new(vec![ok(""), ok("")]);
        let mgr = WorktreeManager::with_git_runner(tmp.path(), tmp.path().join("worktrees"), Box::new(runner));
        let handle = WorktreeHandle {
            identifier: "ENG-1-DEV".into(),
            path: tmp.path().to_path_buf(),
            branch: "agent/ENG-1-DEV".into(),
            created_at: Utc::now(),
        };
        assert!(mgr.has_incomplete_work(&handle).unwrap());
    }

    #[tokio::test]
    async fn incomplete_work_false_when_clean_and_fully_pushed() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = MockGitRunner::new(vec![ok(""), ok("refs/heads/agent/ENG-1-DEV\n"), ok("0\n")]);
        let mgr = WorktreeManager::with_git_runner(tmp.path(), tmp.path().join("worktrees"), Box::new(runner));
        let handle = WorktreeHandle {
            identifier: "ENG-1-DEV".into(),
            path: tmp.path().to_path_buf(),
            branch: "agent/ENG-1-DEV".into(),
            created_at: Utc::now(),
        };
        assert!(!mgr.has_incomplete_work(&handle).unwrap());
    }
}
