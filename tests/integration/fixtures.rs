//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories on `main`
//! - Worktree pool configuration rooted in a temp directory
//! - Mock agent backend, issue tracker, and a task executor that commits

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use foreman::config::WorktreeConfig;
use foreman::core::Task;
use foreman::git::GitOps;
use foreman::orchestration::{AgentOutcome, AgentRequest, CodingAgentBackend, ExecutionResult, IssueTracker, TaskExecutor};
use foreman::worktree::WorktreePool;

/// Run git in `dir`, panicking with its stderr on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
    /// Separate directory for managed worktrees.
    pub worktree_root: TempDir,
}

impl TestRepo {
    /// Create a new test repository on `main` with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        git(&path, &["init"]);
        git(&path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);

        std::fs::write(path.join("README.md"), "# Test Repository\n").expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        let worktree_root = TempDir::new().expect("Failed to create worktree root");
        Self {
            temp_dir,
            path,
            worktree_root,
        }
    }

    pub fn root(&self) -> &Path {
        self.worktree_root.path()
    }

    /// Pool config with worktrees under [`root`](Self::root), cut from local `main`.
    pub fn pool_config(&self, pool_size: usize) -> WorktreeConfig {
        WorktreeConfig {
            pool_size,
            root_dir: Some(self.root().to_string_lossy().into_owned()),
            base_ref: Some("main".to_string()),
            ..Default::default()
        }
    }

    pub fn pool(&self, pool_size: usize) -> WorktreePool {
        WorktreePool::new(&self.path, &self.pool_config(pool_size)).expect("Failed to create pool")
    }

    /// Check if a branch exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        !git(&self.path, &["branch", "--list", name]).is_empty()
    }

    /// Paths of every worktree git knows about, main checkout included.
    pub fn worktree_paths(&self) -> Vec<PathBuf> {
        git(&self.path, &["worktree", "list", "--porcelain"])
            .lines()
            .filter_map(|l| l.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect()
    }

    /// Names of managed directories currently under the worktree root.
    pub fn managed_dirs(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.root())
            .expect("Failed to read worktree root")
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("foreman-worktree-"))
            .collect();
        names.sort();
        names
    }

    /// Get GitOps for this repository.
    pub fn git_ops(&self) -> foreman::Result<GitOps> {
        GitOps::new(&self.path)
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Current branch of a working copy; empty when detached.
pub fn current_branch(dir: &Path) -> String {
    git(dir, &["branch", "--show-current"])
}

/// Backend that answers every request with fixed output.
pub struct ScriptedBackend {
    pub output: String,
    pub requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedBackend {
    pub fn new(output: &str) -> Self {
        Self {
            output: output.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CodingAgentBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, request: &AgentRequest, _cancel: &CancellationToken) -> foreman::Result<AgentOutcome> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(AgentOutcome::succeeded(self.output.clone()))
    }
}

/// One call made against [`MockTracker`].
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerCall {
    Create { title: String, labels: Vec<String> },
    Comment { issue: String, body: String },
    Close { issue: String },
}

/// Tracker that numbers issues from 201 and records every call.
#[derive(Default)]
pub struct MockTracker {
    pub calls: Mutex<Vec<TrackerCall>>,
}

impl MockTracker {
    pub fn calls(&self) -> Vec<TrackerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, TrackerCall::Create { .. }))
            .count()
    }

    pub fn closed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TrackerCall::Close { issue } => Some(issue),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl IssueTracker for MockTracker {
    async fn create_issue(
        &self,
        _project: &Path,
        title: &str,
        _body: &str,
        labels: &[String],
        _cancel: &CancellationToken,
    ) -> foreman::Result<String> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(TrackerCall::Create {
            title: title.to_string(),
            labels: labels.to_vec(),
        });
        let n = 200 + calls.iter().filter(|c| matches!(c, TrackerCall::Create { .. })).count();
        Ok(format!("https://github.com/acme/app/issues/{}", n))
    }

    async fn comment(&self, _p: &Path, issue: &str, body: &str, _c: &CancellationToken) -> foreman::Result<()> {
        self.calls.lock().unwrap().push(TrackerCall::Comment {
            issue: issue.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn close(&self, _p: &Path, issue: &str, _body: &str, _c: &CancellationToken) -> foreman::Result<()> {
        self.calls.lock().unwrap().push(TrackerCall::Close {
            issue: issue.to_string(),
        });
        Ok(())
    }
}

/// Executor that checks out the task branch, commits one file per task,
/// and reports a fake pull request. Fails tasks whose title matches
/// `fail_title`.
#[derive(Default)]
pub struct CommittingExecutor {
    pub fail_title: Option<String>,
    pub executed: Mutex<Vec<Task>>,
}

#[async_trait]
impl TaskExecutor for CommittingExecutor {
    async fn execute(
        &self,
        task: &Task,
        working_dir: &Path,
        _cancel: &CancellationToken,
    ) -> foreman::Result<ExecutionResult> {
        self.executed.lock().unwrap().push(task.clone());
        if self.fail_title.as_deref() == Some(task.title.as_str()) {
            return Ok(ExecutionResult {
                success: false,
                error: Some("agent gave up".to_string()),
                ..Default::default()
            });
        }

        if !task.branch.is_empty() {
            git(working_dir, &["checkout", "-B", &task.branch]);
        }
        let file = format!("{}.txt", task.id);
        std::fs::write(working_dir.join(&file), &task.description)?;
        git(working_dir, &["add", &file]);
        git(working_dir, &["commit", "-m", &task.title]);
        let sha = git(working_dir, &["rev-parse", "HEAD"]);

        let n = task.id.trim_start_matches("GH-");
        Ok(ExecutionResult {
            success: true,
            output: format!("Opened https://github.com/acme/app/pull/{}", n),
            pr_url: Some(format!("https://github.com/acme/app/pull/{}", n)),
            commit_sha: Some(sha),
            ..Default::default()
        })
    }
}
