//! Coding-agent backend and task execution.
//!
//! [`ClaudeBackend`] runs Claude Code headless (`-p`) with JSON output and
//! turns the reply into an [`AgentOutcome`]. [`BackendExecutor`] wraps any
//! backend into a [`TaskExecutor`] that runs one task in a working copy and
//! reports the PR it opened and the commit it left.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::Task;
use crate::git::GitOps;
use crate::orchestration::ratelimit::{is_rate_limit_error, parse_rate_limit_error, RateLimitInfo};
use crate::util::{blocking, run_command};
use crate::{flog, flog_debug, flog_warn, Error, Result};

/// Default timeout for one agent run (30 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;

static PR_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://github\.com/[\w.\-]+/[\w.\-]+/pull/\d+").unwrap());

/// One prompt for the agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Planning runs must not edit files.
    pub read_only: bool,
}

/// What the agent reported.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
    /// Set when the failure was a usage-limit rejection with a parseable
    /// reset time.
    pub rate_limit: Option<RateLimitInfo>,
}

impl AgentOutcome {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    /// A failure; rate-limit details are extracted from `message` when present.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        let rate_limit = if is_rate_limit_error(&message) {
            parse_rate_limit_error(&message)
        } else {
            None
        };
        Self {
            success: false,
            error: Some(message),
            rate_limit,
            ..Default::default()
        }
    }
}

/// Black-box coding agent: takes a prompt, edits files in a directory.
#[async_trait]
pub trait CodingAgentBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// Spawn failure, timeout, or cancellation. An agent that ran and
    /// reported failure is `Ok` with `success == false`.
    async fn run(&self, request: &AgentRequest, cancel: &CancellationToken) -> Result<AgentOutcome>;
}

#[derive(Debug, Deserialize)]
struct RawClaudeResponse {
    subtype: Option<String>,
    result: Option<String>,
    session_id: Option<String>,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    num_turns: Option<u32>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Claude Code in headless mode.
#[derive(Debug, Clone)]
pub struct ClaudeBackend {
    binary: PathBuf,
    timeout: Duration,
}

impl ClaudeBackend {
    /// Locate `command` (usually `claude`) on `PATH`.
    pub fn new(command: &str) -> Result<Self> {
        let binary = which::which(command).map_err(|_| Error::BinaryNotFound(command.to_string()))?;
        Ok(Self::with_binary(binary))
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn args(request: &AgentRequest) -> Vec<&str> {
        let mut args = vec!["-p", request.prompt.as_str(), "--output-format", "json"];
        if request.read_only {
            args.extend(["--permission-mode", "plan"]);
        } else {
            args.push("--dangerously-skip-permissions");
        }
        args
    }

    /// Parse the single JSON object printed by `--output-format json`.
    pub fn parse_json_response(json_str: &str) -> Result<AgentOutcome> {
        let raw: RawClaudeResponse = serde_json::from_str(json_str.trim())?;

        let failed = raw.is_error
            || raw.subtype.as_deref().is_some_and(|s| s.starts_with("error"))
            || (raw.subtype.is_none() && raw.result.is_none());

        let mut outcome = if failed {
            let message = raw
                .error
                .or(raw.result)
                .unwrap_or_else(|| "Unknown response format".to_string());
            AgentOutcome::failed(message)
        } else {
            AgentOutcome::succeeded(raw.result.unwrap_or_default())
        };
        outcome.session_id = raw.session_id;
        outcome.cost_usd = raw.total_cost_usd;
        outcome.duration_ms = raw.duration_ms;
        outcome.num_turns = raw.num_turns;
        Ok(outcome)
    }
}

#[async_trait]
impl CodingAgentBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn run(&self, request: &AgentRequest, cancel: &CancellationToken) -> Result<AgentOutcome> {
        flog_debug!(
            "ClaudeBackend::run dir={} read_only={} prompt_len={}",
            request.working_dir.display(),
            request.read_only,
            request.prompt.len()
        );
        let output = run_command(
            &self.binary,
            &Self::args(request),
            &request.working_dir,
            self.timeout,
            cancel,
        )
        .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Ok(outcome) = Self::parse_json_response(&stdout) {
            return Ok(outcome);
        }

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "claude exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Ok(AgentOutcome::failed(message));
        }

        Ok(AgentOutcome::succeeded(stdout.trim()))
    }
}

/// Result of executing one task.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub pr_url: Option<String>,
    pub commit_sha: Option<String>,
    pub rate_limit: Option<RateLimitInfo>,
}

/// Runs one task to completion in a working directory.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task, working_dir: &Path, cancel: &CancellationToken) -> Result<ExecutionResult>;
}

/// First GitHub pull request URL in `text`.
pub fn find_pr_url(text: &str) -> Option<String> {
    PR_URL_RE.find(text).map(|m| m.as_str().to_string())
}

/// Prompt for executing a task on its branch.
pub fn build_execution_prompt(task: &Task) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("# Task: {}\n\n", task.title));
    if !task.description.is_empty() {
        prompt.push_str(&task.description);
        prompt.push_str("\n\n");
    }
    prompt.push_str("## Instructions\n\n");
    if !task.branch.is_empty() {
        prompt.push_str(&format!(
            "- You are on branch `{}`. Keep all work on this branch.\n",
            task.branch
        ));
    }
    prompt.push_str("- Implement the task completely and run the relevant tests.\n");
    prompt.push_str("- Commit your changes with a descriptive message.\n");
    if task.create_pr {
        prompt.push_str("- Push the branch and open a pull request with `gh pr create`. Print the PR URL.\n");
    } else {
        prompt.push_str("- Do not open a pull request.\n");
    }
    prompt
}

/// [`TaskExecutor`] that hands the task to a coding agent.
pub struct BackendExecutor<B> {
    backend: B,
}

impl<B: CodingAgentBackend> BackendExecutor<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: CodingAgentBackend> TaskExecutor for BackendExecutor<B> {
    async fn execute(&self, task: &Task, working_dir: &Path, cancel: &CancellationToken) -> Result<ExecutionResult> {
        flog!("Executing {} via {} in {}", task.id, self.backend.name(), working_dir.display());
        if !task.branch.is_empty() {
            let git = GitOps::new(working_dir)?;
            git.run_checked(working_dir, &["checkout", "-B", &task.branch], cancel)
                .await?;
        }
        let request = AgentRequest {
            prompt: build_execution_prompt(task),
            working_dir: working_dir.to_path_buf(),
            read_only: false,
        };
        let outcome = self.backend.run(&request, cancel).await?;

        let dir = working_dir.to_path_buf();
        let commit_sha = match blocking(move || GitOps::head_commit(&dir)).await {
            Ok(sha) => Some(sha),
            Err(e) => {
                flog_warn!("No HEAD commit for {}: {}", task.id, e);
                None
            }
        };

        Ok(ExecutionResult {
            success: outcome.success,
            pr_url: find_pr_url(&outcome.output),
            output: outcome.output,
            error: outcome.error,
            commit_sha,
            rate_limit: outcome.rate_limit,
        })
    }
}
