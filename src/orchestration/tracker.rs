//! Issue tracker access.
//!
//! The orchestrator only needs three operations: create, comment, close.
//! [`GhTracker`] implements them with the GitHub CLI, run in the project
//! directory so `gh` resolves the repository from its git remote.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::util::run_command;
use crate::{flog_debug, Error, Result};

static ISSUE_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/issues/(\d+)").unwrap());

/// Extract the issue number from a tracker URL such as
/// `https://github.com/o/r/issues/123`.
pub fn parse_issue_number(url: &str) -> Option<u64> {
    ISSUE_NUMBER_RE
        .captures(url)
        .and_then(|c| c[1].parse().ok())
        .filter(|&n| n > 0)
}

/// Extract the PR number from a URL ending in `/pull/N` (optionally followed
/// by more path segments).
pub fn parse_pr_number(url: &str) -> Option<u64> {
    let idx = url.rfind("/pull/")?;
    let rest = url[idx + "/pull/".len()..].trim();
    let digits = rest.split('/').next()?;
    digits.parse().ok().filter(|&n| n > 0)
}

/// Tracker reference suitable for `gh`: `GH-42` becomes `42`.
pub fn issue_ref(id: &str) -> &str {
    id.strip_prefix("GH-").unwrap_or(id)
}

/// Create/comment/close against an issue tracker.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Create an issue and return its URL.
    async fn create_issue(
        &self,
        project: &Path,
        title: &str,
        body: &str,
        labels: &[String],
        cancel: &CancellationToken,
    ) -> Result<String>;

    async fn comment(&self, project: &Path, issue: &str, body: &str, cancel: &CancellationToken) -> Result<()>;

    async fn close(&self, project: &Path, issue: &str, comment: &str, cancel: &CancellationToken) -> Result<()>;
}

/// GitHub tracker backed by the `gh` binary.
#[derive(Debug, Clone)]
pub struct GhTracker {
    binary: PathBuf,
    timeout: Duration,
}

impl GhTracker {
    /// Locate `gh` on `PATH`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let binary = which::which("gh").map_err(|_| Error::BinaryNotFound("gh".to_string()))?;
        Ok(Self { binary, timeout })
    }

    pub fn with_binary(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    async fn gh(&self, project: &Path, args: &[&str], cancel: &CancellationToken) -> Result<String> {
        flog_debug!("gh {}", args.first().copied().unwrap_or_default());
        let out = run_command(&self.binary, args, project, self.timeout, cancel).await?;
        if !out.status.success() {
            return Err(Error::Tracker(format!(
                "gh {} failed: {}",
                args.iter().take(2).copied().collect::<Vec<_>>().join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

#[async_trait]
impl IssueTracker for GhTracker {
    async fn create_issue(
        &self,
        project: &Path,
        title: &str,
        body: &str,
        labels: &[String],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut args = vec!["issue", "create", "--title", title, "--body", body];
        for label in labels {
            args.push("--label");
            args.push(label);
        }
        // gh prints the new issue URL
        self.gh(project, &args, cancel).await
    }

    async fn comment(&self, project: &Path, issue: &str, body: &str, cancel: &CancellationToken) -> Result<()> {
        self.gh(project, &["issue", "comment", issue_ref(issue), "--body", body], cancel)
            .await
            .map(|_| ())
    }

    async fn close(&self, project: &Path, issue: &str, comment: &str, cancel: &CancellationToken) -> Result<()> {
        self.gh(project, &["issue", "close", issue_ref(issue), "--comment", comment], cancel)
            .await
            .map(|_| ())
    }
}
