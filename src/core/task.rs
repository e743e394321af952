//! Task data model.
//!
//! A [`Task`] is the unit of work handed to the coding agent. It is built by
//! the caller (or derived from a parent during decomposition and epic
//! execution) and treated as immutable once dispatched.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a task came from, when it originated in an issue tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Tracker name, e.g. `github`.
    pub adapter: String,
    /// Tracker-native identifier, e.g. `42` or `ENG-17`.
    pub issue_id: String,
    /// Repository or project slug on the tracker side.
    pub repo: Option<String>,
}

/// A single unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier, e.g. `GH-42`. Used as the cache and queue key.
    pub id: String,
    pub title: String,
    pub description: String,
    /// Repository (or isolated worktree) the task operates on.
    pub project_path: PathBuf,
    /// Branch the work is committed to.
    pub branch: String,
    /// Branch the work is cut from; empty means the repository default.
    #[serde(default)]
    pub base_branch: String,
    /// Whether execution should finish by opening a pull request.
    #[serde(default)]
    pub create_pr: bool,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub source: Option<SourceRef>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_project(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = path.into();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_create_pr(mut self, create_pr: bool) -> Self {
        self.create_pr = create_pr;
        self
    }

    /// Case-insensitive label lookup.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }

    /// Tracker reference used when posting comments about this task.
    ///
    /// Falls back to the task ID when there is no source metadata.
    pub fn tracker_ref(&self) -> String {
        match &self.source {
            Some(src) if !src.issue_id.is_empty() => src.issue_id.clone(),
            _ => self.id.clone(),
        }
    }
}
