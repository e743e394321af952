use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("git {command} failed: {output}")]
    GitCommand { command: String, output: String },

    #[error("Failed to create worktree at {} after {attempts} attempts: {output}", path.display())]
    WorktreeCreate {
        path: PathBuf,
        attempts: u32,
        output: String,
    },

    #[error("No subtasks could be parsed from planning output: {0}")]
    PlanParse(String),

    #[error("Judgment service error: {0}")]
    Judgment(String),

    #[error("Issue tracker error: {0}")]
    Tracker(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Subtask {index}/{total} failed ({title}): {error}")]
    SubtaskFailed {
        index: usize,
        total: usize,
        title: String,
        error: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
