use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::Complexity;
use crate::{flog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Coding agent binary; defaults to `claude`.
    pub command: Option<String>,
    #[serde(default)]
    pub decompose: DecomposeConfig,
    #[serde(default)]
    pub worktree: WorktreeConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub judgment: JudgmentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub epic: EpicConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecomposeConfig {
    pub enabled: bool,
    pub min_complexity: Complexity,
    pub max_subtasks: usize,
    pub min_description_words: usize,
    pub skip_label: String,
}

impl Default for DecomposeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_complexity: Complexity::Complex,
            max_subtasks: 5,
            min_description_words: 50,
            skip_label: "no-decompose".to_string(),
        }
    }
}

impl DecomposeConfig {
    /// Subtask cap clamped to the supported range of 2..=10.
    pub fn effective_max_subtasks(&self) -> usize {
        self.max_subtasks.clamp(2, 10)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Number of worktrees pre-created at startup. Zero disables pooling.
    pub pool_size: usize,
    /// Directory holding every managed worktree; the OS temp dir when unset.
    pub root_dir: Option<String>,
    pub remote: String,
    pub default_branch: String,
    /// Ref new branches are cut from; `<remote>/<default_branch>` when unset.
    pub base_ref: Option<String>,
    pub command_timeout_secs: u64,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            pool_size: 0,
            root_dir: None,
            remote: "origin".to_string(),
            default_branch: "main".to_string(),
            base_ref: None,
            command_timeout_secs: 120,
        }
    }
}

impl WorktreeConfig {
    pub fn effective_root(&self) -> PathBuf {
        match &self.root_dir {
            Some(dir) => expand_tilde(dir),
            None => std::env::temp_dir(),
        }
    }

    pub fn effective_base_ref(&self) -> String {
        self.base_ref
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.remote, self.default_branch))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub cache_capacity: u64,
    pub max_input_chars: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1024,
            max_input_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgmentConfig {
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for JudgmentConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-5-haiku-latest".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            timeout_secs: 10,
            max_tokens: 1024,
        }
    }
}

impl JudgmentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub check_interval_secs: u64,
    pub retry_buffer_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            retry_buffer_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn retry_buffer(&self) -> Duration {
        Duration::from_secs(self.retry_buffer_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpicConfig {
    pub issue_label: String,
    pub branch_prefix: String,
    pub title_limit: usize,
}

impl Default for EpicConfig {
    fn default() -> Self {
        Self {
            issue_label: "foreman".to_string(),
            branch_prefix: "foreman/".to_string(),
            title_limit: 80,
        }
    }
}

impl Config {
    pub fn foreman_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::foreman_dir()?.join("foreman.toml"))
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        flog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            flog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config = Self::from_toml(&fs::read_to_string(&path)?)?;
        flog_debug!(
            "Config loaded: decompose.enabled={}, pool_size={}, command={:?}",
            config.decompose.enabled,
            config.worktree.pool_size,
            config.command
        );
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = Self::foreman_dir()?;
        let root = self.worktree.effective_root();
        for d in [&dir, &root] {
            if !d.exists() {
                flog_debug!("Creating directory: {}", d.display());
                fs::create_dir_all(d)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
