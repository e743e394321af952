//! Task complexity classification.
//!
//! [`ComplexityClassifier`] asks a [`JudgmentService`] for a verdict and falls
//! back to [`detect_complexity`], a deterministic keyword and length
//! heuristic, whenever the service is missing or misbehaves. Classification
//! never fails.

use moka::sync::Cache;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;

use crate::config::ClassifierConfig;
use crate::core::{Complexity, Task};
use crate::orchestration::judgment::{strip_code_fences, truncate_input, JudgmentService};
use crate::{flog, flog_debug, flog_warn, Error, Result};

const TRIVIAL_PATTERNS: &[&str] = &[
    "fix typo",
    "typo",
    "add log",
    "add logging",
    "update comment",
    "fix comment",
    "rename variable",
    "rename function",
    "rename",
    "remove unused",
    "delete unused",
    "bump version",
    "update version",
    "fix import",
    "add import",
    "fix whitespace",
    "formatting",
    "lint fix",
];

const SIMPLE_PATTERNS: &[&str] = &[
    "add field",
    "add property",
    "add parameter",
    "add argument",
    "small fix",
    "minor fix",
    "quick fix",
    "update config",
    "change config",
    "update constant",
    "add constant",
    "add test case",
    "fix test",
];

const COMPLEX_PATTERNS: &[&str] = &[
    "refactor",
    "rewrite",
    "redesign",
    "migrate",
    "migration",
    "architecture",
    "restructure",
    "overhaul",
    "system",
    "database schema",
    "api design",
    "multi-file",
    "cross-cutting",
];

static EPIC_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\[epic\]").unwrap());

static CODE_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```|~~~.*?~~~").unwrap());

static FILE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:^|[\s`])([./]*[\w-]+/)*[\w-]+\.(go|py|js|ts|tsx|jsx|rs|rb|java|c|cpp|h|hpp|yaml|yml|json|md|txt|sh|bash)(?:[\s`]|$)",
    )
    .unwrap()
});

static EPIC_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(epic|roadmap|multi-phase|milestone)\b").unwrap());

// "Phase 1", "## Stage 2"; plain numbered lists are deliberately not counted.
static PHASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^(?:##\s*)?(?:phase|stage|part|milestone)\s+\d+").unwrap()
});

static CHECKBOX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*-\s*\[[xX ]\]").unwrap());

const SYSTEM_PROMPT: &str = r#"You are a task complexity classifier for a software development pipeline. Classify the given issue into exactly one complexity level.

Levels:
- TRIVIAL: Minimal changes like typos, log additions, renames, comment updates
- SIMPLE: Small focused changes: add a field, small fix, single function change
- MEDIUM: Standard feature work: new endpoint, component, integration. Also includes well-scoped issues with clear step-by-step instructions
- COMPLEX: Requires multiple independent components or architectural changes: refactors, migrations, system redesigns
- EPIC: Too large for single execution: multi-phase projects with 5+ distinct phases

A detailed issue with clear step-by-step instructions is well-scoped MEDIUM work, not COMPLEX.

Respond with ONLY a JSON object (no markdown, no explanation):
{"complexity": "TRIVIAL|SIMPLE|MEDIUM|COMPLEX|EPIC", "reason": "brief one-sentence explanation"}"#;

/// Structural measurements of a task description, code blocks excluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalMetrics {
    pub checkbox_count: usize,
    pub phase_count: usize,
    pub word_count: usize,
}

fn strip_code_blocks(text: &str) -> String {
    CODE_BLOCK_RE.replace_all(text, " ").into_owned()
}

fn strip_file_paths(text: &str) -> String {
    FILE_PATH_RE.replace_all(text, " ").into_owned()
}

pub fn extract_signal_metrics(description: &str) -> SignalMetrics {
    let clean = strip_code_blocks(description);
    SignalMetrics {
        checkbox_count: CHECKBOX_RE.find_iter(&clean).count(),
        phase_count: PHASE_RE.find_iter(&clean).count(),
        word_count: clean.split_whitespace().count(),
    }
}

fn detect_epic(title: &str, description: &str, combined: &str) -> bool {
    if EPIC_TAG_RE.is_match(title) {
        return true;
    }

    // Identifiers like EpicPlan or files like epic.rs must not count.
    let clean_combined = strip_file_paths(&strip_code_blocks(combined));
    if EPIC_WORD_RE.is_match(&clean_combined) {
        return true;
    }

    let metrics = extract_signal_metrics(description);
    if metrics.checkbox_count >= 5 || metrics.phase_count >= 3 {
        return true;
    }

    let clean = strip_code_blocks(description).to_lowercase();
    let structural = clean.contains("##")
        || clean.contains("phase")
        || clean.contains("stage")
        || clean.contains("step");
    metrics.word_count > 200 && structural
}

/// Deterministic local complexity estimate.
///
/// Epic indicators are checked first, then trivial, complex and simple
/// keyword lists in that order, then prose length.
pub fn detect_complexity(task: &Task) -> Complexity {
    let combined = format!("{} {}", task.description, task.title).to_lowercase();

    if detect_epic(&task.title, &task.description, &combined) {
        return Complexity::Epic;
    }
    if TRIVIAL_PATTERNS.iter().any(|p| combined.contains(p)) {
        return Complexity::Trivial;
    }
    if COMPLEX_PATTERNS.iter().any(|p| combined.contains(p)) {
        return Complexity::Complex;
    }
    if SIMPLE_PATTERNS.iter().any(|p| combined.contains(p)) {
        return Complexity::Simple;
    }

    match strip_code_blocks(&task.description).split_whitespace().count() {
        n if n < 10 => Complexity::Simple,
        n if n < 50 => Complexity::Medium,
        _ => Complexity::Complex,
    }
}

#[derive(Deserialize)]
struct ClassificationReply {
    complexity: String,
    #[serde(default)]
    reason: String,
}

/// Parse the judgment reply into one of the five levels.
pub fn parse_classification(text: &str) -> Result<Complexity> {
    let reply: ClassificationReply = serde_json::from_str(strip_code_fences(text))?;
    let level = reply
        .complexity
        .parse::<Complexity>()
        .map_err(Error::Judgment)?;
    flog_debug!("classification {} ({})", level, reply.reason);
    Ok(level)
}

/// Classifier with judgment-first, heuristic-fallback semantics and a
/// bounded per-task-ID cache.
pub struct ComplexityClassifier {
    judge: Option<Arc<dyn JudgmentService>>,
    cache: Cache<String, Complexity>,
    max_input_chars: usize,
}

impl ComplexityClassifier {
    /// `judge = None` classifies with the heuristic only.
    pub fn new(judge: Option<Arc<dyn JudgmentService>>, config: &ClassifierConfig) -> Self {
        Self {
            judge,
            cache: Cache::new(config.cache_capacity),
            max_input_chars: config.max_input_chars,
        }
    }

    pub fn heuristic_only(config: &ClassifierConfig) -> Self {
        Self::new(None, config)
    }

    /// Classify `task`. Results are cached by task ID so a retried dispatch
    /// sees the same verdict.
    pub async fn classify(&self, task: &Task, cancel: &CancellationToken) -> Complexity {
        if !task.id.is_empty() {
            if let Some(cached) = self.cache.get(&task.id) {
                flog_debug!("using cached complexity {} for {}", cached, task.id);
                return cached;
            }
        }

        let level = match &self.judge {
            Some(judge) => match self.ask(judge.as_ref(), task, cancel).await {
                Ok(level) => {
                    flog!("classified {} as {}", task.id, level);
                    level
                }
                Err(e) => {
                    flog_warn!(
                        "classification failed for {}, falling back to heuristic: {}",
                        task.id,
                        e
                    );
                    detect_complexity(task)
                }
            },
            None => detect_complexity(task),
        };

        if !task.id.is_empty() {
            self.cache.insert(task.id.clone(), level);
        }
        level
    }

    async fn ask(
        &self,
        judge: &dyn JudgmentService,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<Complexity> {
        let content = format!(
            "## Issue Title\n{}\n\n## Issue Description\n{}",
            task.title, task.description
        );
        let content = truncate_input(&content, self.max_input_chars);
        let reply = judge.judge(SYSTEM_PROMPT, &content, cancel).await?;
        parse_classification(&reply)
    }

    /// Number of cached verdicts (approximate while evictions are pending).
    pub fn cached_len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}
