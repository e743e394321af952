//! Structural task decomposition.
//!
//! [`TaskDecomposer`] runs a short-circuiting gate (enabled, skip label,
//! complexity threshold, description length) and then tries extraction
//! strategies in a fixed priority. The first strategy yielding at least two
//! fragments wins; each fragment becomes an ordered child [`Task`].

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::config::DecomposeConfig;
use crate::core::{Complexity, Task};
use crate::orchestration::complexity::detect_complexity;
use crate::orchestration::plan::PlannedSubtask;
use crate::util::{truncate_title, word_count};
use crate::flog_debug;

const SUBTASK_TITLE_LIMIT: usize = 80;

static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\d+[.)]\s+(.+)$").unwrap());

static STEP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^\s*step\s+\d+[:\s]+(.+)$").unwrap());

static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-*•]\s+(.+)$").unwrap());

static CRITERIA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-*]?\s*\[\s*\]\s+(.+)$").unwrap());

static SOURCE_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([\w\-]+(?:/[\w\-]+)*\.(?:go|py|ts|tsx|js|jsx|rs|java|rb))\b").unwrap()
});

/// Which extraction strategy produced the fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStrategy {
    NumberedSteps,
    BulletPoints,
    AcceptanceCriteria,
    FileGroups,
}

/// Outcome of [`TaskDecomposer::decompose`].
///
/// When `decomposed` is false, `subtasks` holds exactly the original task.
#[derive(Debug, Clone)]
pub struct DecomposeResult {
    pub decomposed: bool,
    pub subtasks: Vec<Task>,
    pub reason: String,
    pub strategy: Option<SplitStrategy>,
}

impl DecomposeResult {
    fn unchanged(task: &Task, reason: impl Into<String>) -> Self {
        Self {
            decomposed: false,
            subtasks: vec![task.clone()],
            reason: reason.into(),
            strategy: None,
        }
    }
}

pub struct TaskDecomposer {
    config: DecomposeConfig,
}

impl TaskDecomposer {
    pub fn new(config: DecomposeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecomposeConfig {
        &self.config
    }

    /// Decompose using the local complexity heuristic.
    pub fn decompose(&self, task: &Task) -> DecomposeResult {
        self.decompose_with(task, detect_complexity(task))
    }

    /// Decompose with a complexity verdict supplied by the caller, typically
    /// from [`ComplexityClassifier`](crate::orchestration::ComplexityClassifier).
    pub fn decompose_with(&self, task: &Task, complexity: Complexity) -> DecomposeResult {
        if !self.config.enabled {
            return DecomposeResult::unchanged(task, "decomposition disabled");
        }
        if task.has_label(&self.config.skip_label) {
            return DecomposeResult::unchanged(
                task,
                format!("task labeled {}", self.config.skip_label),
            );
        }
        if !complexity.is_epic() && complexity < self.config.min_complexity {
            return DecomposeResult::unchanged(
                task,
                format!("complexity below threshold: {}", complexity),
            );
        }
        if word_count(&task.description) < self.config.min_description_words {
            return DecomposeResult::unchanged(task, "description too short for decomposition");
        }

        let Some((strategy, fragments)) = split_fragments(&task.description) else {
            return DecomposeResult::unchanged(task, "no decomposition points found");
        };

        let planned: Vec<PlannedSubtask> = fragments
            .into_iter()
            .take(self.config.effective_max_subtasks())
            .enumerate()
            .map(|(i, text)| PlannedSubtask::new(i as u32 + 1, text, ""))
            .collect();

        flog_debug!(
            "decomposed {} into {} subtasks via {:?}",
            task.id,
            planned.len(),
            strategy
        );

        DecomposeResult {
            decomposed: true,
            subtasks: build_child_tasks(task, &planned),
            reason: format!("decomposed into {} subtasks", planned.len()),
            strategy: Some(strategy),
        }
    }
}

/// Run the strategies in priority order; the first with two or more
/// non-empty fragments wins.
pub fn split_fragments(text: &str) -> Option<(SplitStrategy, Vec<String>)> {
    let strategies: [(SplitStrategy, fn(&str) -> Vec<String>); 4] = [
        (SplitStrategy::NumberedSteps, extract_numbered_steps),
        (SplitStrategy::BulletPoints, extract_bullet_points),
        (SplitStrategy::AcceptanceCriteria, extract_acceptance_criteria),
        (SplitStrategy::FileGroups, extract_file_groups),
    ];
    strategies.into_iter().find_map(|(strategy, extract)| {
        let parts: Vec<String> = extract(text)
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        (parts.len() >= 2).then_some((strategy, parts))
    })
}

fn captures(re: &Regex, text: &str) -> Vec<String> {
    re.captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

fn extract_numbered_steps(text: &str) -> Vec<String> {
    [&*NUMBERED_RE, &*STEP_RE]
        .into_iter()
        .map(|re| captures(re, text))
        .find(|parts| parts.len() >= 2)
        .unwrap_or_default()
}

fn extract_bullet_points(text: &str) -> Vec<String> {
    captures(&BULLET_RE, text)
        .into_iter()
        .filter(|item| !item.starts_with("[x]") && !item.starts_with("[X]"))
        .map(|item| item.strip_prefix("[ ] ").map(str::to_string).unwrap_or(item))
        .collect()
}

fn extract_acceptance_criteria(text: &str) -> Vec<String> {
    captures(&CRITERIA_RE, text)
}

fn extract_file_groups(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    SOURCE_FILE_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|path| seen.insert(*path))
        .map(|path| format!("Implement changes in {}", path))
        .collect()
}

/// Turn planned fragments into child tasks of `parent`.
///
/// Only the last child inherits `create_pr`; earlier children are
/// intermediate work.
pub fn build_child_tasks(parent: &Task, planned: &[PlannedSubtask]) -> Vec<Task> {
    let total = planned.len();
    planned
        .iter()
        .enumerate()
        .map(|(i, st)| {
            let index = i + 1;
            let objective = if st.description.is_empty() {
                st.title.as_str()
            } else {
                st.description.as_str()
            };
            Task {
                id: format!("{}-{}", parent.id, index),
                title: truncate_title(&st.title.replace(['\r', '\n'], " "), SUBTASK_TITLE_LIMIT),
                description: subtask_description(parent, objective, index, total),
                project_path: parent.project_path.clone(),
                branch: parent.branch.clone(),
                base_branch: parent.base_branch.clone(),
                create_pr: index == total && parent.create_pr,
                labels: parent.labels.clone(),
                source: parent.source.clone(),
            }
        })
        .collect()
}

fn subtask_description(parent: &Task, objective: &str, index: usize, total: usize) -> String {
    let mut out = format!(
        "## Subtask {} of {}\n\n**Parent Task:** {} - {}\n\n## Objective\n\n{}\n\n",
        index, total, parent.id, parent.title, objective
    );
    out.push_str("## Context\n\n");
    out.push_str("This is part of a larger task that has been decomposed for better execution.\n");
    out.push_str("Focus on this specific objective. Other subtasks will handle the remaining work.\n\n");
    if index == total {
        out.push_str(
            "**Note:** This is the final subtask. Ensure all previous subtasks are complete before finishing.\n",
        );
    }
    out
}
