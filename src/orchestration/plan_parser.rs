//! Planning output parsing.
//!
//! Free-form planner prose is turned into ordered [`PlannedSubtask`]s by an
//! ordered chain of [`SubtaskExtractor`]s: structured extraction through the
//! judgment service first, then line-oriented regex extraction. The first
//! stage returning a non-empty list wins. If every stage comes back empty
//! the parser reports [`Error::PlanParse`] rather than guessing.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;

use crate::orchestration::judgment::{strip_code_fences, JudgmentService};
use crate::orchestration::plan::PlannedSubtask;
use crate::{flog_debug, flog_warn, Error, Result};

/// `1.`, `2)`, `### 3:`, `- **4.`, `Step 5:`, `Phase 6.` ...
static NUMBERED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#{1,6}\s+)?(?:[-*]\s+)?\**(?:step|phase|task)?\s*(\d+)[.):]\s*(.+)")
        .unwrap()
});

/// `## Phase 1 — Title`, `**Part 2** Title`: keyword wording without
/// punctuation directly after the number.
static KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:#{1,6}\s+)?(?:[-*]\s+)?\**(?:step|phase|task|part|stage)\s+(\d+)\**\s*(?:[-–—:.)]\s*)?(.+)",
    )
    .unwrap()
});

const TITLE_SEPARATORS: [&str; 4] = [" — ", " - ", ": ", " – "];

const STRUCTURED_SYSTEM_PROMPT: &str = r#"Extract the ordered implementation subtasks from this planning output. Return ONLY a JSON array, no markdown. Each element must have: "order" (integer, 1-based), "title" (string), "description" (string), "depends_on" (array of order integers this subtask needs first, may be empty).

Example:
[{"order": 1, "title": "Set up database", "description": "Create tables and migrations", "depends_on": []}, {"order": 2, "title": "Add API endpoints", "description": "REST endpoints for CRUD operations", "depends_on": [1]}]"#;

/// One stage of the parsing chain.
#[async_trait]
pub trait SubtaskExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// An empty list means "nothing found here, try the next stage".
    async fn extract(&self, output: &str, cancel: &CancellationToken) -> Result<Vec<PlannedSubtask>>;
}

/// Split `text` into title and description at the first separator found,
/// trying an em dash, a spaced hyphen, a colon and an en dash in that order.
pub fn split_title_description(text: &str) -> (String, String) {
    let cleaned = text.replace("**", "");
    for sep in TITLE_SEPARATORS {
        if let Some(idx) = cleaned.find(sep) {
            if idx > 0 {
                return (
                    cleaned[..idx].trim().to_string(),
                    cleaned[idx + sep.len()..].trim().to_string(),
                );
            }
        }
    }
    (cleaned.trim().to_string(), String::new())
}

/// Drop repeated order numbers, keeping the first occurrence.
fn dedupe_orders(items: Vec<PlannedSubtask>) -> Vec<PlannedSubtask> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|s| seen.insert(s.order)).collect()
}

/// Line-oriented extraction over one marker pattern.
fn scan_lines(output: &str, marker: &Regex) -> Vec<PlannedSubtask> {
    let mut items = Vec::new();
    let mut current: Option<(PlannedSubtask, Vec<String>)> = None;

    let finish = |entry: Option<(PlannedSubtask, Vec<String>)>, items: &mut Vec<PlannedSubtask>| {
        if let Some((mut st, lines)) = entry {
            if !lines.is_empty() {
                let extra = lines.join("\n");
                st.description = if st.description.is_empty() {
                    extra
                } else {
                    format!("{}\n{}", st.description, extra)
                };
            }
            if !st.title.is_empty() {
                items.push(st);
            }
        }
    };

    for line in output.lines() {
        if let Some(caps) = marker.captures(line) {
            finish(current.take(), &mut items);
            let order = caps[1].parse::<u32>().unwrap_or(0);
            let (title, description) = split_title_description(caps[2].trim());
            current = Some((PlannedSubtask::new(order, title, description), Vec::new()));
            continue;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((_, lines)) = current.as_mut() {
            lines.push(trimmed.to_string());
        }
    }
    finish(current.take(), &mut items);

    dedupe_orders(items)
}

/// Regex fallback stage.
///
/// Pattern families are tried in priority order; the first producing at
/// least two items wins, otherwise the first producing any.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexExtractor;

impl RegexExtractor {
    pub fn parse(&self, output: &str) -> Vec<PlannedSubtask> {
        let mut fallback: Option<Vec<PlannedSubtask>> = None;
        for family in [&*NUMBERED_RE, &*KEYWORD_RE] {
            let items = scan_lines(output, family);
            if items.len() >= 2 {
                return items;
            }
            if fallback.is_none() && !items.is_empty() {
                fallback = Some(items);
            }
        }
        fallback.unwrap_or_default()
    }
}

#[async_trait]
impl SubtaskExtractor for RegexExtractor {
    fn name(&self) -> &'static str {
        "regex"
    }

    async fn extract(&self, output: &str, _cancel: &CancellationToken) -> Result<Vec<PlannedSubtask>> {
        Ok(self.parse(output))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StructuredReply {
    List(Vec<StructuredItem>),
    Wrapped { subtasks: Vec<StructuredItem> },
}

#[derive(Deserialize)]
struct StructuredItem {
    #[serde(default)]
    order: u32,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    depends_on: Vec<u32>,
}

/// Parse the structured extraction reply.
///
/// # Errors
///
/// Invalid JSON or an empty list.
pub fn parse_structured_reply(text: &str) -> Result<Vec<PlannedSubtask>> {
    let items = match serde_json::from_str::<StructuredReply>(strip_code_fences(text))? {
        StructuredReply::List(items) => items,
        StructuredReply::Wrapped { subtasks } => subtasks,
    };
    let subtasks: Vec<PlannedSubtask> = items
        .into_iter()
        .enumerate()
        .filter(|(_, item)| !item.title.trim().is_empty())
        .map(|(i, item)| PlannedSubtask {
            order: if item.order == 0 { i as u32 + 1 } else { item.order },
            title: item.title.trim().to_string(),
            description: item.description.trim().to_string(),
            depends_on: item.depends_on,
        })
        .collect();
    if subtasks.is_empty() {
        return Err(Error::Judgment("no subtasks in structured reply".to_string()));
    }
    Ok(dedupe_orders(subtasks))
}

/// Structured extraction stage backed by a judgment service.
pub struct StructuredExtractor {
    judge: Arc<dyn JudgmentService>,
}

impl StructuredExtractor {
    pub fn new(judge: Arc<dyn JudgmentService>) -> Self {
        Self { judge }
    }
}

#[async_trait]
impl SubtaskExtractor for StructuredExtractor {
    fn name(&self) -> &'static str {
        "structured"
    }

    async fn extract(&self, output: &str, cancel: &CancellationToken) -> Result<Vec<PlannedSubtask>> {
        let reply = self
            .judge
            .judge(STRUCTURED_SYSTEM_PROMPT, output, cancel)
            .await?;
        parse_structured_reply(&reply)
    }
}

/// Ordered chain of extraction stages.
pub struct PlanningOutputParser {
    stages: Vec<Box<dyn SubtaskExtractor>>,
}

impl PlanningOutputParser {
    /// Structured extraction (when a judge is available) followed by regex.
    pub fn new(judge: Option<Arc<dyn JudgmentService>>) -> Self {
        let mut stages: Vec<Box<dyn SubtaskExtractor>> = Vec::new();
        if let Some(judge) = judge {
            stages.push(Box::new(StructuredExtractor::new(judge)));
        }
        stages.push(Box::new(RegexExtractor));
        Self { stages }
    }

    pub fn with_stages(stages: Vec<Box<dyn SubtaskExtractor>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// # Errors
    ///
    /// `Error::PlanParse` when no stage extracts anything, `Error::Cancelled`
    /// when `cancel` fires.
    pub async fn parse(&self, output: &str, cancel: &CancellationToken) -> Result<Vec<PlannedSubtask>> {
        for stage in &self.stages {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match stage.extract(output, cancel).await {
                Ok(subtasks) if !subtasks.is_empty() => {
                    flog_debug!("{} stage extracted {} subtasks", stage.name(), subtasks.len());
                    return Ok(subtasks);
                }
                Ok(_) => flog_debug!("{} stage found no subtasks", stage.name()),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => flog_warn!("{} stage failed, trying next: {}", stage.name(), e),
            }
        }
        Err(Error::PlanParse(format!(
            "{} stages found no numbered subtasks in {} chars of output",
            self.stages.len(),
            output.len()
        )))
    }
}
