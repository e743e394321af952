//! Anti-cascade check for decomposition.
//!
//! Sub-issues all branch from the same base. When every planned step lands
//! in one directory, separate branches collide on merge, so the plan is
//! executed as a single unit instead.

use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

use crate::orchestration::plan::PlannedSubtask;

/// Slash-separated path with at least one directory and a source extension.
static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b((?:[\w\-]+/)+[\w\-]+\.(?:go|py|ts|tsx|js|jsx|rs|java|rb))\b").unwrap()
});

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "for", "to", "in", "of", "with", "from", "by", "add", "create",
    "implement", "update", "fix", "setup", "set", "up", "new", "test", "tests",
];

const TRIM_CHARS: &[char] = &['.', ',', ':', '-', '(', ')', '[', ']', '"', '\'', '`', '*'];

/// Unique parent directories of every source path mentioned in `text`.
pub fn extract_unique_directories(text: &str) -> BTreeSet<String> {
    PATH_RE
        .captures_iter(text)
        .filter_map(|c| {
            let path = c.get(1)?.as_str();
            let (dir, _) = path.rsplit_once('/')?;
            (!dir.is_empty()).then(|| dir.to_string())
        })
        .collect()
}

/// Significant lower-cased words of a title, each at most once.
fn significant_words(title: &str) -> HashSet<String> {
    title
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(TRIM_CHARS))
        .filter(|w| w.chars().count() >= 3 && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// True when one significant word appears in at least 80% of titles.
pub fn titles_share_component(subtasks: &[PlannedSubtask]) -> bool {
    let n = subtasks.len();
    if n < 2 {
        return false;
    }
    let mut counts: HashMap<String, usize> = HashMap::new();
    for st in subtasks {
        for word in significant_words(&st.title) {
            *counts.entry(word).or_default() += 1;
        }
    }
    counts.values().any(|&count| count * 5 >= n * 4)
}

/// Decides whether a plan is confined to one code area.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopeGuard;

impl ScopeGuard {
    /// `true` means skip decomposition and run the plan as one task.
    pub fn is_single_scope(&self, description: &str, subtasks: &[PlannedSubtask]) -> bool {
        let mut text = String::with_capacity(description.len() + 64 * subtasks.len());
        text.push_str(description);
        text.push('\n');
        for st in subtasks {
            text.push_str(&st.title);
            text.push('\n');
            text.push_str(&st.description);
            text.push('\n');
        }

        match extract_unique_directories(&text).len() {
            1 => true,
            0 => titles_share_component(subtasks),
            _ => false,
        }
    }
}
