//! Task complexity levels.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Five-level complexity scale, ordered by severity so thresholds can be
/// compared with `<`/`>=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Trivial,
    Simple,
    Medium,
    Complex,
    Epic,
}

impl Complexity {
    pub const ALL: [Complexity; 5] = [
        Complexity::Trivial,
        Complexity::Simple,
        Complexity::Medium,
        Complexity::Complex,
        Complexity::Epic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Trivial => "trivial",
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
            Complexity::Epic => "epic",
        }
    }

    pub fn is_epic(&self) -> bool {
        *self == Complexity::Epic
    }

    /// Trivial and simple tasks skip planning entirely.
    pub fn is_simple(&self) -> bool {
        matches!(self, Complexity::Trivial | Complexity::Simple)
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Complexity::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown complexity: {s}"))
    }
}
