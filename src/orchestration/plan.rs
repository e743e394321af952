//! Epic plan data model.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::Task;

/// One step of an epic plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedSubtask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// 1-indexed execution order, unique within a plan.
    pub order: u32,
    /// Orders of the steps this one depends on. Advisory only.
    #[serde(default)]
    pub depends_on: Vec<u32>,
}

impl PlannedSubtask {
    pub fn new(order: u32, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            order,
            depends_on: Vec::new(),
        }
    }
}

/// Result of planning an epic.
#[derive(Debug, Clone)]
pub struct EpicPlan {
    pub parent: Task,
    pub subtasks: Vec<PlannedSubtask>,
    /// Raw planner output, kept for audit.
    pub raw_output: String,
}

/// Problems found in declared dependencies. None of them block execution,
/// which always follows plan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyWarning {
    /// Step depends on an order number that is not in the plan.
    Unknown { order: u32, depends_on: u32 },
    /// Step depends on a step scheduled at or after it.
    Forward { order: u32, depends_on: u32 },
    Cycle,
}

impl std::fmt::Display for DependencyWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyWarning::Unknown { order, depends_on } => {
                write!(f, "step {} depends on unknown step {}", order, depends_on)
            }
            DependencyWarning::Forward { order, depends_on } => {
                write!(f, "step {} depends on later step {}", order, depends_on)
            }
            DependencyWarning::Cycle => write!(f, "dependency cycle between steps"),
        }
    }
}

impl EpicPlan {
    pub fn new(parent: Task, subtasks: Vec<PlannedSubtask>, raw_output: impl Into<String>) -> Self {
        Self {
            parent,
            subtasks,
            raw_output: raw_output.into(),
        }
    }

    /// Check declared dependencies against plan order.
    pub fn dependency_warnings(&self) -> Vec<DependencyWarning> {
        let mut graph: DiGraph<u32, ()> = DiGraph::new();
        let mut index: HashMap<u32, NodeIndex> = HashMap::new();
        let mut position: HashMap<u32, usize> = HashMap::new();
        for (pos, st) in self.subtasks.iter().enumerate() {
            index.insert(st.order, graph.add_node(st.order));
            position.insert(st.order, pos);
        }

        let mut warnings = Vec::new();
        for (pos, st) in self.subtasks.iter().enumerate() {
            for &dep in &st.depends_on {
                let Some(&dep_node) = index.get(&dep) else {
                    warnings.push(DependencyWarning::Unknown {
                        order: st.order,
                        depends_on: dep,
                    });
                    continue;
                };
                if position.get(&dep).is_some_and(|&p| p >= pos) {
                    warnings.push(DependencyWarning::Forward {
                        order: st.order,
                        depends_on: dep,
                    });
                }
                graph.add_edge(dep_node, index[&st.order], ());
            }
        }

        if is_cyclic_directed(&graph) {
            warnings.push(DependencyWarning::Cycle);
        }
        warnings
    }
}

/// An issue created on the tracker for one planned step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedIssue {
    /// Tracker identifier, e.g. `GH-42`.
    pub identifier: String,
    /// Numeric ID when the tracker has one.
    pub number: Option<u64>,
    pub url: String,
    pub subtask: PlannedSubtask,
}
