use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::feature::Stage;

/// A checklist item for the stage a feature is currently in.
///
/// Tasks are **ephemeral**: when the feature changes stage they are replaced by
/// the next stage's checklist, and their completion summary is written into the
/// transition's lifecycle event. They are display/progress scaffolding only and
/// never gate a transition by themselves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub feature_id: String,
    /// The feature stage this task was generated for.
    pub stage: Stage,
    pub position: i64,
    pub description: String,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

/// Completion summary of a replaced checklist, stored in event metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskSummary {
    pub total: usize,
    pub completed: usize,
    pub completed_items: Vec<String>,
}

impl TaskSummary {
    pub fn of(tasks: &[Task]) -> Self {
        let completed_items: Vec<String> = tasks
            .iter()
            .filter(|t| t.completed)
            .map(|t| t.description.clone())
            .collect();
        Self {
            total: tasks.len(),
            completed: completed_items.len(),
            completed_items,
        }
    }
}
