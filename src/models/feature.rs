use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A deliverable slice of an epic, tracked through the lifecycle.
///
/// # Lifecycle
/// Features progress through stages:
/// Planning → InProgress → Implementation → Testing → Review → Completed,
/// with a rework loop from Review back to Implementation. Any non-terminal
/// stage can be blocked; resuming returns the feature to the exact stage it
/// was blocked from.
///
/// `version` is bumped on every write and guards updates against concurrent
/// modification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    pub id: String,
    pub epic_id: String,
    /// Position within the epic's decomposition order.
    pub position: i64,
    pub name: String,
    pub description: String,
    pub priority: Priority,
    pub effort: Effort,
    pub stage: Stage,
    pub assigned_to: Option<String>,
    pub acceptance_criteria: String,
    /// Advisory: files the feature is expected to touch.
    pub files: Vec<String>,
    /// Advisory: names of features this one builds on.
    pub dependencies: Vec<String>,
    pub checklist: Vec<ChecklistItem>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Feature {
    /// Branch the version-control hooks work on.
    pub fn branch_name(&self) -> String {
        format!("feature/{}", self.id)
    }

    /// Checklist items that become tasks when the feature enters `stage`.
    pub fn checklist_for(&self, stage: Stage) -> Vec<&ChecklistItem> {
        self.checklist
            .iter()
            .filter(|item| item.phase.stage() == stage)
            .collect()
    }
}

/// Lifecycle stage of a feature.
///
/// `InProgress`, `Implementation`, `Testing` and `Review` consume a capacity
/// slot. `Completed` is terminal. `Blocked` is resumable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    InProgress,
    Implementation,
    Testing,
    Review,
    Completed,
    Blocked,
}

text_enum!(Stage {
    Planning => "planning",
    InProgress => "in_progress",
    Implementation => "implementation",
    Testing => "testing",
    Review => "review",
    Completed => "completed",
    Blocked => "blocked",
});

impl Stage {
    pub const CAPACITY_CONSUMING: &'static [Stage] = &[
        Stage::InProgress,
        Stage::Implementation,
        Stage::Testing,
        Stage::Review,
    ];

    pub fn consumes_capacity(&self) -> bool {
        Self::CAPACITY_CONSUMING.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Stages a feature can be blocked from.
    pub fn is_blockable(&self) -> bool {
        !matches!(self, Self::Completed | Self::Blocked)
    }
}

/// A lifecycle action requested on a feature.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Implement,
    Test,
    Review,
    Complete,
    Rework,
    Block,
    Resume,
}

text_enum!(Action {
    Start => "start",
    Implement => "implement",
    Test => "test",
    Review => "review",
    Complete => "complete",
    Rework => "rework",
    Block => "block",
    Resume => "resume",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

text_enum!(Priority {
    Low => "low",
    Medium => "medium",
    High => "high",
});

impl Priority {
    /// Higher rank is scheduled first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Small,
    Medium,
    Large,
}

text_enum!(Effort {
    Small => "small",
    Medium => "medium",
    Large => "large",
});

/// The four standard checklist phases every decomposed feature carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistPhase {
    Design,
    Implementation,
    Testing,
    Documentation,
}

text_enum!(ChecklistPhase {
    Design => "design",
    Implementation => "implementation",
    Testing => "testing",
    Documentation => "documentation",
});

impl ChecklistPhase {
    /// The lifecycle stage whose tasks are generated from this phase.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Design => Stage::InProgress,
            Self::Implementation => Stage::Implementation,
            Self::Testing => Stage::Testing,
            Self::Documentation => Stage::Review,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChecklistItem {
    pub phase: ChecklistPhase,
    pub description: String,
}

impl ChecklistItem {
    pub fn new(phase: ChecklistPhase, description: impl Into<String>) -> Self {
        Self {
            phase,
            description: description.into(),
        }
    }
}

/// A feature as produced by the decomposer, and the input for creating one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub priority: Priority,
    pub effort: Effort,
    #[serde(default)]
    pub acceptance_criteria: String,
    #[serde(default)]
    pub files: Vec<String>,
    /// Dependency hints, by feature name.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
}
