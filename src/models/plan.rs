use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::feature::{Action, Stage};

/// How an orchestration pass treats the decisions it makes.
///
/// - `Suggest`: report only, nothing is executed
/// - `Auto`: execute every decision
/// - `Interactive`: execute only decisions confirmed by the operator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    #[default]
    Suggest,
    Auto,
    Interactive,
}

text_enum!(OrchestrationMode {
    Suggest => "suggest",
    Auto => "auto",
    Interactive => "interactive",
});

/// What the scheduler wants to do with one feature.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Take a planning feature into a free capacity slot.
    Start,
    /// Move a feature whose exit criteria are met to its next stage.
    Advance,
    /// Surface a blocked feature for human attention.
    Escalate,
    /// Report why a feature stays where it is.
    Hold,
}

text_enum!(DecisionKind {
    Start => "start",
    Advance => "advance",
    Escalate => "escalate",
    Hold => "hold",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Proposed,
    Executed,
    Failed,
    Declined,
    /// Not dispatched because the pass was cancelled.
    Skipped,
}

text_enum!(DecisionStatus {
    Proposed => "proposed",
    Executed => "executed",
    Failed => "failed",
    Declined => "declined",
    Skipped => "skipped",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub feature_id: String,
    pub feature_name: String,
    pub kind: DecisionKind,
    /// The lifecycle action that executes this decision, if any.
    pub action: Option<Action>,
    pub stage: Stage,
    pub rationale: String,
    pub status: DecisionStatus,
    pub error: Option<String>,
}

impl Decision {
    pub fn is_executable(&self) -> bool {
        self.action.is_some() && matches!(self.kind, DecisionKind::Start | DecisionKind::Advance)
    }
}

/// The audit artifact of one orchestration pass.
///
/// Persisted once, at the end of the pass, whether or not anything was executed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationPlan {
    pub id: String,
    pub mode: OrchestrationMode,
    pub capacity: usize,
    pub active_before: usize,
    pub active_after: usize,
    pub available: usize,
    pub decisions: Vec<Decision>,
    pub warnings: Vec<String>,
    /// Some registry queries failed; the plan is a degraded report.
    pub incomplete: bool,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

impl OrchestrationPlan {
    pub fn decisions_of(&self, kind: DecisionKind) -> impl Iterator<Item = &Decision> {
        self.decisions.iter().filter(move |d| d.kind == kind)
    }
}
