use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::feature::Action;

/// An append-only record of one lifecycle transition attempt.
///
/// Every attempt on an existing feature produces exactly one event, whether it
/// succeeded, was rejected by the transition table, or failed in a hook. Events
/// are never updated; old ones can only be moved to the archive table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub id: String,
    /// Insertion order. Breaks ties between events with the same timestamp.
    pub seq: i64,
    pub feature_id: String,
    pub action: Action,
    pub outcome: EventOutcome,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// How a transition attempt ended.
///
/// - `Succeeded`: stage committed
/// - `Failed`: a hook failed, stage unchanged
/// - `Timeout`: a hook exceeded its deadline, stage unchanged
/// - `Rejected`: not allowed by the transition table
/// - `Conflict`: the feature was modified concurrently
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Succeeded,
    Failed,
    Timeout,
    Rejected,
    Conflict,
}

text_enum!(EventOutcome {
    Succeeded => "succeeded",
    Failed => "failed",
    Timeout => "timeout",
    Rejected => "rejected",
    Conflict => "conflict",
});

/// Input for appending an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub feature_id: String,
    pub action: Action,
    pub outcome: EventOutcome,
    pub metadata: serde_json::Value,
}

impl NewEvent {
    pub fn new(
        feature_id: impl Into<String>,
        action: Action,
        outcome: EventOutcome,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            feature_id: feature_id.into(),
            action,
            outcome,
            metadata,
        }
    }
}
