use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::feature::Feature;

/// A large unit of work broken down into features.
///
/// Epics are created once by the decomposer. Their status is never set
/// directly: it follows the aggregate stage of their features.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Epic {
    pub id: String,
    pub name: String,
    pub description: String,
    pub complexity: Complexity,
    pub status: EpicStatus,
    /// Feature identifiers in decomposition order.
    pub feature_ids: Vec<String>,
    pub milestones: Vec<Milestone>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Size class of an epic. Drives how many features the template produces.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Small,
    Medium,
    Large,
}

text_enum!(Complexity {
    Small => "small",
    Medium => "medium",
    Large => "large",
});

impl Complexity {
    /// Number of features the template fallback generates.
    pub fn feature_count(&self) -> usize {
        match self {
            Self::Small => 2,
            Self::Medium => 4,
            Self::Large => 6,
        }
    }

    /// Days until the midpoint and delivery milestones.
    pub fn milestone_days(&self) -> (i64, i64) {
        match self {
            Self::Small => (7, 14),
            Self::Medium => (14, 28),
            Self::Large => (28, 56),
        }
    }
}

/// - `Planning`: no feature has started yet
/// - `Active`: at least one feature has left planning
/// - `Completed`: every feature is completed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    Planning,
    Active,
    Completed,
}

text_enum!(EpicStatus {
    Planning => "planning",
    Active => "active",
    Completed => "completed",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Milestone {
    pub name: String,
    pub target_date: DateTime<Utc>,
    pub completion_criteria: String,
}

/// Input for creating a new epic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEpicInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub complexity: Complexity,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
}

/// An epic together with its features, in decomposition order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpicDetail {
    #[serde(flatten)]
    pub epic: Epic,
    pub features: Vec<Feature>,
}
