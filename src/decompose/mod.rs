//! Epic decomposition.
//!
//! The template path is the primary guarantee: every complexity class maps to
//! a fixed, non-empty feature list. An external [`Suggester`] may replace the
//! template's names and descriptions, but when it is missing, fails, or
//! returns nothing usable, the template output is used unchanged.

mod suggester;

pub use suggester::{HttpSuggester, SuggestedFeature, Suggester};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{FlowError, Result};
use crate::models::*;

/// What the decomposer is asked to break down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposeRequest {
    pub name: String,
    pub description: String,
    pub complexity: Complexity,
}

struct Template {
    part: &'static str,
    summary: &'static str,
    priority: Priority,
    acceptance: &'static str,
}

const SMALL: &[Template] = &[
    Template {
        part: "Core implementation",
        summary: "Build the core behaviour",
        priority: Priority::High,
        acceptance: "Core behaviour works end to end and is covered by tests",
    },
    Template {
        part: "Tests and documentation",
        summary: "Harden with tests and document usage",
        priority: Priority::Medium,
        acceptance: "Test suite is green and usage is documented",
    },
];

const MEDIUM: &[Template] = &[
    Template {
        part: "Foundation",
        summary: "Lay down data structures and interfaces",
        priority: Priority::High,
        acceptance: "Interfaces are agreed and scaffolding compiles",
    },
    Template {
        part: "Core logic",
        summary: "Implement the main behaviour",
        priority: Priority::High,
        acceptance: "Main behaviour works for the documented cases",
    },
    Template {
        part: "Integration",
        summary: "Wire the new behaviour into existing systems",
        priority: Priority::Medium,
        acceptance: "Integrated paths work against real dependencies",
    },
    Template {
        part: "Testing and documentation",
        summary: "Cover edge cases and document the change",
        priority: Priority::Low,
        acceptance: "Edge cases are tested and documentation is updated",
    },
];

const LARGE: &[Template] = &[
    Template {
        part: "Architecture and design",
        summary: "Decide the architecture and record the design",
        priority: Priority::High,
        acceptance: "Design is reviewed and recorded",
    },
    Template {
        part: "Data model",
        summary: "Define and migrate the data model",
        priority: Priority::High,
        acceptance: "Schema and migrations are in place",
    },
    Template {
        part: "Core implementation",
        summary: "Implement the central behaviour",
        priority: Priority::High,
        acceptance: "Central behaviour works for the documented cases",
    },
    Template {
        part: "API surface",
        summary: "Expose the behaviour through its public interface",
        priority: Priority::Medium,
        acceptance: "Public interface is implemented and versioned",
    },
    Template {
        part: "Integration",
        summary: "Connect with dependent systems",
        priority: Priority::Medium,
        acceptance: "Dependent systems work against the new interface",
    },
    Template {
        part: "Hardening and documentation",
        summary: "Load-test, fix rough edges and document",
        priority: Priority::Low,
        acceptance: "Performance targets are met and documentation is complete",
    },
];

fn templates(complexity: Complexity) -> &'static [Template] {
    match complexity {
        Complexity::Small => SMALL,
        Complexity::Medium => MEDIUM,
        Complexity::Large => LARGE,
    }
}

fn effort_for(complexity: Complexity, priority: Priority) -> Effort {
    match (complexity, priority) {
        (_, Priority::Low) | (Complexity::Small, _) => Effort::Small,
        (Complexity::Medium, _) => Effort::Medium,
        (Complexity::Large, _) => Effort::Large,
    }
}

/// The four standard checklist phases for a feature.
pub fn default_checklist(feature_name: &str) -> Vec<ChecklistItem> {
    vec![
        ChecklistItem::new(
            ChecklistPhase::Design,
            format!("Write a short design note for {feature_name}"),
        ),
        ChecklistItem::new(
            ChecklistPhase::Implementation,
            format!("Implement {feature_name}"),
        ),
        ChecklistItem::new(
            ChecklistPhase::Testing,
            format!("Add automated tests for {feature_name}"),
        ),
        ChecklistItem::new(
            ChecklistPhase::Documentation,
            format!("Document {feature_name}"),
        ),
    ]
}

/// Deterministic template decomposition. Never empty.
pub fn template_features(name: &str, description: &str, complexity: Complexity) -> Vec<FeatureSpec> {
    let mut previous: Option<String> = None;
    templates(complexity)
        .iter()
        .map(|t| {
            let feature_name = format!("{name}: {}", t.part);
            let mut text = format!("{} for {name}.", t.summary);
            if !description.trim().is_empty() {
                text.push(' ');
                text.push_str(description.trim());
            }
            let spec = FeatureSpec {
                checklist: default_checklist(&feature_name),
                name: feature_name.clone(),
                description: text,
                priority: t.priority,
                effort: effort_for(complexity, t.priority),
                acceptance_criteria: t.acceptance.to_string(),
                files: Vec::new(),
                dependencies: previous.iter().cloned().collect(),
            };
            previous = Some(feature_name);
            spec
        })
        .collect()
}

/// Midpoint and delivery milestones, dated from `now`.
pub fn milestones(complexity: Complexity, now: DateTime<Utc>) -> Vec<Milestone> {
    let (midpoint, delivery) = complexity.milestone_days();
    let half = complexity.feature_count().div_ceil(2);
    vec![
        Milestone {
            name: "Midpoint".to_string(),
            target_date: now + Duration::days(midpoint),
            completion_criteria: format!("First {half} features completed"),
        },
        Milestone {
            name: "Delivery".to_string(),
            target_date: now + Duration::days(delivery),
            completion_criteria: "All features completed".to_string(),
        },
    ]
}

#[derive(Clone, Default)]
pub struct Decomposer {
    suggester: Option<Arc<dyn Suggester>>,
}

impl Decomposer {
    /// A decomposer that only uses templates.
    pub fn new() -> Self {
        Self { suggester: None }
    }

    pub fn with_suggester(suggester: Arc<dyn Suggester>) -> Self {
        Self {
            suggester: Some(suggester),
        }
    }

    /// Break an epic down into features. Always returns at least one feature.
    pub async fn decompose(
        &self,
        name: &str,
        description: &str,
        complexity: Complexity,
    ) -> Vec<FeatureSpec> {
        let template = template_features(name, description, complexity);

        let Some(suggester) = &self.suggester else {
            return template;
        };

        let request = DecomposeRequest {
            name: name.to_string(),
            description: description.to_string(),
            complexity,
        };
        match suggester.suggest(&request).await {
            Ok(suggestions) => {
                let merged = merge_suggestions(&template, suggestions);
                if merged.is_empty() {
                    tracing::info!(
                        suggester = suggester.name(),
                        "suggester returned nothing usable, using template"
                    );
                    template
                } else {
                    tracing::info!(
                        suggester = suggester.name(),
                        features = merged.len(),
                        "using suggested decomposition"
                    );
                    merged
                }
            }
            Err(e) => {
                tracing::warn!(
                    suggester = suggester.name(),
                    error = %e,
                    "suggester failed, using template"
                );
                template
            }
        }
    }

    /// Validate, decompose and persist an epic with its features.
    pub async fn create_epic(
        &self,
        db: &Database,
        name: &str,
        description: &str,
        complexity: Complexity,
    ) -> Result<EpicDetail> {
        if name.trim().is_empty() {
            return Err(FlowError::Validation("epic name must not be empty".into()));
        }

        let features = self.decompose(name.trim(), description, complexity).await;
        let detail = db.create_epic_with_features(
            CreateEpicInput {
                name: name.to_string(),
                description: description.to_string(),
                complexity,
                milestones: milestones(complexity, now()),
            },
            features,
        )?;

        tracing::info!(
            epic_id = %detail.epic.id,
            features = detail.features.len(),
            complexity = %complexity,
            "epic created"
        );
        Ok(detail)
    }
}

/// Lay suggestions over the template, position by position. Fields a
/// suggestion leaves out come from the template entry at the same position
/// (or the last one).
fn merge_suggestions(template: &[FeatureSpec], suggestions: Vec<SuggestedFeature>) -> Vec<FeatureSpec> {
    let Some(last) = template.last() else {
        return Vec::new();
    };

    suggestions
        .into_iter()
        .filter(|s| !s.name.trim().is_empty())
        .enumerate()
        .map(|(i, s)| {
            let base = template.get(i).unwrap_or(last);
            let name = s.name.trim().to_string();
            FeatureSpec {
                checklist: default_checklist(&name),
                description: s.description.unwrap_or_else(|| base.description.clone()),
                priority: s.priority.unwrap_or(base.priority),
                effort: s.effort.unwrap_or(base.effort),
                acceptance_criteria: s
                    .acceptance_criteria
                    .unwrap_or_else(|| base.acceptance_criteria.clone()),
                files: s.files,
                dependencies: s.dependencies,
                name,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Unavailable;

    #[async_trait]
    impl Suggester for Unavailable {
        fn name(&self) -> &str {
            "unavailable"
        }

        async fn suggest(&self, _request: &DecomposeRequest) -> anyhow::Result<Vec<SuggestedFeature>> {
            anyhow::bail!("connection refused")
        }
    }

    struct Empty;

    #[async_trait]
    impl Suggester for Empty {
        fn name(&self) -> &str {
            "empty"
        }

        async fn suggest(&self, _request: &DecomposeRequest) -> anyhow::Result<Vec<SuggestedFeature>> {
            Ok(vec![SuggestedFeature::named("   ")])
        }
    }

    struct Fixed;

    #[async_trait]
    impl Suggester for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn suggest(&self, _request: &DecomposeRequest) -> anyhow::Result<Vec<SuggestedFeature>> {
            let mut schema = SuggestedFeature::named("Ledger schema");
            schema.priority = Some(Priority::High);
            Ok(vec![schema, SuggestedFeature::named("Refund flow")])
        }
    }

    #[test]
    fn template_sizes_follow_complexity() {
        for complexity in Complexity::ALL {
            let features = template_features("Payments", "", *complexity);
            assert_eq!(features.len(), complexity.feature_count());
        }
    }

    #[test]
    fn template_features_depend_on_their_predecessor() {
        let features = template_features("Payments", "", Complexity::Medium);
        assert!(features[0].dependencies.is_empty());
        for pair in features.windows(2) {
            assert_eq!(pair[1].dependencies, vec![pair[0].name.clone()]);
        }
    }

    #[test]
    fn every_template_feature_has_four_checklist_phases() {
        for feature in template_features("Search", "Full-text search", Complexity::Large) {
            let phases: Vec<ChecklistPhase> = feature.checklist.iter().map(|c| c.phase).collect();
            assert_eq!(phases, ChecklistPhase::ALL.to_vec());
        }
    }

    #[test]
    fn milestones_are_ordered() {
        let now = Utc::now();
        let ms = milestones(Complexity::Large, now);
        assert_eq!(ms.len(), 2);
        assert!(ms[0].target_date < ms[1].target_date);
        assert_eq!(ms[1].target_date, now + Duration::days(56));
    }

    #[tokio::test]
    async fn falls_back_to_template_when_suggester_fails() {
        let decomposer = Decomposer::with_suggester(Arc::new(Unavailable));
        for complexity in Complexity::ALL {
            let features = decomposer.decompose("Payments", "", *complexity).await;
            assert_eq!(features, template_features("Payments", "", *complexity));
        }
    }

    #[tokio::test]
    async fn falls_back_to_template_when_suggestions_are_unusable() {
        let decomposer = Decomposer::with_suggester(Arc::new(Empty));
        let features = decomposer.decompose("Payments", "", Complexity::Small).await;
        assert_eq!(features.len(), 2);
    }

    #[tokio::test]
    async fn suggestions_are_filled_from_template() {
        let decomposer = Decomposer::with_suggester(Arc::new(Fixed));
        let features = decomposer.decompose("Payments", "", Complexity::Medium).await;
        let template = template_features("Payments", "", Complexity::Medium);

        assert_eq!(features.len(), 2);
        assert_eq!(features[0].name, "Ledger schema");
        assert_eq!(features[1].priority, template[1].priority);
        assert_eq!(features[1].acceptance_criteria, template[1].acceptance_criteria);
        assert_eq!(features[1].checklist.len(), 4);
    }

    #[tokio::test]
    async fn rejects_empty_epic_name() {
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();
        let result = Decomposer::new()
            .create_epic(&db, "  ", "desc", Complexity::Small)
            .await;
        assert!(matches!(result, Err(FlowError::Validation(_))));
        assert!(db.list_epics().unwrap().is_empty());
    }
}
