//! The feature lifecycle state machine.
//!
//! [`LifecycleEngine::transition`] validates an action against the
//! transition [`table`], runs the action's hooks in order, and only then
//! commits the new stage together with its event. A failing hook aborts the
//! transition with the stage unchanged. Every attempt on an existing feature,
//! whatever its outcome, appends exactly one lifecycle event.

pub mod hooks;
pub mod table;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use crate::db::Database;
use crate::error::{FlowError, Result};
use crate::models::{Action, EventOutcome, Feature, NewEvent, Stage};

use hooks::{Collaborators, Notification, Notifier};

pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(300);

/// A side-effect step run before a transition commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    CreateBranch,
    ProvisionEnvironment,
    StaticChecks,
    ProgressMetric,
    RunTests,
    OpenReviewRequest,
    QualityGates,
    MergeBranch,
    UpdateDocs,
    ReleaseCapacity,
    RecordBlocker,
    NotifyStakeholders,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateBranch => "create_branch",
            Self::ProvisionEnvironment => "provision_environment",
            Self::StaticChecks => "static_checks",
            Self::ProgressMetric => "progress_metric",
            Self::RunTests => "run_tests",
            Self::OpenReviewRequest => "open_review_request",
            Self::QualityGates => "quality_gates",
            Self::MergeBranch => "merge_branch",
            Self::UpdateDocs => "update_docs",
            Self::ReleaseCapacity => "release_capacity",
            Self::RecordBlocker => "record_blocker",
            Self::NotifyStakeholders => "notify_stakeholders",
        }
    }

    /// Failures of best-effort hooks are logged and never abort a transition.
    pub fn is_best_effort(&self) -> bool {
        matches!(self, Self::NotifyStakeholders)
    }
}

/// Hooks of an action, in execution order.
pub fn hooks_for(action: Action) -> &'static [Hook] {
    use Hook::*;
    match action {
        Action::Start => &[CreateBranch, ProvisionEnvironment],
        Action::Implement => &[StaticChecks, ProgressMetric],
        Action::Test => &[RunTests],
        Action::Review => &[OpenReviewRequest, QualityGates],
        Action::Complete => &[MergeBranch, UpdateDocs, ReleaseCapacity],
        Action::Block => &[RecordBlocker, NotifyStakeholders],
        Action::Rework | Action::Resume => &[],
    }
}

/// Rough completion percentage reported by the progress metric.
fn progress_percent(stage: Stage) -> u8 {
    match stage {
        Stage::Planning | Stage::Blocked => 0,
        Stage::InProgress => 20,
        Stage::Implementation => 40,
        Stage::Testing => 60,
        Stage::Review => 80,
        Stage::Completed => 100,
    }
}

#[derive(Clone)]
pub struct LifecycleEngine {
    db: Database,
    collaborators: Collaborators,
    hook_timeout: Duration,
    capacity: Option<usize>,
    feature_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LifecycleEngine {
    pub fn new(db: Database, collaborators: Collaborators) -> Self {
        Self {
            db,
            collaborators,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            capacity: None,
            feature_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Deadline applied to each hook. An expired hook fails the transition.
    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    /// Refuse `start`, and `resume` into a capacity-consuming stage, once
    /// `limit` features are active. Unlimited by default.
    pub fn with_capacity(mut self, limit: usize) -> Self {
        self.capacity = Some(limit);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Apply `action` to a feature.
    ///
    /// `reason` is recorded in the event metadata; for [`Action::Block`] it
    /// is the blocker description.
    pub async fn transition(
        &self,
        feature_id: &str,
        action: Action,
        reason: Option<String>,
    ) -> Result<Feature> {
        self.transition_within(feature_id, action, reason, self.capacity).await
    }

    /// [`transition`](Self::transition) against an explicit capacity limit
    /// instead of the engine's own.
    pub async fn transition_within(
        &self,
        feature_id: &str,
        action: Action,
        reason: Option<String>,
        capacity: Option<usize>,
    ) -> Result<Feature> {
        let lock = self.feature_lock(feature_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply(feature_id, action, reason, capacity).await
        };
        self.release_feature_lock(feature_id, lock);
        result
    }

    async fn apply(
        &self,
        feature_id: &str,
        action: Action,
        reason: Option<String>,
        capacity: Option<usize>,
    ) -> Result<Feature> {
        let feature = self.db.require_feature(feature_id)?;
        let origin = match action {
            Action::Resume => self.db.block_origin(feature_id)?,
            _ => None,
        };

        let target = match table::next_stage(feature.stage, action, origin) {
            Ok(stage) => stage,
            Err(err) => {
                tracing::warn!(
                    feature_id,
                    action = %action,
                    stage = %feature.stage,
                    "rejected invalid transition"
                );
                self.record_failure(&feature, action, EventOutcome::Rejected, &err, json!({}));
                return Err(err);
            }
        };

        // Only entering a consuming stage from outside one takes a slot.
        let admission_limit =
            capacity.filter(|_| target.consumes_capacity() && !feature.stage.consumes_capacity());
        if let Some(limit) = admission_limit {
            let active = self.db.count_features_in_stages(Stage::CAPACITY_CONSUMING)?;
            if active >= limit {
                let err = FlowError::capacity_reached(limit, active);
                tracing::warn!(
                    feature_id,
                    action = %action,
                    limit,
                    active,
                    "rejected transition at capacity"
                );
                self.record_failure(
                    &feature,
                    action,
                    EventOutcome::Rejected,
                    &err,
                    json!({ "to": target.as_str(), "capacity": limit, "active": active }),
                );
                return Err(err);
            }
        }

        let mut metadata = json!({
            "from": feature.stage.as_str(),
            "to": target.as_str(),
        });
        if let Some(reason) = &reason {
            metadata["reason"] = json!(reason);
        }
        if action == Action::Block {
            metadata["origin"] = json!(feature.stage.as_str());
        }

        for hook in hooks_for(action) {
            if let Err(err) = self
                .run_hook(*hook, &feature, target, reason.as_deref(), &mut metadata)
                .await
            {
                if hook.is_best_effort() {
                    tracing::warn!(feature_id, hook = hook.as_str(), error = %err, "best-effort hook failed");
                    continue;
                }

                tracing::error!(feature_id, action = %action, hook = hook.as_str(), error = %err, "transition aborted");
                let outcome = match err {
                    FlowError::Timeout { .. } => EventOutcome::Timeout,
                    _ => EventOutcome::Failed,
                };
                metadata["hook"] = json!(hook.as_str());
                self.record_failure(&feature, action, outcome, &err, metadata);
                return Err(err);
            }
        }

        let event = NewEvent::new(feature_id, action, EventOutcome::Succeeded, metadata.clone());
        match self.db.commit_transition(&feature, target, event, admission_limit) {
            Ok((updated, _event)) => {
                tracing::info!(
                    feature_id,
                    action = %action,
                    from = %feature.stage,
                    to = %updated.stage,
                    "transition committed"
                );
                Ok(updated)
            }
            Err(err) => {
                let outcome = match err {
                    FlowError::Conflict(_) => EventOutcome::Conflict,
                    _ => EventOutcome::Failed,
                };
                tracing::error!(feature_id, action = %action, error = %err, "transition commit failed");
                self.record_failure(&feature, action, outcome, &err, metadata);
                Err(err)
            }
        }
    }

    /// Deliver a notification without letting its failure propagate.
    /// Returns whether it was delivered.
    pub async fn notify(&self, notification: Notification) -> bool {
        deliver(
            self.collaborators.notifier.clone(),
            notification,
            self.hook_timeout,
        )
        .await
    }

    async fn run_hook(
        &self,
        hook: Hook,
        feature: &Feature,
        target: Stage,
        reason: Option<&str>,
        metadata: &mut serde_json::Value,
    ) -> Result<()> {
        let c = &self.collaborators;
        let branch = feature.branch_name();

        let step = async {
            match hook {
                Hook::CreateBranch => {
                    c.version_control.create_branch(feature, &branch).await?;
                    metadata["branch"] = json!(branch);
                }
                Hook::ProvisionEnvironment => {
                    c.version_control
                        .provision_environment(feature, &branch)
                        .await?;
                }
                Hook::StaticChecks => {
                    let report = c.test_runner.run_checks(feature).await?;
                    metadata["checks"] = serde_json::to_value(&report)?;
                    if !report.passed {
                        anyhow::bail!("static checks failed: {}", report.findings.join("; "));
                    }
                }
                Hook::ProgressMetric => {
                    tracing::info!(
                        metric = "feature_progress",
                        feature_id = %feature.id,
                        epic_id = %feature.epic_id,
                        stage = %target,
                        percent = progress_percent(target),
                        "progress"
                    );
                }
                Hook::RunTests => {
                    let outcome = c.test_runner.run(feature, self.hook_timeout).await?;
                    metadata["passed"] = json!(outcome.passed);
                    metadata["coverage"] = json!(outcome.coverage);
                }
                Hook::OpenReviewRequest => {
                    let url = c.review.open_request(feature, &branch).await?;
                    metadata["request_url"] = json!(url);
                }
                Hook::QualityGates => {
                    let report = c.review.run_gates(feature).await?;
                    metadata["gates_passed"] = json!(report.passed);
                    metadata["gate_details"] = json!(report.details);
                }
                Hook::MergeBranch => {
                    c.version_control.merge(feature, &branch).await?;
                    metadata["merged"] = json!(branch);
                }
                Hook::UpdateDocs => {
                    c.version_control.update_docs(feature).await?;
                }
                Hook::ReleaseCapacity => {
                    metadata["capacity_released"] = json!(true);
                }
                Hook::RecordBlocker => {
                    metadata["reason"] = json!(reason.unwrap_or("unspecified"));
                }
                Hook::NotifyStakeholders => {
                    let notification = Notification::Blocked {
                        feature_id: feature.id.clone(),
                        reason: reason.unwrap_or("unspecified").to_string(),
                    };
                    tokio::spawn(deliver(c.notifier.clone(), notification, self.hook_timeout));
                    metadata["notified"] = json!("dispatched");
                }
            }
            Ok::<(), anyhow::Error>(())
        };

        match tokio::time::timeout(self.hook_timeout, step).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(FlowError::HookFailure {
                hook: hook.as_str().to_string(),
                message: format!("{e:#}"),
            }),
            Err(_) => Err(FlowError::Timeout {
                hook: hook.as_str().to_string(),
                seconds: self.hook_timeout.as_secs(),
            }),
        }
    }

    fn record_failure(
        &self,
        feature: &Feature,
        action: Action,
        outcome: EventOutcome,
        err: &FlowError,
        mut metadata: serde_json::Value,
    ) {
        metadata["stage"] = json!(feature.stage.as_str());
        metadata["error"] = json!(err.to_string());
        metadata["category"] = json!(err.category());
        let event = NewEvent::new(&feature.id, action, outcome, metadata);
        if let Err(e) = self.db.append_event(event) {
            tracing::error!(feature_id = %feature.id, error = %e, "failed to log transition failure");
        }
    }

    fn feature_lock(&self, feature_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.feature_locks.lock().expect("feature lock map poisoned");
        locks
            .entry(feature_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drop the map entry once no other caller holds or waits on the lock.
    fn release_feature_lock(&self, feature_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.feature_locks.lock().expect("feature lock map poisoned");
        // One reference is the map's, one is ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(feature_id);
        }
    }
}

/// Send a notification under a deadline. Failures are logged, never raised.
async fn deliver(
    notifier: Arc<dyn Notifier>,
    notification: Notification,
    deadline: Duration,
) -> bool {
    match tokio::time::timeout(deadline, notifier.send(&notification)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "notification failed");
            false
        }
        Err(_) => {
            tracing::warn!("notification timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::template_features;
    use crate::models::{Complexity, CreateEpicInput};

    #[test]
    fn block_notification_is_the_only_best_effort_hook() {
        for action in Action::ALL {
            for hook in hooks_for(*action) {
                assert_eq!(hook.is_best_effort(), *hook == Hook::NotifyStakeholders);
            }
        }
    }

    #[test]
    fn rework_and_resume_have_no_hooks() {
        assert!(hooks_for(Action::Rework).is_empty());
        assert!(hooks_for(Action::Resume).is_empty());
    }

    #[test]
    fn complete_releases_capacity_last() {
        assert_eq!(hooks_for(Action::Complete).last(), Some(&Hook::ReleaseCapacity));
    }

    fn engine_with_feature() -> (LifecycleEngine, String) {
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();
        let detail = db
            .create_epic_with_features(
                CreateEpicInput {
                    name: "Checkout".into(),
                    description: String::new(),
                    complexity: Complexity::Small,
                    milestones: Vec::new(),
                },
                template_features("Checkout", "", Complexity::Small),
            )
            .unwrap();
        let feature_id = detail.features[0].id.clone();
        (LifecycleEngine::new(db, Collaborators::local(None)), feature_id)
    }

    #[tokio::test]
    async fn feature_locks_are_dropped_after_each_transition() {
        let (engine, feature_id) = engine_with_feature();

        engine.transition(&feature_id, Action::Start, None).await.unwrap();
        assert!(engine.feature_locks.lock().unwrap().is_empty());

        let _ = engine.transition(&feature_id, Action::Complete, None).await;
        assert!(engine.feature_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_map_is_empty_after_concurrent_transitions() {
        let (engine, feature_id) = engine_with_feature();

        let attempts: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                let id = feature_id.clone();
                tokio::spawn(async move { engine.transition(&id, Action::Start, None).await })
            })
            .collect();
        let mut started = 0;
        for attempt in attempts {
            if attempt.await.unwrap().is_ok() {
                started += 1;
            }
        }

        assert_eq!(started, 1);
        assert!(engine.feature_locks.lock().unwrap().is_empty());
    }
}
