//! The capacity scheduler.
//!
//! One pass takes a registry snapshot, decides which features to escalate,
//! start, advance or hold, executes the executable decisions according to the
//! [`OrchestrationMode`], and persists the resulting [`OrchestrationPlan`].
//!
//! Passes never overlap: each takes the registry run lease first. Within a
//! pass, transitions are dispatched to a worker pool bounded by the capacity
//! limit, and a failed transition only marks its own decision as failed.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::error::{FlowError, Result};
use crate::lifecycle::hooks::Notification;
use crate::lifecycle::{table, LifecycleEngine};
use crate::models::*;

pub const DEFAULT_CAPACITY: usize = 3;
pub const DEFAULT_ESCALATE_AFTER_HOURS: i64 = 24;
pub const DEFAULT_LOCK_STALE_SECS: i64 = 3600;

/// Asks an operator whether an interactive decision should be executed.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, decision: &Decision) -> bool;
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Blocked features older than this are escalated.
    pub escalate_after: chrono::Duration,
    /// A run lease older than this is considered abandoned.
    pub lock_stale_after: chrono::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            escalate_after: chrono::Duration::hours(DEFAULT_ESCALATE_AFTER_HOURS),
            lock_stale_after: chrono::Duration::seconds(DEFAULT_LOCK_STALE_SECS),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    engine: LifecycleEngine,
    config: OrchestratorConfig,
    confirm: Option<Arc<dyn Confirm>>,
}

/// Registry state read at the start of a pass.
struct Snapshot {
    active: Option<usize>,
    blocked: Vec<(Feature, DateTime<Utc>)>,
    planning: Vec<Feature>,
    in_flight: Vec<Feature>,
    warnings: Vec<String>,
}

impl Orchestrator {
    pub fn new(engine: LifecycleEngine) -> Self {
        Self {
            engine,
            config: OrchestratorConfig::default(),
            confirm: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Confirmation source for [`OrchestrationMode::Interactive`]. Without
    /// one, every interactive decision is declined.
    pub fn with_confirm(mut self, confirm: Arc<dyn Confirm>) -> Self {
        self.confirm = Some(confirm);
        self
    }

    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    fn db(&self) -> &Database {
        self.engine.db()
    }

    /// Run one scheduling pass.
    ///
    /// Fails with [`FlowError::Conflict`] if another pass holds the run
    /// lease, and with [`FlowError::Storage`] if the registry cannot be
    /// reached at all. Partial query failures produce an `incomplete` plan
    /// instead of an error.
    pub async fn orchestrate(
        &self,
        mode: OrchestrationMode,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Result<OrchestrationPlan> {
        let holder = generate_id("run");
        if !self
            .db()
            .acquire_run_lock(&holder, self.config.lock_stale_after)?
        {
            return Err(FlowError::Conflict(
                "another orchestration pass is in progress".into(),
            ));
        }

        let result = self.run_pass(mode, capacity, cancel).await;

        if let Err(e) = self.db().release_run_lock(&holder) {
            tracing::error!(holder = %holder, error = %e, "failed to release orchestration lease");
        }
        result
    }

    /// Repeat passes every `interval` until `cancel` fires. A pass skipped
    /// because another one holds the lease is not an error.
    pub async fn run_periodic<F>(
        &self,
        mode: OrchestrationMode,
        capacity: usize,
        interval: Duration,
        cancel: CancellationToken,
        mut on_plan: F,
    ) -> Result<usize>
    where
        F: FnMut(&OrchestrationPlan),
    {
        let mut passes = 0;
        loop {
            match self.orchestrate(mode, capacity, cancel.clone()).await {
                Ok(plan) => {
                    passes += 1;
                    on_plan(&plan);
                }
                Err(FlowError::Conflict(msg)) => {
                    tracing::info!(reason = %msg, "skipping pass");
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(passes, "periodic orchestration stopped");
                    return Ok(passes);
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn run_pass(
        &self,
        mode: OrchestrationMode,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Result<OrchestrationPlan> {
        let now = now();
        let snapshot = self.snapshot();

        let active_before = snapshot.active.unwrap_or(0);
        let available = match snapshot.active {
            Some(active) => capacity.saturating_sub(active),
            None => 0,
        };

        tracing::info!(
            mode = %mode,
            capacity,
            active = active_before,
            available,
            "orchestration pass started"
        );

        let mut warnings = snapshot.warnings;
        let mut decisions = Vec::new();
        let mut escalations = Vec::new();

        for (feature, blocked_since) in &snapshot.blocked {
            let blocked_for = now - *blocked_since;
            let d = self.escalation(feature, blocked_for);
            if d.kind == DecisionKind::Escalate {
                escalations.push((decisions.len(), blocked_for.num_hours()));
            }
            decisions.push(d);
        }

        for feature in select_starts(snapshot.planning, available) {
            let rationale = format!(
                "capacity available ({available} of {capacity} free), priority {}",
                feature.priority
            );
            decisions.push(decision(&feature, DecisionKind::Start, Some(Action::Start), rationale));
        }

        for feature in &snapshot.in_flight {
            match self.exit_decision(feature) {
                Ok(d) => decisions.push(d),
                Err(e) => {
                    warnings.push(format!("exit criteria for {} unavailable: {e}", feature.id));
                }
            }
        }

        let mut plan = OrchestrationPlan {
            id: generate_id("plan"),
            mode,
            capacity,
            active_before,
            active_after: active_before,
            available,
            incomplete: !warnings.is_empty(),
            decisions,
            warnings,
            cancelled: false,
            created_at: now,
        };

        match mode {
            OrchestrationMode::Suggest => {}
            OrchestrationMode::Auto => {
                self.send_escalations(&mut plan, &escalations).await;
                self.execute(&mut plan, capacity, &cancel).await;
            }
            OrchestrationMode::Interactive => {
                self.confirm_decisions(&mut plan, &cancel).await;
                self.execute(&mut plan, capacity, &cancel).await;
            }
        }

        plan.active_after = match self.db().count_features_in_stages(Stage::CAPACITY_CONSUMING) {
            Ok(n) => n,
            Err(e) => {
                plan.warnings.push(format!("could not recount active features: {e}"));
                plan.incomplete = true;
                plan.active_before
            }
        };

        self.db().save_plan(&plan)?;

        tracing::info!(
            plan_id = %plan.id,
            mode = %mode,
            decisions = plan.decisions.len(),
            active_after = plan.active_after,
            incomplete = plan.incomplete,
            cancelled = plan.cancelled,
            "orchestration pass finished"
        );
        Ok(plan)
    }

    fn snapshot(&self) -> Snapshot {
        let db = self.db();
        let mut warnings = Vec::new();

        let active = match db.count_features_in_stages(Stage::CAPACITY_CONSUMING) {
            Ok(n) => Some(n),
            Err(e) => {
                warnings.push(format!("active count unavailable, no features started: {e}"));
                None
            }
        };

        let mut blocked = Vec::new();
        match db.list_features_by_stage(Stage::Blocked) {
            Ok(features) => {
                for feature in features {
                    let since = match db.latest_event(&feature.id, Action::Block, EventOutcome::Succeeded) {
                        Ok(Some(event)) => event.created_at,
                        Ok(None) => feature.updated_at,
                        Err(e) => {
                            warnings.push(format!("block time of {} unavailable: {e}", feature.id));
                            feature.updated_at
                        }
                    };
                    blocked.push((feature, since));
                }
            }
            Err(e) => warnings.push(format!("blocked features unavailable: {e}")),
        }
        blocked.sort_by(|a, b| a.1.cmp(&b.1));

        let planning = db
            .list_features_by_stage(Stage::Planning)
            .unwrap_or_else(|e| {
                warnings.push(format!("planning features unavailable: {e}"));
                Vec::new()
            });

        let mut in_flight = Vec::new();
        for stage in Stage::CAPACITY_CONSUMING {
            match db.list_features_by_stage(*stage) {
                Ok(features) => in_flight.extend(features),
                Err(e) => warnings.push(format!("{stage} features unavailable: {e}")),
            }
        }

        for warning in &warnings {
            tracing::warn!(warning = %warning, "degraded registry snapshot");
        }

        Snapshot {
            active,
            blocked,
            planning,
            in_flight,
            warnings,
        }
    }

    fn escalation(&self, feature: &Feature, blocked_for: chrono::Duration) -> Decision {
        let hours = blocked_for.num_hours();
        if blocked_for >= self.config.escalate_after {
            decision(
                feature,
                DecisionKind::Escalate,
                None,
                format!(
                    "blocked for {hours}h, over the {}h threshold",
                    self.config.escalate_after.num_hours()
                ),
            )
        } else {
            decision(feature, DecisionKind::Hold, None, format!("blocked for {hours}h"))
        }
    }

    /// Decide whether a feature in a capacity-consuming stage may move on.
    fn exit_decision(&self, feature: &Feature) -> Result<Decision> {
        let db = self.db();
        let advance = |action: Action, rationale: String| {
            decision(feature, DecisionKind::Advance, Some(action), rationale)
        };
        let hold = |rationale: &str| decision(feature, DecisionKind::Hold, None, rationale.to_string());

        let d = match feature.stage {
            Stage::InProgress | Stage::Implementation => {
                let tasks: Vec<Task> = db
                    .list_tasks_by_feature(&feature.id)?
                    .into_iter()
                    .filter(|t| t.stage == feature.stage)
                    .collect();
                let summary = TaskSummary::of(&tasks);
                if summary.completed == summary.total {
                    let action = table::advance_action(feature.stage)
                        .ok_or_else(|| FlowError::Validation(format!("no advance from {}", feature.stage)))?;
                    advance(
                        action,
                        format!("all {} {} tasks complete", summary.total, feature.stage),
                    )
                } else {
                    hold(&format!(
                        "{} of {} {} tasks complete",
                        summary.completed, summary.total, feature.stage
                    ))
                }
            }
            Stage::Testing => {
                let last = db.latest_event(&feature.id, Action::Test, EventOutcome::Succeeded)?;
                match last.map(|e| metadata_flag(&e, "passed")) {
                    Some(Some(true)) => advance(Action::Review, "tests passed".into()),
                    Some(Some(false)) => hold("tests failing"),
                    _ => hold("no test result recorded"),
                }
            }
            Stage::Review => {
                let last = db.latest_event(&feature.id, Action::Review, EventOutcome::Succeeded)?;
                match last.map(|e| metadata_flag(&e, "gates_passed")) {
                    Some(Some(true)) => advance(Action::Complete, "quality gates passed".into()),
                    Some(Some(false)) => advance(Action::Rework, "quality gates failed".into()),
                    _ => hold("no quality gate result recorded"),
                }
            }
            other => hold(&format!("stage {other} has no exit criteria")),
        };
        Ok(d)
    }

    /// Notify stakeholders of each escalation. Delivery is best-effort.
    async fn send_escalations(&self, plan: &mut OrchestrationPlan, escalations: &[(usize, i64)]) {
        for &(idx, hours) in escalations {
            let d = &mut plan.decisions[idx];
            let delivered = self
                .engine
                .notify(Notification::Escalation {
                    feature_id: d.feature_id.clone(),
                    blocked_for_hours: hours,
                })
                .await;
            if delivered {
                d.status = DecisionStatus::Executed;
            } else {
                d.status = DecisionStatus::Failed;
                d.error = Some("escalation notification not delivered".into());
            }
        }
    }

    async fn confirm_decisions(&self, plan: &mut OrchestrationPlan, cancel: &CancellationToken) {
        let Some(confirm) = &self.confirm else {
            plan.warnings
                .push("interactive mode without a confirmation source, nothing executed".into());
            for d in plan.decisions.iter_mut().filter(|d| d.is_executable()) {
                d.status = DecisionStatus::Declined;
            }
            return;
        };

        for d in plan.decisions.iter_mut().filter(|d| d.is_executable()) {
            if cancel.is_cancelled() {
                break;
            }
            if !confirm.confirm(d).await {
                tracing::info!(feature_id = %d.feature_id, kind = %d.kind, "decision declined");
                d.status = DecisionStatus::Declined;
            }
        }
    }

    /// Execute every still-proposed executable decision on a bounded pool.
    async fn execute(&self, plan: &mut OrchestrationPlan, capacity: usize, cancel: &CancellationToken) {
        let pool = Arc::new(Semaphore::new(capacity.max(1)));
        let mut join_set: JoinSet<(usize, Result<Feature>)> = JoinSet::new();

        for (idx, d) in plan.decisions.iter_mut().enumerate() {
            if !d.is_executable() || d.status != DecisionStatus::Proposed {
                continue;
            }
            let Some(action) = d.action else { continue };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = pool.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                plan.cancelled = true;
                d.status = DecisionStatus::Skipped;
                continue;
            };

            // Overwritten when the worker reports back.
            d.status = DecisionStatus::Failed;
            d.error = Some("worker did not report".into());

            let engine = self.engine.clone();
            let feature_id = d.feature_id.clone();
            let reason = d.rationale.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let result = engine
                    .transition_within(&feature_id, action, Some(reason), Some(capacity))
                    .await;
                (idx, result)
            });
        }

        if plan.cancelled {
            tracing::info!(
                in_flight = join_set.len(),
                "orchestration cancelled, waiting for in-flight transitions"
            );
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, Ok(feature))) => {
                    let d = &mut plan.decisions[idx];
                    d.status = DecisionStatus::Executed;
                    d.error = None;
                    tracing::info!(feature_id = %feature.id, stage = %feature.stage, "decision executed");
                }
                Ok((idx, Err(e))) => {
                    let d = &mut plan.decisions[idx];
                    tracing::warn!(feature_id = %d.feature_id, error = %e, "decision failed");
                    d.status = DecisionStatus::Failed;
                    d.error = Some(e.to_string());
                }
                Err(e) => {
                    tracing::error!(error = %e, "transition worker panicked");
                    plan.warnings.push(format!("transition worker panicked: {e}"));
                }
            }
        }
    }
}

/// Planning features in start order: priority desc, then creation time asc,
/// then position within the epic.
fn select_starts(mut planning: Vec<Feature>, available: usize) -> Vec<Feature> {
    planning.sort_by_key(|f| (Reverse(f.priority.rank()), f.created_at, f.position));
    planning.truncate(available);
    planning
}

fn decision(feature: &Feature, kind: DecisionKind, action: Option<Action>, rationale: String) -> Decision {
    Decision {
        feature_id: feature.id.clone(),
        feature_name: feature.name.clone(),
        kind,
        action,
        stage: feature.stage,
        rationale,
        status: DecisionStatus::Proposed,
        error: None,
    }
}

fn metadata_flag(event: &LifecycleEvent, key: &str) -> Option<bool> {
    event.metadata.get(key).and_then(|v| v.as_bool())
}
