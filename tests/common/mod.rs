#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use epicflow::db::Database;
use epicflow::decompose::template_features;
use epicflow::lifecycle::hooks::*;
use epicflow::lifecycle::LifecycleEngine;
use epicflow::models::*;

/// One fake standing in for every collaborator. Operations can be told to
/// fail or to stall; every call is recorded by name.
#[derive(Default)]
pub struct FakeCollaborator {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    failing_features: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    tests_failing: Mutex<bool>,
    gates_failing: Mutex<bool>,
    notifications: Mutex<Vec<Notification>>,
}

impl FakeCollaborator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    /// Make every operation on one feature fail.
    pub fn fail_feature(&self, feature_id: &str) {
        self.failing_features.lock().unwrap().insert(feature_id.to_string());
    }

    pub fn recover(&self, op: &'static str) {
        self.failing.lock().unwrap().remove(op);
    }

    pub fn stall(&self, op: &'static str, delay: Duration) {
        self.delays.lock().unwrap().insert(op, delay);
    }

    pub fn set_tests_passing(&self, passing: bool) {
        *self.tests_failing.lock().unwrap() = !passing;
    }

    pub fn set_gates_passing(&self, passing: bool) {
        *self.gates_failing.lock().unwrap() = !passing;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    /// Block notifications are sent in the background; poll until `count`
    /// have arrived or a second has passed.
    pub async fn wait_for_notifications(&self, count: usize) -> Vec<Notification> {
        for _ in 0..100 {
            if self.notifications.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.notifications()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == op).count()
    }

    async fn call(&self, op: &'static str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(op.to_string());
        let delay = self.delays.lock().unwrap().get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(op) {
            anyhow::bail!("{op} unavailable");
        }
        Ok(())
    }

    async fn call_for(&self, op: &'static str, feature: &Feature) -> anyhow::Result<()> {
        self.call(op).await?;
        if self.failing_features.lock().unwrap().contains(&feature.id) {
            anyhow::bail!("{op} failed for {}", feature.id);
        }
        Ok(())
    }
}

#[async_trait]
impl VersionControl for FakeCollaborator {
    async fn create_branch(&self, feature: &Feature, _branch: &str) -> anyhow::Result<()> {
        self.call_for("create_branch", feature).await
    }

    async fn provision_environment(&self, _feature: &Feature, _branch: &str) -> anyhow::Result<()> {
        self.call("provision_environment").await
    }

    async fn merge(&self, _feature: &Feature, _branch: &str) -> anyhow::Result<()> {
        self.call("merge").await
    }

    async fn update_docs(&self, _feature: &Feature) -> anyhow::Result<()> {
        self.call("update_docs").await
    }
}

#[async_trait]
impl TestRunner for FakeCollaborator {
    async fn run_checks(&self, _feature: &Feature) -> anyhow::Result<CheckReport> {
        self.call("run_checks").await?;
        Ok(CheckReport {
            passed: true,
            findings: Vec::new(),
        })
    }

    async fn run(&self, feature: &Feature, _timeout: Duration) -> anyhow::Result<TestOutcome> {
        self.call_for("run_tests", feature).await?;
        Ok(TestOutcome {
            passed: !*self.tests_failing.lock().unwrap(),
            coverage: Some(87.5),
        })
    }
}

#[async_trait]
impl ReviewSystem for FakeCollaborator {
    async fn open_request(&self, feature: &Feature, _branch: &str) -> anyhow::Result<String> {
        self.call("open_request").await?;
        Ok(format!("https://review.test/{}", feature.id))
    }

    async fn run_gates(&self, _feature: &Feature) -> anyhow::Result<GateReport> {
        self.call("run_gates").await?;
        Ok(GateReport {
            passed: !*self.gates_failing.lock().unwrap(),
            details: Vec::new(),
        })
    }
}

#[async_trait]
impl Notifier for FakeCollaborator {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        self.call("notify").await?;
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub fn collaborators(fake: &Arc<FakeCollaborator>) -> Collaborators {
    Collaborators {
        version_control: fake.clone(),
        test_runner: fake.clone(),
        review: fake.clone(),
        notifier: fake.clone(),
    }
}

pub fn setup_db() -> Database {
    let db = Database::open_memory().expect("Failed to create in-memory database");
    db.migrate().expect("Failed to run migrations");
    db
}

pub fn setup_engine() -> (LifecycleEngine, Arc<FakeCollaborator>) {
    let fake = FakeCollaborator::new();
    let engine = LifecycleEngine::new(setup_db(), collaborators(&fake));
    (engine, fake)
}

/// Register an epic decomposed from templates.
pub fn create_epic(db: &Database, name: &str, complexity: Complexity) -> EpicDetail {
    db.create_epic_with_features(
        CreateEpicInput {
            name: name.to_string(),
            description: format!("{name} description"),
            complexity,
            milestones: Vec::new(),
        },
        template_features(name, "", complexity),
    )
    .expect("Failed to create epic")
}

/// A single planning feature in a fresh small epic.
pub fn create_feature(db: &Database) -> Feature {
    let detail = create_epic(db, "Checkout", Complexity::Small);
    detail.features.into_iter().next().expect("template produced no features")
}

/// Drive a feature along the main path from wherever it is until it reaches
/// `stage`. `Blocked` is reached by blocking from `implementation`.
pub async fn drive_to(engine: &LifecycleEngine, feature_id: &str, stage: Stage) -> Feature {
    let path = [
        (Stage::Planning, Action::Start, Stage::InProgress),
        (Stage::InProgress, Action::Implement, Stage::Implementation),
        (Stage::Implementation, Action::Test, Stage::Testing),
        (Stage::Testing, Action::Review, Stage::Review),
        (Stage::Review, Action::Complete, Stage::Completed),
    ];

    if stage == Stage::Blocked {
        Box::pin(drive_to(engine, feature_id, Stage::Implementation)).await;
        return engine
            .transition(feature_id, Action::Block, Some("waiting on vendor".into()))
            .await
            .unwrap();
    }

    let mut feature = engine.db().require_feature(feature_id).unwrap();
    for (from, action, target) in path {
        if feature.stage == stage {
            break;
        }
        if feature.stage != from {
            continue;
        }
        feature = engine.transition(feature_id, action, None).await.unwrap();
        assert_eq!(feature.stage, target);
    }
    assert_eq!(feature.stage, stage);
    feature
}
