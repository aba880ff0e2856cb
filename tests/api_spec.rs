mod common;

use axum::http::StatusCode;
use axum_test::TestServer;
use epicflow::api::{create_router, AppState, SecurityConfig};
use epicflow::decompose::Decomposer;
use epicflow::lifecycle::LifecycleEngine;
use epicflow::models::*;
use epicflow::orchestrator::Orchestrator;
use serde_json::json;

use common::setup_engine;

fn server_for(engine: LifecycleEngine, security: SecurityConfig) -> TestServer {
    let state = AppState::new(Orchestrator::new(engine), Decomposer::new()).with_capacity(2);
    TestServer::new(create_router(state, security)).expect("Failed to create test server")
}

fn setup() -> TestServer {
    let (engine, _fake) = setup_engine();
    server_for(engine, SecurityConfig::disabled())
}

async fn create_test_epic(server: &TestServer, complexity: &str) -> EpicDetail {
    let response = server
        .post("/api/v1/epics")
        .json(&json!({
            "name": "Payments Refactor",
            "description": "Split the payment service",
            "complexity": complexity,
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    response.json::<EpicDetail>()
}

mod health {
    use super::*;

    #[tokio::test]
    async fn reports_ok() {
        let server = setup();

        let response = server.get("/api/v1/health").await;

        response.assert_status_ok();
        response.assert_json(&json!({ "status": "ok" }));
    }
}

mod epics {
    use super::*;

    #[tokio::test]
    async fn creates_an_epic_with_template_features() {
        let server = setup();

        let detail = create_test_epic(&server, "medium").await;

        assert_eq!(detail.epic.name, "Payments Refactor");
        assert_eq!(detail.features.len(), 4);
        assert!(detail.features.iter().all(|f| f.stage == Stage::Planning));
        assert_eq!(detail.epic.milestones.len(), 2);
    }

    #[tokio::test]
    async fn rejects_an_empty_name() {
        let server = setup();

        let response = server
            .post("/api/v1/epics")
            .json(&json!({ "name": "  ", "complexity": "small" }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
        let epics: Vec<Epic> = server.get("/api/v1/epics").await.json();
        assert!(epics.is_empty());
    }

    #[tokio::test]
    async fn lists_and_fetches_epics() {
        let server = setup();
        let created = create_test_epic(&server, "small").await;

        let epics: Vec<Epic> = server.get("/api/v1/epics").await.json();
        assert_eq!(epics.len(), 1);

        let response = server
            .get(&format!("/api/v1/epics/{}", created.epic.id))
            .await;
        response.assert_status_ok();
        let fetched: EpicDetail = response.json();
        assert_eq!(fetched.epic.id, created.epic.id);
        assert_eq!(fetched.features.len(), 2);
    }

    #[tokio::test]
    async fn missing_epic_is_not_found() {
        let server = setup();

        server
            .get("/api/v1/epics/epic_0_0_missing")
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .get("/api/v1/epics/epic_0_0_missing/tasks")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}

mod features {
    use super::*;

    #[tokio::test]
    async fn starting_a_feature_creates_its_tasks() {
        let server = setup();
        let detail = create_test_epic(&server, "small").await;
        let feature = &detail.features[0];

        let response = server
            .post(&format!("/api/v1/features/{}/transitions", feature.id))
            .json(&json!({ "action": "start" }))
            .await;

        response.assert_status_ok();
        let started: Feature = response.json();
        assert_eq!(started.stage, Stage::InProgress);
        assert_eq!(started.version, feature.version + 1);

        let tasks: Vec<Task> = server
            .get(&format!("/api/v1/epics/{}/tasks", detail.epic.id))
            .await
            .json();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].stage, Stage::InProgress);

        let events: Vec<LifecycleEvent> = server
            .get(&format!("/api/v1/features/{}/events", feature.id))
            .await
            .json();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, Action::Start);
        assert_eq!(events[0].outcome, EventOutcome::Succeeded);
    }

    #[tokio::test]
    async fn illegal_transition_is_unprocessable() {
        let server = setup();
        let detail = create_test_epic(&server, "small").await;
        let feature = &detail.features[0];

        let response = server
            .post(&format!("/api/v1/features/{}/transitions", feature.id))
            .json(&json!({ "action": "complete" }))
            .await;

        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        let unchanged: Feature = server
            .get(&format!("/api/v1/features/{}", feature.id))
            .await
            .json();
        assert_eq!(unchanged.stage, Stage::Planning);
    }

    #[tokio::test]
    async fn unknown_feature_is_not_found() {
        let server = setup();

        server
            .post("/api/v1/features/feature_0_0_missing/transitions")
            .json(&json!({ "action": "start" }))
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .get("/api/v1/features/feature_0_0_missing/events")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn hook_failure_is_a_bad_gateway() {
        let (engine, fake) = setup_engine();
        fake.fail("create_branch");
        let server = server_for(engine, SecurityConfig::disabled());
        let detail = create_test_epic(&server, "small").await;

        let response = server
            .post(&format!("/api/v1/features/{}/transitions", detail.features[0].id))
            .json(&json!({ "action": "start" }))
            .await;

        response.assert_status(StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn filters_by_stage() {
        let server = setup();
        let detail = create_test_epic(&server, "medium").await;
        server
            .post(&format!("/api/v1/features/{}/transitions", detail.features[0].id))
            .json(&json!({ "action": "start" }))
            .await
            .assert_status_ok();

        let active: Vec<Feature> = server
            .get("/api/v1/features")
            .add_query_param("stage", "in_progress")
            .await
            .json();
        let all: Vec<Feature> = server.get("/api/v1/features").await.json();

        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, detail.features[0].id);
        assert_eq!(all.len(), 4);
    }
}

mod tasks {
    use super::*;

    #[tokio::test]
    async fn completes_a_task() {
        let server = setup();
        let detail = create_test_epic(&server, "small").await;
        server
            .post(&format!("/api/v1/features/{}/transitions", detail.features[0].id))
            .json(&json!({ "action": "start" }))
            .await
            .assert_status_ok();
        let tasks: Vec<Task> = server
            .get(&format!("/api/v1/epics/{}/tasks", detail.epic.id))
            .await
            .json();

        let response = server
            .put(&format!("/api/v1/tasks/{}/complete", tasks[0].id))
            .await;

        response.assert_status_ok();
        let task: Task = response.json();
        assert!(task.completed);
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let server = setup();

        server
            .get("/api/v1/tasks/task_0_0_missing")
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .put("/api/v1/tasks/task_0_0_missing/complete")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}

mod orchestration {
    use super::*;

    #[tokio::test]
    async fn auto_pass_starts_up_to_the_default_capacity() {
        let server = setup();
        create_test_epic(&server, "medium").await;

        let response = server
            .post("/api/v1/orchestrate")
            .json(&json!({ "mode": "auto" }))
            .await;

        response.assert_status_ok();
        let plan: OrchestrationPlan = response.json();
        assert_eq!(plan.capacity, 2);
        assert_eq!(plan.active_after, 2);

        let stored: OrchestrationPlan = server
            .get(&format!("/api/v1/plans/{}", plan.id))
            .await
            .json();
        assert_eq!(stored, plan);
    }

    #[tokio::test]
    async fn suggest_is_the_default_mode() {
        let server = setup();
        create_test_epic(&server, "small").await;

        let plan: OrchestrationPlan = server
            .post("/api/v1/orchestrate")
            .json(&json!({ "capacity": 1 }))
            .await
            .json();

        assert_eq!(plan.mode, OrchestrationMode::Suggest);
        assert_eq!(plan.active_after, 0);
        let plans: Vec<OrchestrationPlan> = server.get("/api/v1/plans").await.json();
        assert_eq!(plans.len(), 1);
    }

    #[tokio::test]
    async fn interactive_mode_is_rejected() {
        let server = setup();

        server
            .post("/api/v1/orchestrate")
            .json(&json!({ "mode": "interactive" }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_plan_is_not_found() {
        let server = setup();

        server
            .get("/api/v1/plans/plan_0_0_missing")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}

mod auth {
    use super::*;

    fn secured() -> TestServer {
        let (engine, _fake) = setup_engine();
        server_for(engine, SecurityConfig::with_api_key("s3cret"))
    }

    #[tokio::test]
    async fn rejects_requests_without_a_token() {
        let server = secured();

        server
            .get("/api/v1/epics")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_a_wrong_token() {
        let server = secured();

        server
            .get("/api/v1/epics")
            .authorization_bearer("wrong")
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepts_the_configured_token() {
        let server = secured();

        server
            .get("/api/v1/epics")
            .authorization_bearer("s3cret")
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let server = secured();

        server.get("/api/v1/health").await.assert_status_ok();
    }
}
