use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::error::FlowError;
use crate::models::*;

type ApiResult<T> = Result<T, (StatusCode, String)>;

// ============================================================
// Error Handling
// ============================================================

/// Map a domain error to a status code. Storage errors are logged and
/// returned without detail.
fn api_error(e: FlowError) -> (StatusCode, String) {
    let status = match &e {
        FlowError::Validation(_) => StatusCode::BAD_REQUEST,
        FlowError::NotFound { .. } => StatusCode::NOT_FOUND,
        FlowError::Conflict(_) => StatusCode::CONFLICT,
        FlowError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        FlowError::HookFailure { .. } => StatusCode::BAD_GATEWAY,
        FlowError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        FlowError::Storage(_) => {
            tracing::error!(error = %e, "internal error");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            );
        }
    };
    tracing::debug!(status = %status, error = %e, "request failed");
    (status, e.to_string())
}

fn not_found(entity: &'static str, id: String) -> (StatusCode, String) {
    api_error(FlowError::not_found(entity, id))
}

// ============================================================
// Health
// ============================================================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================
// Epics
// ============================================================

#[derive(Debug, Deserialize)]
pub struct CreateEpicRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub complexity: Complexity,
}

pub async fn list_epics(State(state): State<AppState>) -> ApiResult<Json<Vec<Epic>>> {
    state.db.list_epics().map(Json).map_err(api_error)
}

pub async fn create_epic(
    State(state): State<AppState>,
    Json(input): Json<CreateEpicRequest>,
) -> ApiResult<(StatusCode, Json<EpicDetail>)> {
    state
        .decomposer
        .create_epic(&state.db, &input.name, &input.description, input.complexity)
        .await
        .map(|detail| (StatusCode::CREATED, Json(detail)))
        .map_err(api_error)
}

pub async fn get_epic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EpicDetail>> {
    state
        .db
        .get_epic_detail(&id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found("epic", id))
}

#[derive(Debug, Deserialize)]
pub struct StageQuery {
    pub stage: Option<Stage>,
}

pub async fn list_epic_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StageQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    if state.db.get_epic(&id).map_err(api_error)?.is_none() {
        return Err(not_found("epic", id));
    }
    state
        .db
        .list_tasks_by_epic(&id, query.stage)
        .map(Json)
        .map_err(api_error)
}

// ============================================================
// Features
// ============================================================

#[derive(Debug, Deserialize)]
pub struct FeatureQuery {
    pub stage: Option<Stage>,
    pub assignee: Option<String>,
}

pub async fn list_features(
    State(state): State<AppState>,
    Query(query): Query<FeatureQuery>,
) -> ApiResult<Json<Vec<Feature>>> {
    let features = match (&query.stage, &query.assignee) {
        (Some(stage), _) => state.db.list_features_by_stage(*stage),
        (None, Some(assignee)) => state.db.list_features_by_assignee(assignee),
        (None, None) => state.db.list_all_features(),
    }
    .map_err(api_error)?;

    let features = match (&query.stage, &query.assignee) {
        (Some(_), Some(assignee)) => features
            .into_iter()
            .filter(|f| f.assigned_to.as_deref() == Some(assignee.as_str()))
            .collect(),
        _ => features,
    };
    Ok(Json(features))
}

pub async fn get_feature(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Feature>> {
    state
        .db
        .get_feature(&id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found("feature", id))
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub action: Action,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn transition_feature(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<TransitionRequest>,
) -> ApiResult<Json<Feature>> {
    state
        .engine
        .transition(&id, input.action, input.reason)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn list_feature_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<LifecycleEvent>>> {
    state.db.require_feature(&id).map_err(api_error)?;
    state.db.list_events(&id).map(Json).map_err(api_error)
}

// ============================================================
// Tasks
// ============================================================

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    state
        .db
        .get_task(&id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found("task", id))
}

pub async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    state.db.complete_task(&id).map(Json).map_err(api_error)
}

// ============================================================
// Orchestration
// ============================================================

#[derive(Debug, Default, Deserialize)]
pub struct OrchestrateRequest {
    #[serde(default)]
    pub mode: OrchestrationMode,
    pub capacity: Option<usize>,
}

pub async fn orchestrate(
    State(state): State<AppState>,
    Json(input): Json<OrchestrateRequest>,
) -> ApiResult<Json<OrchestrationPlan>> {
    if input.mode == OrchestrationMode::Interactive {
        return Err(api_error(FlowError::Validation(
            "interactive mode is only available from the CLI".into(),
        )));
    }
    let capacity = input.capacity.unwrap_or(state.capacity);
    state
        .orchestrator
        .orchestrate(input.mode, capacity, CancellationToken::new())
        .await
        .map(Json)
        .map_err(api_error)
}

#[derive(Debug, Deserialize)]
pub struct PlanQuery {
    pub limit: Option<usize>,
}

pub async fn list_plans(
    State(state): State<AppState>,
    Query(query): Query<PlanQuery>,
) -> ApiResult<Json<Vec<OrchestrationPlan>>> {
    state
        .db
        .list_plans(query.limit.unwrap_or(20))
        .map(Json)
        .map_err(api_error)
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OrchestrationPlan>> {
    state
        .db
        .get_plan(&id)
        .map_err(api_error)?
        .map(Json)
        .ok_or_else(|| not_found("plan", id))
}
