mod handlers;
pub mod middleware;

use axum::{
    http::HeaderValue,
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::db::Database;
use crate::decompose::Decomposer;
use crate::lifecycle::LifecycleEngine;
use crate::orchestrator::{Orchestrator, DEFAULT_CAPACITY};

pub use middleware::SecurityConfig;

/// Shared handler state. Every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub engine: LifecycleEngine,
    pub orchestrator: Orchestrator,
    pub decomposer: Decomposer,
    /// Capacity used by `POST /orchestrate` when the request names none.
    pub capacity: usize,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, decomposer: Decomposer) -> Self {
        let engine = orchestrator.engine().clone();
        Self {
            db: engine.db().clone(),
            engine,
            orchestrator,
            decomposer,
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

pub fn create_router(state: AppState, security: SecurityConfig) -> Router {
    let api = Router::new()
        // Epics
        .route("/epics", get(handlers::list_epics).post(handlers::create_epic))
        .route("/epics/{id}", get(handlers::get_epic))
        .route("/epics/{id}/tasks", get(handlers::list_epic_tasks))
        // Features
        .route("/features", get(handlers::list_features))
        .route("/features/{id}", get(handlers::get_feature))
        .route("/features/{id}/transitions", post(handlers::transition_feature))
        .route("/features/{id}/events", get(handlers::list_feature_events))
        // Tasks
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}/complete", put(handlers::complete_task))
        // Orchestration
        .route("/orchestrate", post(handlers::orchestrate))
        .route("/plans", get(handlers::list_plans))
        .route("/plans/{id}", get(handlers::get_plan))
        .route_layer(from_fn_with_state(security.clone(), middleware::auth_middleware))
        // Health stays reachable without credentials.
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&security)),
        )
        .with_state(state)
}

fn cors_layer(security: &SecurityConfig) -> CorsLayer {
    match &security.cors_origins {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| match o.parse() {
                    Ok(v) => Some(v),
                    Err(_) => {
                        tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    }
}
