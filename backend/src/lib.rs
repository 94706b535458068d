// Compass Automation Backend
//
// Library half of the service: the workflow engine, its collaborators and the
// HTTP routes. `main.rs` wires these to real infrastructure.

use axum::{http::Method, routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod services;
pub mod workflows;

pub use error::{ApiError, ApiResult, AppError};

use services::email::Mailer;
use services::entities::EntityStore;
use services::webhook::WebhookClient;
use workflows::{ActionExecutor, AssignmentRuleEngine, AssignmentRuleStore, WorkflowEngine, WorkflowStore};

pub struct AppState {
    pub engine: WorkflowEngine,
    /// Present when running against PostgreSQL
    pub db_pool: Option<sqlx::PgPool>,
}

impl AppState {
    pub fn new(engine: WorkflowEngine, db_pool: Option<sqlx::PgPool>) -> Arc<Self> {
        Arc::new(Self { engine, db_pool })
    }
}

/// Assemble the engine around one store that holds both workflows and assignment rules.
pub fn build_engine<S>(
    store: Arc<S>,
    entities: Arc<dyn EntityStore>,
    mailer: Arc<dyn Mailer>,
    webhooks: WebhookClient,
) -> WorkflowEngine
where
    S: WorkflowStore + AssignmentRuleStore + 'static,
{
    let assignment = AssignmentRuleEngine::new(store.clone(), entities.clone());
    let executor = ActionExecutor::new(entities.clone(), mailer, webhooks, assignment);
    WorkflowEngine::new(store, entities, executor)
}

pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Compass Automation API v0.1.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/workflows", handlers::workflow_routes())
        .nest("/api/v1/events", handlers::event_routes())
        .nest("/api/v1/executions", handlers::execution_routes())
        .nest("/api/v1/assignments", handlers::assignment_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}
