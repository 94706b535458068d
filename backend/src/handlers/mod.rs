use axum::{extract::State, http::StatusCode, response::Json};
use serde_json::json;
use std::sync::Arc;

use crate::{database, AppState};

pub mod workflows;

pub use workflows::{assignment_routes, event_routes, execution_routes, workflow_routes};

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let (storage, healthy) = match &state.db_pool {
        Some(pool) => ("postgres", database::health_check(pool).await),
        None => ("memory", true),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "service": "compass-automation",
            "storage": storage
        })),
    )
}
