//! Workflow Automation Handlers
//!
//! Builder saves, event dispatch, execution inspection, approval decisions and
//! on-demand owner assignment.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use compass_shared::{Approval, Event, Execution, ExecutionAlert, WorkflowDefinition};

use crate::workflows::{AssignmentOutcome, SaveWorkflow};
use crate::{ApiResult, AppState};

const DEFAULT_EXECUTION_LIMIT: i64 = 50;

// ==================== Structs ====================

#[derive(Debug, Deserialize, Validate)]
pub struct SaveWorkflowRequest {
    pub id: Option<Uuid>,
    #[validate(length(min = 1, message = "Workflow name is required"))]
    pub name: String,
    pub description: Option<String>,
    pub builder_data: serde_json::Value,
    pub is_active: Option<bool>,
    pub tenant_id: Option<Uuid>,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub event_type: String,
    pub execution_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: Execution,
    pub approvals: Vec<Approval>,
    pub alerts: Vec<ExecutionAlert>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub approver: Option<Uuid>,
    pub comments: Option<String>,
    /// Resume right after deciding
    #[serde(default = "default_resume")]
    pub resume: bool,
}

fn default_resume() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub approval: Approval,
    /// `None` when the caller asked not to resume
    pub resumed: Option<bool>,
    pub execution: Execution,
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub resumed: bool,
    pub execution: Execution,
}

#[derive(Debug, Deserialize)]
pub struct AssignmentQuery {
    pub tenant_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct AssignmentResponse {
    pub module: String,
    pub record_id: String,
    pub outcome: &'static str,
    pub owner_id: Option<Uuid>,
    pub rule_id: Option<Uuid>,
    pub rule_name: Option<String>,
}

// ==================== Routes ====================

pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(save_workflow))
        .route("/:id", get(get_workflow))
        .route("/:id/executions", get(list_executions))
}

pub fn event_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", post(dispatch_event))
}

pub fn execution_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id", get(get_execution))
        .route("/:id/approve", post(approve_execution))
        .route("/:id/reject", post(reject_execution))
        .route("/:id/resume", post(resume_execution))
}

pub fn assignment_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:module/:record_id", post(assign_record))
}

// ==================== Handlers ====================

async fn save_workflow(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SaveWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<WorkflowDefinition>)> {
    payload.validate()?;

    let status = if payload.id.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    let workflow = state
        .engine
        .save(SaveWorkflow {
            id: payload.id,
            name: payload.name,
            description: payload.description,
            builder_data: payload.builder_data,
            is_active: payload.is_active,
            tenant_id: payload.tenant_id,
            created_by: payload.created_by,
        })
        .await?;

    Ok((status, Json(workflow)))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowDefinition>> {
    Ok(Json(state.engine.get_workflow(id).await?))
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExecutionListQuery>,
) -> ApiResult<Json<Vec<Execution>>> {
    state.engine.get_workflow(id).await?;
    let limit = query.limit.unwrap_or(DEFAULT_EXECUTION_LIMIT).clamp(1, 500);
    Ok(Json(state.engine.list_executions(id, limit).await?))
}

async fn dispatch_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<Event>,
) -> ApiResult<Json<DispatchResponse>> {
    if event.event_type.trim().is_empty() {
        return Err(crate::error::validation_error("event_type", "Event type is required"));
    }

    let execution_ids = state.engine.handle_event(&event).await;
    Ok(Json(DispatchResponse {
        event_type: event.event_type,
        execution_ids,
    }))
}

async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionDetail>> {
    let execution = state.engine.get_execution(id).await?;
    let approvals = state.engine.approvals(id).await?;
    let alerts = state.engine.alerts(id).await?;

    Ok(Json(ExecutionDetail {
        execution,
        approvals,
        alerts,
    }))
}

async fn approve_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DecisionRequest>,
) -> ApiResult<Json<DecisionResponse>> {
    let approval = state
        .engine
        .approve(id, payload.approver, payload.comments)
        .await?;
    decided(&state, id, approval, payload.resume).await
}

async fn reject_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DecisionRequest>,
) -> ApiResult<Json<DecisionResponse>> {
    let approval = state
        .engine
        .reject(id, payload.approver, payload.comments)
        .await?;
    decided(&state, id, approval, payload.resume).await
}

async fn decided(
    state: &AppState,
    id: Uuid,
    approval: Approval,
    resume: bool,
) -> ApiResult<Json<DecisionResponse>> {
    let resumed = if resume {
        Some(state.engine.resume_workflow(id).await)
    } else {
        None
    };

    Ok(Json(DecisionResponse {
        approval,
        resumed,
        execution: state.engine.get_execution(id).await?,
    }))
}

async fn resume_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ResumeResponse>> {
    state.engine.get_execution(id).await?;
    let resumed = state.engine.resume_workflow(id).await;

    Ok(Json(ResumeResponse {
        resumed,
        execution: state.engine.get_execution(id).await?,
    }))
}

async fn assign_record(
    State(state): State<Arc<AppState>>,
    Path((module, record_id)): Path<(String, String)>,
    Query(query): Query<AssignmentQuery>,
) -> ApiResult<Json<AssignmentResponse>> {
    let outcome = state
        .engine
        .evaluate_assignment_rules(&module, &record_id, query.tenant_id)
        .await?;

    let (label, owner_id, rule_id, rule_name) = match outcome {
        AssignmentOutcome::Assigned {
            rule_id,
            rule_name,
            owner_id,
        } => ("assigned", Some(owner_id), Some(rule_id), Some(rule_name)),
        AssignmentOutcome::AlreadyOwned { owner_id } => ("already_owned", Some(owner_id), None, None),
        AssignmentOutcome::Unassigned => ("unassigned", None, None, None),
    };

    Ok(Json(AssignmentResponse {
        module,
        record_id,
        outcome: label,
        owner_id,
        rule_id,
        rule_name,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::email::LogMailer;
    use crate::services::entities::{Entity, InMemoryEntityStore};
    use crate::services::webhook::{WebhookClient, DEFAULT_SIGNATURE_HEADER};
    use crate::workflows::InMemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<InMemoryEntityStore>) {
        let entities = InMemoryEntityStore::new();
        entities.insert(Entity::new("lead", "1", json!({"score": 85}))).await;
        let engine = crate::build_engine(
            Arc::new(InMemoryStore::new()),
            entities.clone(),
            Arc::new(LogMailer),
            WebhookClient::new(Duration::from_secs(5), DEFAULT_SIGNATURE_HEADER),
        );
        (crate::app(AppState::new(engine, None)), entities)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn approval_graph() -> serde_json::Value {
        json!({
            "nodes": [
                {"id": "1", "name": "trigger", "data": {"event_type": "lead.created"}},
                {"id": "2", "name": "approval", "data": {"message": "Sign off"}},
                {"id": "3", "name": "update_field", "data": {"model": "lead", "field_name": "status", "new_value": "approved"}}
            ],
            "edges": [{"from": "1", "to": "2"}, {"from": "2", "to": "3"}]
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["storage"], json!("memory"));
    }

    #[tokio::test]
    async fn test_save_requires_name() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(post_json("/api/v1/workflows", json!({"name": "", "builder_data": approval_graph()})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["code"], json!("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn test_save_rejects_graph_without_trigger() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(post_json(
                "/api/v1/workflows",
                json!({"name": "No trigger", "builder_data": {"nodes": [], "edges": []}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_event_approval_round_trip() {
        let (app, entities) = test_app().await;

        let response = app
            .clone()
            .oneshot(post_json("/api/v1/workflows", json!({"name": "Gate", "builder_data": approval_graph()})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(post_json("/api/v1/events", json!({"event_type": "lead.created", "payload": {"lead_id": "1"}})))
            .await
            .unwrap();
        let dispatched = body_json(response).await;
        let execution_id = dispatched["execution_ids"][0].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/executions/{}", execution_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let detail = body_json(response).await;
        assert_eq!(detail["status"], json!("waiting_for_approval"));
        assert_eq!(detail["approvals"].as_array().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/v1/executions/{}/approve", execution_id),
                json!({"comments": "ok"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let decision = body_json(response).await;
        assert_eq!(decision["resumed"], json!(true));
        assert_eq!(decision["execution"]["status"], json!("completed"));
        assert_eq!(
            entities.get("lead", "1").await.unwrap().get("status"),
            Some(&json!("approved"))
        );

        // already decided
        let response = app
            .oneshot(post_json(
                &format!("/api/v1/executions/{}/reject", execution_id),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_execution_is_404() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(post_json(&format!("/api/v1/executions/{}/resume", Uuid::new_v4()), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_assign_missing_record() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(post_json("/api/v1/assignments/lead/404", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
