// Workflow Engine - Core workflow processing and management

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use compass_shared::{
    AlertSeverity, Approval, ApprovalStatus, Event, Execution, ExecutionAlert, ExecutionStatus,
    StepKind, StepLogEntry, WorkflowDefinition,
};

use super::actions::ActionKind;
use super::approvals::{rejection_message, ApprovalGate};
use super::assignment::{AssignmentError, AssignmentOutcome};
use super::executor::{ActionExecutor, ExecutionContext};
use super::graph::{BranchEvaluator, CompiledWorkflow, GraphError, Instruction, WorkflowGraph};
use super::store::{ExecutionPatch, StoreError, WorkflowStore};
use super::triggers::{ContextResolver, EventRouter};
use crate::services::entities::EntityStore;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Assignment(#[from] AssignmentError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Validation(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Builder input for `save`. `id` set means re-save of an existing workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveWorkflow {
    pub id: Option<Uuid>,
    pub name: String,
    pub description: Option<String>,
    pub builder_data: serde_json::Value,
    pub is_active: Option<bool>,
    pub tenant_id: Option<Uuid>,
    pub created_by: Option<Uuid>,
}

enum RunOutcome {
    Completed,
    Suspended,
    Failed(String),
}

#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    entities: Arc<dyn EntityStore>,
    router: EventRouter,
    resolver: ContextResolver,
    approvals: ApprovalGate,
    executor: ActionExecutor,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, entities: Arc<dyn EntityStore>, executor: ActionExecutor) -> Self {
        Self {
            router: EventRouter::new(store.clone()),
            approvals: ApprovalGate::new(store.clone()),
            resolver: ContextResolver::default(),
            store,
            entities,
            executor,
        }
    }

    pub fn with_resolver(mut self, resolver: ContextResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Compile builder data and persist it as a new version.
    pub async fn save(&self, request: SaveWorkflow) -> EngineResult<WorkflowDefinition> {
        if request.name.trim().is_empty() {
            return Err(EngineError::Validation("Workflow name is required".to_string()));
        }

        let compiled = WorkflowGraph::from_builder_data(&request.builder_data)?.compile()?;
        let now = Utc::now();

        let workflow = match request.id {
            Some(id) => {
                let existing = self
                    .store
                    .get_workflow(id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("Workflow {} not found", id)))?;
                WorkflowDefinition {
                    name: request.name,
                    description: request.description,
                    trigger_event_type: compiled.trigger_event_type.clone(),
                    is_active: request.is_active.unwrap_or(existing.is_active),
                    version: existing.version + 1,
                    builder_data: request.builder_data,
                    updated_at: Some(now),
                    ..existing
                }
            }
            None => WorkflowDefinition {
                id: Uuid::new_v4(),
                name: request.name,
                description: request.description,
                trigger_event_type: compiled.trigger_event_type.clone(),
                is_active: request.is_active.unwrap_or(true),
                tenant_id: request.tenant_id,
                created_by: request.created_by,
                version: 1,
                builder_data: request.builder_data,
                created_at: now,
                updated_at: None,
            },
        };

        self.store.save_workflow(&workflow, &compiled).await?;
        info!(
            "Saved workflow '{}' ({}) v{} on {} with {} actions",
            workflow.name,
            workflow.id,
            workflow.version,
            workflow.trigger_event_type,
            compiled.action_count()
        );
        Ok(workflow)
    }

    pub async fn evaluate_trigger(&self, event: &Event) -> Vec<WorkflowDefinition> {
        self.router
            .evaluate_trigger(&event.event_type, &event.payload, event.tenant_id)
            .await
    }

    /// Run every workflow the event triggers. Returns the created execution ids.
    pub async fn handle_event(&self, event: &Event) -> Vec<Uuid> {
        let workflows = self.evaluate_trigger(event).await;
        if workflows.is_empty() {
            debug!("No workflows triggered by {}", event.event_type);
            return Vec::new();
        }

        let object = self
            .resolver
            .resolve(&event.event_type, &event.payload, self.entities.as_ref())
            .await;
        let context = ExecutionContext::from_event(event).with_object(object);

        let mut executions = Vec::new();
        for workflow in &workflows {
            if let Some((execution_id, _)) = self.start(workflow, &context).await {
                executions.push(execution_id);
            }
        }

        info!(
            "Event {} ran {} of {} matched workflows",
            event.event_type,
            executions.len(),
            workflows.len()
        );
        executions
    }

    /// Start one execution. `false` for unknown or inactive workflows and for
    /// runs that fail; `true` for completed and suspended runs.
    pub async fn execute_workflow(&self, workflow_id: Uuid, context: &ExecutionContext) -> bool {
        let workflow = match self.store.get_workflow(workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                warn!("Workflow {} not found", workflow_id);
                return false;
            }
            Err(e) => {
                error!("Failed to load workflow {}: {}", workflow_id, e);
                return false;
            }
        };

        self.start(&workflow, context)
            .await
            .map(|(_, ok)| ok)
            .unwrap_or(false)
    }

    async fn start(&self, workflow: &WorkflowDefinition, context: &ExecutionContext) -> Option<(Uuid, bool)> {
        if !workflow.is_active {
            warn!("Workflow '{}' is inactive, not executing", workflow.name);
            return None;
        }

        let program = match self.store.load_program(workflow.id, workflow.version).await {
            Ok(Some(program)) => program,
            Ok(None) => {
                error!("Workflow {} v{} has no compiled program", workflow.id, workflow.version);
                return None;
            }
            Err(e) => {
                error!("Failed to load program for workflow {}: {}", workflow.id, e);
                return None;
            }
        };

        let execution = Execution {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            workflow_version: workflow.version,
            tenant_id: context.tenant_id,
            event_type: context.event_type.clone(),
            status: ExecutionStatus::Running,
            trigger_payload: context.payload.clone(),
            current_step_pointer: Some(0),
            step_log: serde_json::json!([]),
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            execution_time_ms: None,
        };

        if let Err(e) = self.store.create_execution(&execution).await {
            error!("Failed to create execution for workflow {}: {}", workflow.id, e);
            return None;
        }

        info!("Executing workflow '{}' as {}", workflow.name, execution.id);
        let context = context.for_execution(execution.id, workflow.id);
        let ok = self.drive(&execution, &program, 0, &context).await;
        Some((execution.id, ok))
    }

    /// Continue a waiting execution after its approval has been decided.
    pub async fn resume_workflow(&self, execution_id: Uuid) -> bool {
        let execution = match self.store.get_execution(execution_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                warn!("Execution {} not found", execution_id);
                return false;
            }
            Err(e) => {
                error!("Failed to load execution {}: {}", execution_id, e);
                return false;
            }
        };

        if execution.status != ExecutionStatus::WaitingForApproval {
            warn!(
                "Execution {} is {}, not waiting for approval",
                execution_id, execution.status
            );
            return false;
        }

        let approval = match self.approvals.claim(execution_id).await {
            Ok(Some(approval)) => approval,
            Ok(None) => return false,
            Err(e) => {
                error!("Failed to claim approval for {}: {}", execution_id, e);
                return false;
            }
        };

        if approval.status == ApprovalStatus::Rejected {
            self.fail(&execution, ExecutionStatus::WaitingForApproval, rejection_message(&approval))
                .await;
            return false;
        }

        match self
            .store
            .transition_execution(
                execution_id,
                ExecutionStatus::WaitingForApproval,
                ExecutionStatus::Running,
                ExecutionPatch::default(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!("Execution {} changed state during resume", execution_id);
                return false;
            }
            Err(e) => {
                error!("Failed to resume execution {}: {}", execution_id, e);
                return false;
            }
        }

        let program = match self
            .store
            .load_program(execution.workflow_id, execution.workflow_version)
            .await
        {
            Ok(Some(program)) => program,
            Ok(None) => {
                self.fail(&execution, ExecutionStatus::Running, "Compiled program missing")
                    .await;
                return false;
            }
            Err(e) => {
                self.fail(&execution, ExecutionStatus::Running, e.to_string()).await;
                return false;
            }
        };

        let object = self
            .resolver
            .resolve(&execution.event_type, &execution.trigger_payload, self.entities.as_ref())
            .await;
        let context = ExecutionContext::new(execution.event_type.clone(), execution.trigger_payload.clone())
            .with_tenant(execution.tenant_id)
            .with_object(object)
            .for_execution(execution.id, execution.workflow_id);

        let pointer = execution.current_step_pointer.unwrap_or(0).max(0) as usize;
        info!("Resuming execution {} at step {}", execution_id, pointer);
        self.drive(&execution, &program, pointer, &context).await
    }

    pub async fn approve(
        &self,
        execution_id: Uuid,
        approver: Option<Uuid>,
        comments: Option<String>,
    ) -> EngineResult<Approval> {
        self.approvals
            .decide(execution_id, ApprovalStatus::Approved, approver, comments)
            .await
    }

    pub async fn reject(
        &self,
        execution_id: Uuid,
        approver: Option<Uuid>,
        comments: Option<String>,
    ) -> EngineResult<Approval> {
        self.approvals
            .decide(execution_id, ApprovalStatus::Rejected, approver, comments)
            .await
    }

    pub async fn evaluate_assignment_rules(
        &self,
        module: &str,
        record_id: &str,
        tenant_id: Option<Uuid>,
    ) -> EngineResult<AssignmentOutcome> {
        Ok(self.executor.assignment().assign(module, record_id, tenant_id).await?)
    }

    pub async fn get_workflow(&self, id: Uuid) -> EngineResult<WorkflowDefinition> {
        self.store
            .get_workflow(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Workflow {} not found", id)))
    }

    pub async fn get_execution(&self, id: Uuid) -> EngineResult<Execution> {
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Execution {} not found", id)))
    }

    pub async fn list_executions(&self, workflow_id: Uuid, limit: i64) -> EngineResult<Vec<Execution>> {
        Ok(self.store.list_executions(workflow_id, limit).await?)
    }

    pub async fn approvals(&self, execution_id: Uuid) -> EngineResult<Vec<Approval>> {
        Ok(self.store.approvals_for(execution_id).await?)
    }

    pub async fn alerts(&self, execution_id: Uuid) -> EngineResult<Vec<ExecutionAlert>> {
        Ok(self.store.alerts_for(execution_id).await?)
    }

    /// Run from `start` and settle the execution's final state.
    async fn drive(
        &self,
        execution: &Execution,
        program: &CompiledWorkflow,
        start: usize,
        context: &ExecutionContext,
    ) -> bool {
        match self.run(execution.id, program, start, context).await {
            Ok(RunOutcome::Completed) => {
                match self
                    .store
                    .transition_execution(
                        execution.id,
                        ExecutionStatus::Running,
                        ExecutionStatus::Completed,
                        ExecutionPatch::finished(execution.started_at),
                    )
                    .await
                {
                    Ok(true) => {
                        info!("Execution {} completed", execution.id);
                        true
                    }
                    Ok(false) => {
                        warn!("Execution {} was no longer running at completion", execution.id);
                        false
                    }
                    Err(e) => {
                        error!("Failed to complete execution {}: {}", execution.id, e);
                        false
                    }
                }
            }
            Ok(RunOutcome::Suspended) => true,
            Ok(RunOutcome::Failed(message)) => {
                self.fail(execution, ExecutionStatus::Running, message).await;
                false
            }
            Err(e) => {
                self.fail(execution, ExecutionStatus::Running, e.to_string()).await;
                false
            }
        }
    }

    async fn run(
        &self,
        execution_id: Uuid,
        program: &CompiledWorkflow,
        start: usize,
        context: &ExecutionContext,
    ) -> EngineResult<RunOutcome> {
        let document = context.document();
        let mut pointer = start;

        while let Some(instruction) = program.program.get(pointer) {
            match instruction {
                Instruction::Action {
                    label,
                    action: ActionKind::Approval(params),
                    ..
                } => {
                    self.approvals.suspend(execution_id, pointer, label, params).await?;
                    self.log_step(execution_id, pointer, label, StepKind::Approval, Some("approval"), true, None)
                        .await?;
                    return Ok(RunOutcome::Suspended);
                }
                Instruction::Action { label, action, .. } => {
                    let outcome = self.executor.execute(action, context).await;
                    self.log_step(
                        execution_id,
                        pointer,
                        label,
                        StepKind::Action,
                        Some(action.action_type()),
                        outcome.success,
                        outcome.message(),
                    )
                    .await?;

                    if !outcome.success {
                        return Ok(RunOutcome::Failed(format!(
                            "Step {} ({}) failed: {}",
                            label,
                            action.action_type(),
                            outcome.error.unwrap_or_default()
                        )));
                    }
                    pointer += 1;
                }
                Instruction::Branch {
                    label,
                    condition,
                    else_target,
                } => {
                    let (next, taken) = BranchEvaluator::next_pointer(pointer, condition, *else_target, &document);
                    debug!("Branch {} took the {} path", label, taken);
                    self.log_step(execution_id, pointer, label, StepKind::Branch, None, taken, None)
                        .await?;
                    pointer = next;
                }
                Instruction::Jump { target } => pointer = *target,
            }
        }

        Ok(RunOutcome::Completed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_step(
        &self,
        execution_id: Uuid,
        pointer: usize,
        label: &str,
        kind: StepKind,
        action_type: Option<&str>,
        success: bool,
        message: Option<String>,
    ) -> EngineResult<()> {
        let entry = StepLogEntry {
            pointer: pointer as i32,
            label: label.to_string(),
            kind,
            action_type: action_type.map(str::to_string),
            success,
            message,
            recorded_at: Utc::now(),
        };
        Ok(self.store.append_step_log(execution_id, &entry).await?)
    }

    async fn fail(&self, execution: &Execution, from: ExecutionStatus, message: impl Into<String>) {
        let message = message.into();
        error!("Execution {} failed: {}", execution.id, message);

        match self
            .store
            .transition_execution(
                execution.id,
                from,
                ExecutionStatus::Failed,
                ExecutionPatch::failed(execution.started_at, message.clone()),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!("Execution {} was no longer {} when failing", execution.id, from);
                return;
            }
            Err(e) => {
                error!("Failed to mark execution {} failed: {}", execution.id, e);
                return;
            }
        }

        let alert = ExecutionAlert {
            id: Uuid::new_v4(),
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            title: format!("Workflow {} execution failed", execution.workflow_id),
            severity: if message.is_empty() {
                AlertSeverity::Medium
            } else {
                AlertSeverity::High
            },
            message,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_alert(&alert).await {
            error!("Failed to record alert for execution {}: {}", execution.id, e);
        }
    }
}
