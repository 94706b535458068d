// Workflow Store - Persistence seam for definitions, executions, approvals and rules

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use compass_shared::{
    ActionStep, Approval, ApprovalStatus, AssignmentRule, Branch, Execution, ExecutionAlert,
    ExecutionStatus, StepLogEntry, TriggerCondition, WorkflowDefinition,
};

use super::graph::CompiledWorkflow;
use super::{Condition, ConditionOperator, ConditionSet};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Execution {0} already has an open approval")]
    ApprovalAlreadyOpen(Uuid),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Fields written alongside a status transition. `None` leaves the column as is.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub current_step_pointer: Option<i32>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
}

impl ExecutionPatch {
    pub fn pointer(pointer: i32) -> Self {
        Self {
            current_step_pointer: Some(pointer),
            ..Default::default()
        }
    }

    pub fn finished(started_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            completed_at: Some(now),
            execution_time_ms: Some((now - started_at).num_milliseconds().max(0)),
            ..Default::default()
        }
    }

    pub fn failed(started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            error_message: Some(error.into()),
            ..Self::finished(started_at)
        }
    }

    fn apply(&self, execution: &mut Execution) {
        if let Some(pointer) = self.current_step_pointer {
            execution.current_step_pointer = Some(pointer);
        }
        if let Some(error) = &self.error_message {
            execution.error_message = Some(error.clone());
        }
        if let Some(at) = self.completed_at {
            execution.completed_at = Some(at);
        }
        if let Some(ms) = self.execution_time_ms {
            execution.execution_time_ms = Some(ms);
        }
    }
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Upsert the definition, snapshot the compiled program under its version and
    /// replace the trigger/step/branch rows.
    async fn save_workflow(&self, workflow: &WorkflowDefinition, compiled: &CompiledWorkflow) -> StoreResult<()>;

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<WorkflowDefinition>>;

    /// Active workflows for an event type and tenant, with their trigger conditions.
    async fn workflows_for_event(
        &self,
        event_type: &str,
        tenant_id: Option<Uuid>,
    ) -> StoreResult<Vec<(WorkflowDefinition, ConditionSet)>>;

    async fn load_program(&self, workflow_id: Uuid, version: i32) -> StoreResult<Option<CompiledWorkflow>>;

    async fn step_rows(&self, workflow_id: Uuid) -> StoreResult<(Vec<ActionStep>, Vec<Branch>)>;

    async fn create_execution(&self, execution: &Execution) -> StoreResult<()>;

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>>;

    async fn list_executions(&self, workflow_id: Uuid, limit: i64) -> StoreResult<Vec<Execution>>;

    /// Compare-and-swap on status. `Ok(false)` when the execution is no longer in `from`.
    async fn transition_execution(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> StoreResult<bool>;

    async fn append_step_log(&self, id: Uuid, entry: &StepLogEntry) -> StoreResult<()>;

    /// Open `approval` and move its execution `running -> waiting_for_approval`
    /// at `next_pointer` as one unit. `Ok(false)`, with nothing written, when the
    /// execution is no longer running.
    async fn park_for_approval(&self, approval: &Approval, next_pointer: i32) -> StoreResult<bool>;

    async fn open_approval(&self, execution_id: Uuid) -> StoreResult<Option<Approval>>;

    async fn approvals_for(&self, execution_id: Uuid) -> StoreResult<Vec<Approval>>;

    /// Compare-and-swap `pending -> status`.
    async fn decide_approval(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        approver: Option<Uuid>,
        comments: Option<String>,
    ) -> StoreResult<bool>;

    /// Mark a decided approval as consumed by a resume. Only one caller wins.
    async fn claim_approval(&self, approval_id: Uuid) -> StoreResult<bool>;

    async fn record_alert(&self, alert: &ExecutionAlert) -> StoreResult<()>;

    async fn alerts_for(&self, execution_id: Uuid) -> StoreResult<Vec<ExecutionAlert>>;
}

#[async_trait]
pub trait AssignmentRuleStore: Send + Sync {
    async fn save_rule(&self, rule: &AssignmentRule) -> StoreResult<()>;

    async fn get_rule(&self, id: Uuid) -> StoreResult<Option<AssignmentRule>>;

    /// Active rules, priority descending then name.
    async fn rules_for_module(&self, module: &str, tenant_id: Option<Uuid>) -> StoreResult<Vec<AssignmentRule>>;

    /// Compare-and-swap on `last_assigned_index`.
    async fn advance_rotation(&self, rule_id: Uuid, expected: i32, next: i32) -> StoreResult<bool>;
}

pub fn conditions_from_rows(rows: &[TriggerCondition]) -> ConditionSet {
    let mut rows: Vec<&TriggerCondition> = rows.iter().collect();
    rows.sort_by_key(|r| r.position);
    ConditionSet::new(
        rows.into_iter()
            .map(|r| Condition::new(&r.field_path, ConditionOperator::parse(&r.operator), r.value.clone()))
            .collect(),
    )
}

pub(crate) fn sort_rules(rules: &mut [AssignmentRule]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
}

#[derive(Default)]
struct MemoryState {
    workflows: HashMap<Uuid, WorkflowDefinition>,
    programs: HashMap<(Uuid, i32), CompiledWorkflow>,
    conditions: HashMap<Uuid, Vec<TriggerCondition>>,
    steps: HashMap<Uuid, Vec<ActionStep>>,
    branches: HashMap<Uuid, Vec<Branch>>,
    executions: HashMap<Uuid, Execution>,
    approvals: Vec<Approval>,
    alerts: Vec<ExecutionAlert>,
    rules: HashMap<Uuid, AssignmentRule>,
}

/// Store kept in process memory. Every operation takes the single lock, so
/// compare-and-swap semantics match the PostgreSQL store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition, compiled: &CompiledWorkflow) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let (steps, branches) = compiled.step_rows(workflow.id, workflow.version);

        state.workflows.insert(workflow.id, workflow.clone());
        state
            .programs
            .insert((workflow.id, workflow.version), compiled.clone());
        state
            .conditions
            .insert(workflow.id, compiled.trigger_rows(workflow.id, workflow.version));
        state.steps.insert(workflow.id, steps);
        state.branches.insert(workflow.id, branches);
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<WorkflowDefinition>> {
        Ok(self.state.read().await.workflows.get(&id).cloned())
    }

    async fn workflows_for_event(
        &self,
        event_type: &str,
        tenant_id: Option<Uuid>,
    ) -> StoreResult<Vec<(WorkflowDefinition, ConditionSet)>> {
        let state = self.state.read().await;
        Ok(state
            .workflows
            .values()
            .filter(|w| w.is_active && w.trigger_event_type == event_type && w.tenant_id == tenant_id)
            .map(|w| {
                let rows = state.conditions.get(&w.id).map(|r| r.as_slice()).unwrap_or(&[]);
                (w.clone(), conditions_from_rows(rows))
            })
            .collect())
    }

    async fn load_program(&self, workflow_id: Uuid, version: i32) -> StoreResult<Option<CompiledWorkflow>> {
        Ok(self
            .state
            .read()
            .await
            .programs
            .get(&(workflow_id, version))
            .cloned())
    }

    async fn step_rows(&self, workflow_id: Uuid) -> StoreResult<(Vec<ActionStep>, Vec<Branch>)> {
        let state = self.state.read().await;
        Ok((
            state.steps.get(&workflow_id).cloned().unwrap_or_default(),
            state.branches.get(&workflow_id).cloned().unwrap_or_default(),
        ))
    }

    async fn create_execution(&self, execution: &Execution) -> StoreResult<()> {
        self.state
            .write()
            .await
            .executions
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        Ok(self.state.read().await.executions.get(&id).cloned())
    }

    async fn list_executions(&self, workflow_id: Uuid, limit: i64) -> StoreResult<Vec<Execution>> {
        let state = self.state.read().await;
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        executions.truncate(limit.max(0) as usize);
        Ok(executions)
    }

    async fn transition_execution(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.executions.get_mut(&id) {
            Some(execution) if execution.status == from && from.can_transition_to(to) => {
                execution.status = to;
                patch.apply(execution);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_step_log(&self, id: Uuid, entry: &StepLogEntry) -> StoreResult<()> {
        let value = serde_json::to_value(entry)?;
        let mut state = self.state.write().await;
        if let Some(execution) = state.executions.get_mut(&id) {
            match &mut execution.step_log {
                serde_json::Value::Array(entries) => entries.push(value),
                other => *other = serde_json::Value::Array(vec![value]),
            }
        }
        Ok(())
    }

    async fn park_for_approval(&self, approval: &Approval, next_pointer: i32) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let running = state
            .executions
            .get(&approval.execution_id)
            .is_some_and(|e| e.status == ExecutionStatus::Running);
        if !running {
            return Ok(false);
        }
        if state
            .approvals
            .iter()
            .any(|a| a.execution_id == approval.execution_id && a.is_open())
        {
            return Err(StoreError::ApprovalAlreadyOpen(approval.execution_id));
        }

        state.approvals.push(approval.clone());
        if let Some(execution) = state.executions.get_mut(&approval.execution_id) {
            execution.status = ExecutionStatus::WaitingForApproval;
            ExecutionPatch::pointer(next_pointer).apply(execution);
        }
        Ok(true)
    }

    async fn open_approval(&self, execution_id: Uuid) -> StoreResult<Option<Approval>> {
        Ok(self
            .state
            .read()
            .await
            .approvals
            .iter()
            .find(|a| a.execution_id == execution_id && a.is_open())
            .cloned())
    }

    async fn approvals_for(&self, execution_id: Uuid) -> StoreResult<Vec<Approval>> {
        Ok(self
            .state
            .read()
            .await
            .approvals
            .iter()
            .filter(|a| a.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn decide_approval(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        approver: Option<Uuid>,
        comments: Option<String>,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.approvals.iter_mut().find(|a| a.id == approval_id) {
            Some(approval) if approval.status == ApprovalStatus::Pending => {
                approval.status = status;
                approval.approver = approver;
                approval.comments = comments;
                approval.decided_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_approval(&self, approval_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.approvals.iter_mut().find(|a| a.id == approval_id) {
            Some(approval) if approval.status != ApprovalStatus::Pending && approval.resumed_at.is_none() => {
                approval.resumed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_alert(&self, alert: &ExecutionAlert) -> StoreResult<()> {
        self.state.write().await.alerts.push(alert.clone());
        Ok(())
    }

    async fn alerts_for(&self, execution_id: Uuid) -> StoreResult<Vec<ExecutionAlert>> {
        Ok(self
            .state
            .read()
            .await
            .alerts
            .iter()
            .filter(|a| a.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AssignmentRuleStore for InMemoryStore {
    async fn save_rule(&self, rule: &AssignmentRule) -> StoreResult<()> {
        self.state.write().await.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> StoreResult<Option<AssignmentRule>> {
        Ok(self.state.read().await.rules.get(&id).cloned())
    }

    async fn rules_for_module(&self, module: &str, tenant_id: Option<Uuid>) -> StoreResult<Vec<AssignmentRule>> {
        let state = self.state.read().await;
        let mut rules: Vec<AssignmentRule> = state
            .rules
            .values()
            .filter(|r| r.is_active && r.module == module && r.tenant_id == tenant_id)
            .cloned()
            .collect();
        sort_rules(&mut rules);
        Ok(rules)
    }

    async fn advance_rotation(&self, rule_id: Uuid, expected: i32, next: i32) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state.rules.get_mut(&rule_id) {
            Some(rule) if rule.last_assigned_index == expected => {
                rule.last_assigned_index = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn execution(status: ExecutionStatus) -> Execution {
        Execution {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            workflow_version: 1,
            tenant_id: None,
            event_type: "lead.created".to_string(),
            status,
            trigger_payload: json!({}),
            current_step_pointer: None,
            step_log: json!([]),
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            execution_time_ms: None,
        }
    }

    fn approval(execution_id: Uuid) -> Approval {
        Approval {
            id: Uuid::new_v4(),
            execution_id,
            step_pointer: 1,
            step_label: "2".to_string(),
            status: ApprovalStatus::Pending,
            requested_approver: None,
            message: None,
            approver: None,
            comments: None,
            requested_at: Utc::now(),
            decided_at: None,
            resumed_at: None,
        }
    }

    #[tokio::test]
    async fn test_terminal_execution_rejects_transition() {
        let store = InMemoryStore::new();
        let exec = execution(ExecutionStatus::Completed);
        store.create_execution(&exec).await.unwrap();

        let moved = store
            .transition_execution(exec.id, ExecutionStatus::Completed, ExecutionStatus::Running, ExecutionPatch::default())
            .await
            .unwrap();
        assert!(!moved);
        assert_eq!(
            store.get_execution(exec.id).await.unwrap().unwrap().status,
            ExecutionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_stale_transition_loses() {
        let store = InMemoryStore::new();
        let exec = execution(ExecutionStatus::WaitingForApproval);
        store.create_execution(&exec).await.unwrap();

        let first = store
            .transition_execution(exec.id, ExecutionStatus::WaitingForApproval, ExecutionStatus::Running, ExecutionPatch::default())
            .await
            .unwrap();
        let second = store
            .transition_execution(exec.id, ExecutionStatus::WaitingForApproval, ExecutionStatus::Running, ExecutionPatch::default())
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_park_requires_running_execution() {
        let store = InMemoryStore::new();
        let exec = execution(ExecutionStatus::Failed);
        store.create_execution(&exec).await.unwrap();

        assert!(!store.park_for_approval(&approval(exec.id), 2).await.unwrap());
        assert!(store.approvals_for(exec.id).await.unwrap().is_empty());
        assert_eq!(
            store.get_execution(exec.id).await.unwrap().unwrap().status,
            ExecutionStatus::Failed
        );

        let running = execution(ExecutionStatus::Running);
        store.create_execution(&running).await.unwrap();
        assert!(store.park_for_approval(&approval(running.id), 2).await.unwrap());
        let parked = store.get_execution(running.id).await.unwrap().unwrap();
        assert_eq!(parked.status, ExecutionStatus::WaitingForApproval);
        assert_eq!(parked.current_step_pointer, Some(2));
    }

    #[tokio::test]
    async fn test_single_open_approval_and_single_claim() {
        let store = InMemoryStore::new();
        let exec = execution(ExecutionStatus::Running);
        store.create_execution(&exec).await.unwrap();
        let execution_id = exec.id;
        let pending = approval(execution_id);
        assert!(store.park_for_approval(&pending, 2).await.unwrap());

        // a second approval while one is open is refused
        store
            .transition_execution(execution_id, ExecutionStatus::WaitingForApproval, ExecutionStatus::Running, ExecutionPatch::default())
            .await
            .unwrap();
        assert!(matches!(
            store.park_for_approval(&approval(execution_id), 2).await,
            Err(StoreError::ApprovalAlreadyOpen(_))
        ));
        assert_eq!(store.approvals_for(execution_id).await.unwrap().len(), 1);

        // undecided approvals cannot be claimed
        assert!(!store.claim_approval(pending.id).await.unwrap());

        assert!(store
            .decide_approval(pending.id, ApprovalStatus::Approved, None, None)
            .await
            .unwrap());
        assert!(!store
            .decide_approval(pending.id, ApprovalStatus::Rejected, None, None)
            .await
            .unwrap());

        assert!(store.claim_approval(pending.id).await.unwrap());
        assert!(!store.claim_approval(pending.id).await.unwrap());
        assert!(store.open_approval(execution_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotation_compare_and_swap() {
        let store = InMemoryStore::new();
        let rule = AssignmentRule::new("Inbound", "lead", compass_shared::AssignmentRuleType::RoundRobin);
        store.save_rule(&rule).await.unwrap();

        assert!(store.advance_rotation(rule.id, 0, 1).await.unwrap());
        assert!(!store.advance_rotation(rule.id, 0, 1).await.unwrap());
        assert_eq!(store.get_rule(rule.id).await.unwrap().unwrap().last_assigned_index, 1);
    }

    #[test]
    fn test_conditions_from_rows_keeps_position_order() {
        let workflow_id = Uuid::new_v4();
        let row = |position: i32, field: &str| TriggerCondition {
            id: Uuid::new_v4(),
            workflow_id,
            version: 1,
            position,
            field_path: field.to_string(),
            operator: "gt".to_string(),
            value: json!(1),
        };
        let set = conditions_from_rows(&[row(1, "b"), row(0, "a")]);
        assert_eq!(set.conditions[0].field_path, "a");
        assert_eq!(set.conditions[1].operator, ConditionOperator::Gt);
    }
}
