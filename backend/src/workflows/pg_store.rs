// PostgreSQL Workflow Store

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use compass_shared::{
    ActionStep, Approval, ApprovalStatus, AssignmentRule, AssignmentRuleType, Branch, Execution,
    ExecutionAlert, ExecutionStatus, RuleAssignee, StepLogEntry, TriggerCondition, WorkflowDefinition,
};

use super::graph::CompiledWorkflow;
use super::store::{
    conditions_from_rows, AssignmentRuleStore, ExecutionPatch, StoreError, StoreResult, WorkflowStore,
};
use super::ConditionSet;

#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_version, tenant_id, event_type, status, trigger_payload, \
     current_step_pointer, step_log, error_message, started_at, completed_at, execution_time_ms";

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition, compiled: &CompiledWorkflow) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"INSERT INTO workflows (id, name, description, trigger_event_type, is_active, tenant_id,
                   created_by, version, builder_data, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (id) DO UPDATE SET
                   name = EXCLUDED.name,
                   description = EXCLUDED.description,
                   trigger_event_type = EXCLUDED.trigger_event_type,
                   is_active = EXCLUDED.is_active,
                   version = EXCLUDED.version,
                   builder_data = EXCLUDED.builder_data,
                   updated_at = EXCLUDED.updated_at"#,
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.trigger_event_type)
        .bind(workflow.is_active)
        .bind(workflow.tenant_id)
        .bind(workflow.created_by)
        .bind(workflow.version)
        .bind(&workflow.builder_data)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO workflow_versions (workflow_id, version, program) VALUES ($1, $2, $3)")
            .bind(workflow.id)
            .bind(workflow.version)
            .bind(serde_json::to_value(compiled)?)
            .execute(&mut *tx)
            .await?;

        // Destructive re-sync of the relational view
        for table in ["workflow_trigger_conditions", "workflow_action_steps", "workflow_branches"] {
            sqlx::query(&format!("DELETE FROM {} WHERE workflow_id = $1", table))
                .bind(workflow.id)
                .execute(&mut *tx)
                .await?;
        }

        for condition in compiled.trigger_rows(workflow.id, workflow.version) {
            sqlx::query(
                "INSERT INTO workflow_trigger_conditions (id, workflow_id, version, position, field_path, operator, value)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(condition.id)
            .bind(condition.workflow_id)
            .bind(condition.version)
            .bind(condition.position)
            .bind(&condition.field_path)
            .bind(&condition.operator)
            .bind(&condition.value)
            .execute(&mut *tx)
            .await?;
        }

        let (steps, branches) = compiled.step_rows(workflow.id, workflow.version);
        for branch in &branches {
            sqlx::query(
                "INSERT INTO workflow_branches (id, workflow_id, version, parent_branch_id, parent_path, order_index, label, condition)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(branch.id)
            .bind(branch.workflow_id)
            .bind(branch.version)
            .bind(branch.parent_branch_id)
            .bind(branch.parent_path)
            .bind(branch.order_index)
            .bind(&branch.label)
            .bind(&branch.condition)
            .execute(&mut *tx)
            .await?;
        }
        for step in &steps {
            sqlx::query(
                "INSERT INTO workflow_action_steps (id, workflow_id, version, branch_id, branch_path, order_index, label, action_type, parameters)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(step.id)
            .bind(step.workflow_id)
            .bind(step.version)
            .bind(step.branch_id)
            .bind(step.branch_path)
            .bind(step.order_index)
            .bind(&step.label)
            .bind(&step.action_type)
            .bind(&step.parameters)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(
            "Saved workflow {} v{} ({} steps, {} branches)",
            workflow.id,
            workflow.version,
            steps.len(),
            branches.len()
        );
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> StoreResult<Option<WorkflowDefinition>> {
        let workflow = sqlx::query_as::<_, WorkflowDefinition>("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(workflow)
    }

    async fn workflows_for_event(
        &self,
        event_type: &str,
        tenant_id: Option<Uuid>,
    ) -> StoreResult<Vec<(WorkflowDefinition, ConditionSet)>> {
        let workflows = sqlx::query_as::<_, WorkflowDefinition>(
            "SELECT * FROM workflows
             WHERE is_active AND trigger_event_type = $1 AND tenant_id IS NOT DISTINCT FROM $2",
        )
        .bind(event_type)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        if workflows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = workflows.iter().map(|w| w.id).collect();
        let rows = sqlx::query_as::<_, TriggerCondition>(
            "SELECT * FROM workflow_trigger_conditions WHERE workflow_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        debug!("{} candidate workflows for {}", workflows.len(), event_type);
        Ok(workflows
            .into_iter()
            .map(|w| {
                let own: Vec<TriggerCondition> =
                    rows.iter().filter(|r| r.workflow_id == w.id).cloned().collect();
                (w, conditions_from_rows(&own))
            })
            .collect())
    }

    async fn load_program(&self, workflow_id: Uuid, version: i32) -> StoreResult<Option<CompiledWorkflow>> {
        let program: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT program FROM workflow_versions WHERE workflow_id = $1 AND version = $2",
        )
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(program.map(serde_json::from_value::<CompiledWorkflow>).transpose()?)
    }

    async fn step_rows(&self, workflow_id: Uuid) -> StoreResult<(Vec<ActionStep>, Vec<Branch>)> {
        let steps = sqlx::query_as::<_, ActionStep>(
            "SELECT * FROM workflow_action_steps WHERE workflow_id = $1 ORDER BY branch_id NULLS FIRST, branch_path DESC, order_index",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        let branches = sqlx::query_as::<_, Branch>(
            "SELECT * FROM workflow_branches WHERE workflow_id = $1 ORDER BY order_index",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok((steps, branches))
    }

    async fn create_execution(&self, execution: &Execution) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO workflow_executions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            EXECUTION_COLUMNS
        ))
        .bind(execution.id)
        .bind(execution.workflow_id)
        .bind(execution.workflow_version)
        .bind(execution.tenant_id)
        .bind(&execution.event_type)
        .bind(execution.status)
        .bind(&execution.trigger_payload)
        .bind(execution.current_step_pointer)
        .bind(&execution.step_log)
        .bind(&execution.error_message)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.execution_time_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        let execution = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {} FROM workflow_executions WHERE id = $1",
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(execution)
    }

    async fn list_executions(&self, workflow_id: Uuid, limit: i64) -> StoreResult<Vec<Execution>> {
        let executions = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {} FROM workflow_executions WHERE workflow_id = $1 ORDER BY started_at DESC LIMIT $2",
            EXECUTION_COLUMNS
        ))
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(executions)
    }

    async fn transition_execution(
        &self,
        id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
        patch: ExecutionPatch,
    ) -> StoreResult<bool> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"UPDATE workflow_executions SET
                   status = $3,
                   current_step_pointer = COALESCE($4, current_step_pointer),
                   error_message = COALESCE($5, error_message),
                   completed_at = COALESCE($6, completed_at),
                   execution_time_ms = COALESCE($7, execution_time_ms)
               WHERE id = $1 AND status = $2"#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(patch.current_step_pointer)
        .bind(patch.error_message)
        .bind(patch.completed_at)
        .bind(patch.execution_time_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_step_log(&self, id: Uuid, entry: &StepLogEntry) -> StoreResult<()> {
        sqlx::query("UPDATE workflow_executions SET step_log = step_log || jsonb_build_array($2::jsonb) WHERE id = $1")
            .bind(id)
            .bind(serde_json::to_value(entry)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn park_for_approval(&self, approval: &Approval, next_pointer: i32) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let parked = sqlx::query(
            r#"UPDATE workflow_executions SET status = $3, current_step_pointer = $4
               WHERE id = $1 AND status = $2"#,
        )
        .bind(approval.execution_id)
        .bind(ExecutionStatus::Running)
        .bind(ExecutionStatus::WaitingForApproval)
        .bind(next_pointer)
        .execute(&mut *tx)
        .await?;
        if parked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let inserted = sqlx::query(
            r#"INSERT INTO workflow_approvals (id, execution_id, step_pointer, step_label, status,
                   requested_approver, message, approver, comments, requested_at, decided_at, resumed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(approval.id)
        .bind(approval.execution_id)
        .bind(approval.step_pointer)
        .bind(&approval.step_label)
        .bind(approval.status)
        .bind(approval.requested_approver)
        .bind(&approval.message)
        .bind(approval.approver)
        .bind(&approval.comments)
        .bind(approval.requested_at)
        .bind(approval.decided_at)
        .bind(approval.resumed_at)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::ApprovalAlreadyOpen(approval.execution_id));
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn open_approval(&self, execution_id: Uuid) -> StoreResult<Option<Approval>> {
        let approval = sqlx::query_as::<_, Approval>(
            "SELECT * FROM workflow_approvals WHERE execution_id = $1 AND resumed_at IS NULL",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(approval)
    }

    async fn approvals_for(&self, execution_id: Uuid) -> StoreResult<Vec<Approval>> {
        let approvals = sqlx::query_as::<_, Approval>(
            "SELECT * FROM workflow_approvals WHERE execution_id = $1 ORDER BY requested_at",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(approvals)
    }

    async fn decide_approval(
        &self,
        approval_id: Uuid,
        status: ApprovalStatus,
        approver: Option<Uuid>,
        comments: Option<String>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_approvals SET status = $2, approver = $3, comments = $4, decided_at = $5
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(approval_id)
        .bind(status)
        .bind(approver)
        .bind(comments)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_approval(&self, approval_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_approvals SET resumed_at = $2
             WHERE id = $1 AND status <> 'pending' AND resumed_at IS NULL",
        )
        .bind(approval_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_alert(&self, alert: &ExecutionAlert) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO workflow_execution_alerts (id, execution_id, workflow_id, title, message, severity, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(alert.id)
        .bind(alert.execution_id)
        .bind(alert.workflow_id)
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(alert.severity)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn alerts_for(&self, execution_id: Uuid) -> StoreResult<Vec<ExecutionAlert>> {
        let alerts = sqlx::query_as::<_, ExecutionAlert>(
            "SELECT * FROM workflow_execution_alerts WHERE execution_id = $1 ORDER BY created_at",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(alerts)
    }
}

fn rule_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<AssignmentRule> {
    let rule_type: String = row.try_get("rule_type")?;
    let criteria: serde_json::Value = row.try_get("criteria")?;
    let assignees: serde_json::Value = row.try_get("assignees")?;

    Ok(AssignmentRule {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        module: row.try_get("module")?,
        rule_type: AssignmentRuleType::parse(&rule_type).unwrap_or(AssignmentRuleType::Criteria),
        criteria: match criteria {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        },
        assignees: serde_json::from_value::<Vec<RuleAssignee>>(assignees)?,
        priority: row.try_get("priority")?,
        is_active: row.try_get("is_active")?,
        last_assigned_index: row.try_get("last_assigned_index")?,
        territory_field: row.try_get("territory_field")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl AssignmentRuleStore for PgWorkflowStore {
    async fn save_rule(&self, rule: &AssignmentRule) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO assignment_rules (id, tenant_id, name, module, rule_type, criteria, assignees,
                   priority, is_active, last_assigned_index, territory_field, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               ON CONFLICT (id) DO UPDATE SET
                   name = EXCLUDED.name,
                   rule_type = EXCLUDED.rule_type,
                   criteria = EXCLUDED.criteria,
                   assignees = EXCLUDED.assignees,
                   priority = EXCLUDED.priority,
                   is_active = EXCLUDED.is_active,
                   territory_field = EXCLUDED.territory_field"#,
        )
        .bind(rule.id)
        .bind(rule.tenant_id)
        .bind(&rule.name)
        .bind(&rule.module)
        .bind(rule.rule_type.as_str())
        .bind(serde_json::Value::Object(rule.criteria.clone()))
        .bind(serde_json::to_value(&rule.assignees)?)
        .bind(rule.priority)
        .bind(rule.is_active)
        .bind(rule.last_assigned_index)
        .bind(&rule.territory_field)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> StoreResult<Option<AssignmentRule>> {
        let row = sqlx::query("SELECT * FROM assignment_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn rules_for_module(&self, module: &str, tenant_id: Option<Uuid>) -> StoreResult<Vec<AssignmentRule>> {
        let rows = sqlx::query(
            "SELECT * FROM assignment_rules
             WHERE is_active AND module = $1 AND tenant_id IS NOT DISTINCT FROM $2
             ORDER BY priority DESC, name",
        )
        .bind(module)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn advance_rotation(&self, rule_id: Uuid, expected: i32, next: i32) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE assignment_rules SET last_assigned_index = $3 WHERE id = $1 AND last_assigned_index = $2",
        )
        .bind(rule_id)
        .bind(expected)
        .bind(next)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
