// Approval Gate - Suspend and resume around human approval steps

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use compass_shared::{Approval, ApprovalStatus};

use super::actions::ApprovalParams;
use super::engine::{EngineError, EngineResult};
use super::store::WorkflowStore;

#[derive(Clone)]
pub struct ApprovalGate {
    store: Arc<dyn WorkflowStore>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// Open a pending approval for the instruction at `pointer` and park the
    /// execution with its pointer on the next instruction.
    pub async fn suspend(
        &self,
        execution_id: Uuid,
        pointer: usize,
        label: &str,
        params: &ApprovalParams,
    ) -> EngineResult<Approval> {
        let approval = Approval {
            id: Uuid::new_v4(),
            execution_id,
            step_pointer: pointer as i32,
            step_label: label.to_string(),
            status: ApprovalStatus::Pending,
            requested_approver: params.approver,
            message: params.message.clone(),
            approver: None,
            comments: None,
            requested_at: Utc::now(),
            decided_at: None,
            resumed_at: None,
        };
        if !self.store.park_for_approval(&approval, pointer as i32 + 1).await? {
            return Err(EngineError::Conflict(format!(
                "Execution {} left running state before it could wait for approval",
                execution_id
            )));
        }

        info!("Execution {} waiting for approval at step {}", execution_id, label);
        Ok(approval)
    }

    /// Record a decision on the execution's open approval.
    pub async fn decide(
        &self,
        execution_id: Uuid,
        status: ApprovalStatus,
        approver: Option<Uuid>,
        comments: Option<String>,
    ) -> EngineResult<Approval> {
        let approval = self
            .store
            .open_approval(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("No open approval for execution {}", execution_id)))?;

        if approval.status != ApprovalStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "Approval {} is already {}",
                approval.id,
                approval.status.as_str()
            )));
        }

        if !self
            .store
            .decide_approval(approval.id, status, approver, comments.clone())
            .await?
        {
            return Err(EngineError::Conflict(format!(
                "Approval {} was decided concurrently",
                approval.id
            )));
        }

        info!("Approval {} for execution {} {}", approval.id, execution_id, status.as_str());
        Ok(Approval {
            status,
            approver,
            comments,
            decided_at: Some(Utc::now()),
            ..approval
        })
    }

    /// Take ownership of a decided approval for one resume. `None` when there is
    /// nothing to resume or another caller got there first.
    pub async fn claim(&self, execution_id: Uuid) -> EngineResult<Option<Approval>> {
        let Some(approval) = self.store.open_approval(execution_id).await? else {
            warn!("Execution {} has no open approval to resume", execution_id);
            return Ok(None);
        };

        if approval.status == ApprovalStatus::Pending {
            warn!("Approval {} is still pending", approval.id);
            return Ok(None);
        }

        if !self.store.claim_approval(approval.id).await? {
            warn!("Approval {} already claimed by another resume", approval.id);
            return Ok(None);
        }

        Ok(Some(approval))
    }
}

/// Error message recorded when an approval is rejected.
pub fn rejection_message(approval: &Approval) -> String {
    let approver = approval
        .approver
        .map(|id| id.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "Rejected by {}: {}",
        approver,
        approval.comments.as_deref().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::store::InMemoryStore;
    use compass_shared::{Execution, ExecutionStatus};
    use serde_json::json;

    async fn gate_with(status: ExecutionStatus) -> (ApprovalGate, Arc<InMemoryStore>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let execution = Execution {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            workflow_version: 1,
            tenant_id: None,
            event_type: "lead.created".to_string(),
            status,
            trigger_payload: json!({}),
            current_step_pointer: Some(1),
            step_log: json!([]),
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            execution_time_ms: None,
        };
        store.create_execution(&execution).await.unwrap();
        (ApprovalGate::new(store.clone()), store, execution.id)
    }

    #[tokio::test]
    async fn test_suspend_parks_running_execution() {
        let (gate, store, id) = gate_with(ExecutionStatus::Running).await;
        let approval = gate.suspend(id, 1, "sign-off", &ApprovalParams::default()).await.unwrap();

        let execution = store.get_execution(id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::WaitingForApproval);
        assert_eq!(execution.current_step_pointer, Some(2));
        assert_eq!(store.open_approval(id).await.unwrap().map(|a| a.id), Some(approval.id));
    }

    #[tokio::test]
    async fn test_suspend_lost_race_leaves_no_approval() {
        let (gate, store, id) = gate_with(ExecutionStatus::Failed).await;
        let result = gate.suspend(id, 1, "sign-off", &ApprovalParams::default()).await;

        assert!(matches!(result, Err(EngineError::Conflict(_))));
        assert!(store.approvals_for(id).await.unwrap().is_empty());
        assert!(matches!(gate.decide(id, ApprovalStatus::Approved, None, None).await, Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_rejection_message_without_approver() {
        let approval = Approval {
            id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            step_pointer: 1,
            step_label: "sign-off".to_string(),
            status: ApprovalStatus::Rejected,
            requested_approver: None,
            message: None,
            approver: None,
            comments: Some("Too expensive".to_string()),
            requested_at: Utc::now(),
            decided_at: Some(Utc::now()),
            resumed_at: None,
        };
        assert_eq!(rejection_message(&approval), "Rejected by unknown: Too expensive");
    }
}
