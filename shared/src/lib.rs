use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A domain event handed to the automation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            tenant_id: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn for_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub trigger_event_type: String,
    pub is_active: bool,
    pub tenant_id: Option<Uuid>,
    pub created_by: Option<Uuid>,
    /// Bumped on every save; executions pin the version they started on
    pub version: i32,
    /// Raw graph as submitted by the builder
    pub builder_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    pub position: i32,
    pub field_path: String,
    pub operator: String,
    pub value: serde_json::Value,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    /// None for top-level steps
    pub branch_id: Option<Uuid>,
    /// true / false path of `branch_id`
    pub branch_path: Option<bool>,
    pub order_index: i32,
    pub label: String,
    pub action_type: String,
    pub parameters: serde_json::Value,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    pub parent_branch_id: Option<Uuid>,
    pub parent_path: Option<bool>,
    pub order_index: i32,
    pub label: String,
    pub condition: serde_json::Value,
}

#[cfg_attr(
    feature = "sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "execution_status", rename_all = "snake_case")
)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    WaitingForApproval,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingForApproval => "waiting_for_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed moves of the execution state machine. Terminal states are final.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Running, WaitingForApproval)
                | (Running, Completed)
                | (Running, Failed)
                | (WaitingForApproval, Running)
                | (WaitingForApproval, Failed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: i32,
    pub tenant_id: Option<Uuid>,
    pub event_type: String,
    pub status: ExecutionStatus,
    pub trigger_payload: serde_json::Value,
    /// Program position to continue from after an approval
    pub current_step_pointer: Option<i32>,
    pub step_log: serde_json::Value,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
}

impl Execution {
    /// Step log entries in execution order. Malformed entries are skipped.
    pub fn logged_steps(&self) -> Vec<StepLogEntry> {
        match &self.step_log {
            serde_json::Value::Array(entries) => entries
                .iter()
                .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Labels of the action steps that ran, in order.
    pub fn executed_labels(&self) -> Vec<String> {
        self.logged_steps()
            .into_iter()
            .filter(|entry| entry.kind == StepKind::Action)
            .map(|entry| entry.label)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Action,
    Branch,
    Approval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub pointer: i32,
    pub label: String,
    pub kind: StepKind,
    #[serde(default)]
    pub action_type: Option<String>,
    /// Action outcome, or the taken path for branches
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[cfg_attr(
    feature = "sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "approval_status", rename_all = "snake_case")
)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// Position of the approval instruction in the compiled program
    pub step_pointer: i32,
    pub step_label: String,
    pub status: ApprovalStatus,
    pub requested_approver: Option<Uuid>,
    pub message: Option<String>,
    pub approver: Option<Uuid>,
    pub comments: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    /// Set once a resume has claimed the decision
    pub resumed_at: Option<DateTime<Utc>>,
}

impl Approval {
    pub fn is_open(&self) -> bool {
        self.resumed_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentRuleType {
    RoundRobin,
    Territory,
    Criteria,
    LoadBalanced,
}

impl AssignmentRuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Territory => "territory",
            Self::Criteria => "criteria",
            Self::LoadBalanced => "load_balanced",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "round_robin" => Some(Self::RoundRobin),
            "territory" => Some(Self::Territory),
            "criteria" => Some(Self::Criteria),
            "load_balanced" => Some(Self::LoadBalanced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleAssignee {
    pub user_id: Uuid,
    /// Country / region codes this user covers
    #[serde(default)]
    pub territories: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl RuleAssignee {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            territories: Vec::new(),
            is_active: true,
        }
    }

    pub fn with_territories(mut self, codes: &[&str]) -> Self {
        self.territories = codes.iter().map(|c| c.to_string()).collect();
        self
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRule {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub name: String,
    /// Entity type the rule applies to (lead, case, ...)
    pub module: String,
    pub rule_type: AssignmentRuleType,
    /// `field` or `field__op` keys, ANDed; empty matches everything
    #[serde(default)]
    pub criteria: serde_json::Map<String, serde_json::Value>,
    pub assignees: Vec<RuleAssignee>,
    pub priority: i32,
    pub is_active: bool,
    pub last_assigned_index: i32,
    #[serde(default)]
    pub territory_field: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AssignmentRule {
    pub fn new(name: impl Into<String>, module: impl Into<String>, rule_type: AssignmentRuleType) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: None,
            name: name.into(),
            module: module.into(),
            rule_type,
            criteria: serde_json::Map::new(),
            assignees: Vec::new(),
            priority: 0,
            is_active: true,
            last_assigned_index: 0,
            territory_field: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_assignees(mut self, assignees: Vec<RuleAssignee>) -> Self {
        self.assignees = assignees;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_criterion(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.criteria.insert(key.into(), value);
        self
    }

    pub fn active_assignees(&self) -> Vec<&RuleAssignee> {
        self.assignees.iter().filter(|a| a.is_active).collect()
    }
}

#[cfg_attr(
    feature = "sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "alert_severity", rename_all = "snake_case")
)]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Medium,
    High,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAlert {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub title: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub created_at: DateTime<Utc>,
}
