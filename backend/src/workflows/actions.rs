// Workflow Actions - Typed action steps a workflow can run

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Every action kind with its parameters. Serialized adjacently tagged, which is
/// the `{action_type, parameters}` shape stored on action step rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action_type", content = "parameters", rename_all = "snake_case")]
pub enum ActionKind {
    SendEmail(SendEmailParams),
    CreateTask(CreateTaskParams),
    CreateCase(CreateCaseParams),
    UpdateField(UpdateFieldParams),
    Webhook(WebhookParams),
    AssignOwner(AssignOwnerParams),
    Approval(ApprovalParams),
}

impl ActionKind {
    pub fn action_type(&self) -> &'static str {
        match self {
            Self::SendEmail(_) => "send_email",
            Self::CreateTask(_) => "create_task",
            Self::CreateCase(_) => "create_case",
            Self::UpdateField(_) => "update_field",
            Self::Webhook(_) => "webhook",
            Self::AssignOwner(_) => "assign_owner",
            Self::Approval(_) => "approval",
        }
    }

    pub fn is_approval(&self) -> bool {
        matches!(self, Self::Approval(_))
    }

    /// Build from the loose `(action_type, parameters)` pair a builder node carries.
    pub fn from_parts(action_type: &str, parameters: serde_json::Value) -> Result<Self, serde_json::Error> {
        let parameters = if parameters.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            parameters
        };
        serde_json::from_value(serde_json::json!({
            "action_type": action_type,
            "parameters": parameters,
        }))
    }

    /// Parameters as raw JSON, without the type tag.
    pub fn parameters(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("parameters").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null)
    }

    pub fn send_email(to: &str, subject: &str, body: &str) -> Self {
        Self::SendEmail(SendEmailParams {
            to: Recipients::One(to.to_string()),
            subject: subject.to_string(),
            body: body.to_string(),
            from_email: None,
        })
    }

    pub fn create_task(title: &str) -> Self {
        Self::CreateTask(CreateTaskParams {
            title: title.to_string(),
            description: None,
            due_date: None,
            assignee: None,
            priority: None,
            require_related_object: false,
            fallback_related: None,
        })
    }

    pub fn update_field(model: &str, field_name: &str, new_value: serde_json::Value) -> Self {
        Self::UpdateField(UpdateFieldParams {
            model: model.to_string(),
            instance_id: None,
            field_name: field_name.to_string(),
            new_value,
        })
    }

    pub fn webhook(url: &str) -> Self {
        Self::Webhook(WebhookParams {
            url: url.to_string(),
            headers: HashMap::new(),
            secret: None,
            signature_algorithm: SignatureAlgorithm::default(),
            signature_header: None,
            timeout_secs: None,
        })
    }

    pub fn approval() -> Self {
        Self::Approval(ApprovalParams::default())
    }
}

/// One address or a list of addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Recipients {
    pub fn addresses(&self) -> Vec<String> {
        match self {
            Self::One(address) => address
                .split(',')
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect(),
            Self::Many(list) => list.iter().map(|a| a.trim().to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendEmailParams {
    pub to: Recipients,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub from_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateTaskParams {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_date: Option<DueDateRule>,
    #[serde(default)]
    pub assignee: Option<AssigneeRule>,
    #[serde(default)]
    pub priority: Option<String>,
    /// Fail the step when no related object can be found
    #[serde(default)]
    pub require_related_object: bool,
    #[serde(default)]
    pub fallback_related: Option<RelatedRef>,
}

fn default_case_priority() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateCaseParams {
    pub subject: String,
    #[serde(default)]
    pub description: String,
    /// Falls back to the context account, then `account_id` in the payload
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default = "default_case_priority")]
    pub priority: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelatedRef {
    pub entity_type: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DueUnit {
    Minutes,
    Hours,
    #[default]
    Days,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DueDateRule {
    Relative {
        value: i64,
        #[serde(default)]
        unit: DueUnit,
    },
    Absolute {
        at: DateTime<Utc>,
    },
}

impl DueDateRule {
    /// `None` when the offset does not fit in a timestamp.
    pub fn resolve(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Relative { value, unit } => {
                let offset = match unit {
                    DueUnit::Minutes => TimeDelta::try_minutes(*value),
                    DueUnit::Hours => TimeDelta::try_hours(*value),
                    DueUnit::Days => TimeDelta::try_days(*value),
                }?;
                now.checked_add_signed(offset)
            }
            Self::Absolute { at } => Some(*at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssigneeRule {
    /// Owner of the context object, else the fallback
    Owner {
        #[serde(default)]
        fallback_user_id: Option<Uuid>,
    },
    User {
        value: Uuid,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateFieldParams {
    /// Entity type, e.g. `lead`
    pub model: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    pub field_name: String,
    pub new_value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    #[default]
    Sha256,
    Sha1,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookParams {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// HMAC key; the body is signed when present
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub signature_algorithm: SignatureAlgorithm,
    #[serde(default)]
    pub signature_header: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignOwnerParams {
    pub module: String,
    #[serde(default)]
    pub record_id: Option<String>,
    /// Skip the rule engine and assign directly
    #[serde(default)]
    pub owner_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ApprovalParams {
    #[serde(default)]
    pub approver: Option<Uuid>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Result of executing an action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl ActionOutcome {
    pub fn success(output: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn message(&self) -> Option<String> {
        self.error
            .clone()
            .or_else(|| self.output.as_ref().map(|o| o.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_parts_round_trips_tagged_shape() {
        let action = ActionKind::from_parts(
            "send_email",
            json!({"to": "ops@example.com", "subject": "Hi {{ object.name }}"}),
        )
        .unwrap();
        assert_eq!(action.action_type(), "send_email");
        assert_eq!(action.parameters()["subject"], json!("Hi {{ object.name }}"));
    }

    #[test]
    fn test_unknown_action_type_rejected() {
        assert!(ActionKind::from_parts("launch_rocket", json!({})).is_err());
    }

    #[test]
    fn test_missing_required_parameter_rejected() {
        assert!(ActionKind::from_parts("update_field", json!({"model": "lead"})).is_err());
    }

    #[test]
    fn test_create_case_defaults() {
        let action = ActionKind::from_parts("create_case", json!({"subject": "Outage"})).unwrap();
        let ActionKind::CreateCase(params) = action else {
            panic!("expected create_case");
        };
        assert_eq!(params.priority, "medium");
        assert_eq!(params.description, "");
        assert!(params.account_id.is_none());
        assert!(ActionKind::from_parts("create_case", json!({})).is_err());
    }

    #[test]
    fn test_approval_without_parameters() {
        let action = ActionKind::from_parts("approval", serde_json::Value::Null).unwrap();
        assert!(action.is_approval());
    }

    #[test]
    fn test_relative_due_date() {
        let now = Utc::now();
        let rule: DueDateRule = serde_json::from_value(json!({"type": "relative", "value": 2})).unwrap();
        assert_eq!(rule.resolve(now), Some(now + TimeDelta::days(2)));

        let rule: DueDateRule =
            serde_json::from_value(json!({"type": "relative", "value": 90, "unit": "minutes"})).unwrap();
        assert_eq!(rule.resolve(now), Some(now + TimeDelta::minutes(90)));
    }

    #[test]
    fn test_relative_due_date_overflow_is_none() {
        let now = Utc::now();
        let rule: DueDateRule =
            serde_json::from_value(json!({"type": "relative", "value": 1_000_000_000})).unwrap();
        assert_eq!(rule.resolve(now), None);

        let rule: DueDateRule =
            serde_json::from_value(json!({"type": "relative", "value": i64::MAX, "unit": "minutes"})).unwrap();
        assert_eq!(rule.resolve(now), None);
    }

    #[test]
    fn test_recipient_lists() {
        let one = Recipients::One("a@example.com, b@example.com".into());
        assert_eq!(one.addresses(), vec!["a@example.com", "b@example.com"]);
        let many: Recipients = serde_json::from_value(json!(["c@example.com"])).unwrap();
        assert_eq!(many.addresses(), vec!["c@example.com"]);
    }
}
