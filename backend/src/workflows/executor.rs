// Workflow Executor - Executes workflow actions

use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use compass_shared::Event;

use super::actions::{
    ActionKind, ActionOutcome, AssignOwnerParams, AssigneeRule, CreateCaseParams, CreateTaskParams, SendEmailParams,
    UpdateFieldParams, WebhookParams,
};
use super::assignment::{AssignmentError, AssignmentOutcome, AssignmentRuleEngine};
use super::conditions::{as_text, resolve_path};
use crate::services::email::{MailError, Mailer, OutgoingEmail};
use crate::services::entities::{Entity, EntityError, EntityStore, NewCase, NewTask};
use crate::services::webhook::{WebhookClient, WebhookError, WebhookRequest};

/// Everything an action can read while it runs.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
    pub event_type: String,
    pub tenant_id: Option<Uuid>,
    pub payload: serde_json::Value,
    /// Primary record the event is about, when one could be loaded
    pub object: Option<Entity>,
}

impl ExecutionContext {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            execution_id: None,
            workflow_id: None,
            event_type: event_type.into(),
            tenant_id: None,
            payload,
            object: None,
        }
    }

    pub fn from_event(event: &Event) -> Self {
        Self {
            tenant_id: event.tenant_id,
            ..Self::new(event.event_type.clone(), event.payload.clone())
        }
    }

    pub fn with_object(mut self, object: Option<Entity>) -> Self {
        self.object = object;
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<Uuid>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn for_execution(&self, execution_id: Uuid, workflow_id: Uuid) -> Self {
        Self {
            execution_id: Some(execution_id),
            workflow_id: Some(workflow_id),
            ..self.clone()
        }
    }

    /// Payload with the context object under `object`; what branch conditions see.
    pub fn document(&self) -> serde_json::Value {
        let mut document = match &self.payload {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        if let Some(object) = &self.object {
            document.insert("object".to_string(), object.to_json());
        }
        serde_json::Value::Object(document)
    }

    fn lookup(&self, path: &str) -> Option<serde_json::Value> {
        if let Some(rest) = path.strip_prefix("object.") {
            let object = self.object.as_ref()?.to_json();
            return resolve_path(&object, rest).cloned();
        }
        if let Some(rest) = path.strip_prefix("payload.") {
            return resolve_path(&self.payload, rest).cloned();
        }
        resolve_path(&self.payload, path).cloned()
    }

    /// Replace `{{ path }}` placeholders. Unresolved placeholders render empty.
    pub fn render(&self, template: &str) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }

        let re = match Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}") {
            Ok(re) => re,
            Err(e) => {
                error!("Template pattern failed to compile: {}", e);
                return template.to_string();
            }
        };

        re.replace_all(template, |caps: &regex::Captures| {
            self.lookup(&caps[1]).map(|v| as_text(&v)).unwrap_or_default()
        })
        .into_owned()
    }

    /// Render every string inside a JSON value.
    pub fn render_value(&self, value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => serde_json::Value::String(self.render(s)),
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.render_value(v)).collect())
            }
            other => other.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Entity error: {0}")]
    Entity(#[from] EntityError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("Assignment error: {0}")]
    Assignment(#[from] AssignmentError),

    #[error("Template error: {0}")]
    Template(#[from] serde_json::Error),
}

/// "leads.Lead" and "Lead" both name the `lead` entity type.
pub fn normalize_model(model: &str) -> String {
    model
        .rsplit('.')
        .next()
        .unwrap_or(model)
        .trim()
        .to_lowercase()
}

#[derive(Clone)]
pub struct ActionExecutor {
    entities: Arc<dyn EntityStore>,
    mailer: Arc<dyn Mailer>,
    webhooks: WebhookClient,
    assignment: AssignmentRuleEngine,
}

impl ActionExecutor {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        mailer: Arc<dyn Mailer>,
        webhooks: WebhookClient,
        assignment: AssignmentRuleEngine,
    ) -> Self {
        Self {
            entities,
            mailer,
            webhooks,
            assignment,
        }
    }

    pub fn assignment(&self) -> &AssignmentRuleEngine {
        &self.assignment
    }

    /// Execute a single action. Never errors: infrastructure failures become
    /// a failed outcome.
    pub async fn execute(&self, action: &ActionKind, context: &ExecutionContext) -> ActionOutcome {
        let start = Instant::now();
        info!("Executing action: {}", action.action_type());

        let result = match self.process_templates(action, context) {
            Ok(action) => self.dispatch(&action, context).await,
            Err(e) => Err(e),
        };

        let duration = start.elapsed().as_millis() as i64;
        match result {
            Ok(outcome) => {
                if let Some(error) = &outcome.error {
                    warn!("Action {} failed: {}", action.action_type(), error);
                }
                outcome.with_duration(duration)
            }
            Err(e) => {
                error!("Action {} failed: {}", action.action_type(), e);
                ActionOutcome::failure(e.to_string()).with_duration(duration)
            }
        }
    }

    fn process_templates(&self, action: &ActionKind, context: &ExecutionContext) -> Result<ActionKind, ActionError> {
        let raw = serde_json::to_value(action)?;
        Ok(serde_json::from_value(context.render_value(&raw))?)
    }

    async fn dispatch(&self, action: &ActionKind, context: &ExecutionContext) -> Result<ActionOutcome, ActionError> {
        match action {
            ActionKind::SendEmail(params) => self.execute_send_email(params).await,
            ActionKind::CreateTask(params) => self.execute_create_task(params, context).await,
            ActionKind::CreateCase(params) => self.execute_create_case(params, context).await,
            ActionKind::UpdateField(params) => self.execute_update_field(params, context).await,
            ActionKind::Webhook(params) => self.execute_webhook(params, context).await,
            ActionKind::AssignOwner(params) => self.execute_assign_owner(params, context).await,
            // Approvals suspend the run before reaching the executor
            ActionKind::Approval(_) => Ok(ActionOutcome::success(Some(serde_json::json!({
                "approval_required": true
            })))),
        }
    }

    async fn execute_send_email(&self, params: &SendEmailParams) -> Result<ActionOutcome, ActionError> {
        let recipients = params.to.addresses();
        if recipients.is_empty() {
            return Ok(ActionOutcome::failure("No recipients"));
        }
        if let Some(bad) = recipients.iter().find(|r| r.parse::<lettre::Address>().is_err()) {
            return Ok(ActionOutcome::failure(format!("Invalid recipient address: {}", bad)));
        }

        self.mailer
            .send(OutgoingEmail {
                to: recipients.clone(),
                subject: params.subject.clone(),
                body: params.body.clone(),
                from_email: params.from_email.clone(),
            })
            .await?;

        Ok(ActionOutcome::success(Some(serde_json::json!({
            "sent_to": recipients,
            "subject": params.subject
        }))))
    }

    async fn execute_create_task(
        &self,
        params: &CreateTaskParams,
        context: &ExecutionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let related = match (&context.object, &params.fallback_related) {
            (Some(object), _) => Some((object.entity_type.clone(), object.id.clone())),
            (None, Some(fallback)) => Some((fallback.entity_type.clone(), fallback.id.clone())),
            (None, None) => None,
        };
        if related.is_none() && params.require_related_object {
            return Ok(ActionOutcome::failure("No related object for task"));
        }

        let assigned_to = match &params.assignee {
            Some(AssigneeRule::User { value }) => Some(*value),
            Some(AssigneeRule::Owner { fallback_user_id }) => context
                .object
                .as_ref()
                .and_then(Entity::owner_id)
                .or(*fallback_user_id),
            None => None,
        };

        let now = Utc::now();
        let due_date = match &params.due_date {
            Some(rule) => match rule.resolve(now) {
                Some(due) => Some(due),
                None => return Ok(ActionOutcome::failure("Due date out of range")),
            },
            None => None,
        };
        let (related_type, related_id) = related.unzip();
        let task = NewTask {
            id: Uuid::new_v4(),
            title: params.title.clone(),
            description: params.description.clone(),
            due_date,
            assigned_to,
            priority: params.priority.clone(),
            related_type,
            related_id,
            tenant_id: context.tenant_id,
            created_at: now,
        };

        let task_id = self.entities.create_task(task).await?;
        Ok(ActionOutcome::success(Some(serde_json::json!({
            "task_id": task_id,
            "assigned_to": assigned_to
        }))))
    }

    async fn execute_create_case(
        &self,
        params: &CreateCaseParams,
        context: &ExecutionContext,
    ) -> Result<ActionOutcome, ActionError> {
        if params.subject.trim().is_empty() {
            return Ok(ActionOutcome::failure("Case subject is empty"));
        }

        let case = NewCase {
            id: Uuid::new_v4(),
            subject: params.subject.clone(),
            description: params.description.clone(),
            account_id: Self::target_id(params.account_id.as_deref(), "account", context),
            priority: params.priority.clone(),
            tenant_id: context.tenant_id,
            created_at: Utc::now(),
        };

        let subject = case.subject.clone();
        let case_id = self.entities.create_case(case).await?;
        Ok(ActionOutcome::success(Some(serde_json::json!({
            "case_id": case_id,
            "subject": subject
        }))))
    }

    /// Record id for `entity_type`: explicit, else the context object, else `<type>_id` in the payload.
    fn target_id(explicit: Option<&str>, entity_type: &str, context: &ExecutionContext) -> Option<String> {
        explicit
            .map(str::to_string)
            .filter(|id| !id.trim().is_empty())
            .or_else(|| {
                context
                    .object
                    .as_ref()
                    .filter(|o| o.entity_type == entity_type)
                    .map(|o| o.id.clone())
            })
            .or_else(|| {
                context
                    .payload
                    .get(format!("{}_id", entity_type))
                    .filter(|v| !v.is_null())
                    .map(as_text)
            })
    }

    async fn execute_update_field(
        &self,
        params: &UpdateFieldParams,
        context: &ExecutionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let model = normalize_model(&params.model);
        let Some(instance_id) = Self::target_id(params.instance_id.as_deref(), &model, context) else {
            return Ok(ActionOutcome::failure(format!("No {} instance to update", model)));
        };

        if !self
            .entities
            .update_field(&model, &instance_id, &params.field_name, &params.new_value)
            .await?
        {
            return Ok(ActionOutcome::failure(format!("{} {} not found", model, instance_id)));
        }

        Ok(ActionOutcome::success(Some(serde_json::json!({
            "model": model,
            "instance_id": instance_id,
            "field": params.field_name,
            "new_value": params.new_value
        }))))
    }

    async fn execute_webhook(&self, params: &WebhookParams, context: &ExecutionContext) -> Result<ActionOutcome, ActionError> {
        let response = self
            .webhooks
            .deliver(WebhookRequest {
                url: &params.url,
                payload: &context.payload,
                headers: &params.headers,
                secret: params.secret.as_deref(),
                algorithm: params.signature_algorithm,
                signature_header: params.signature_header.as_deref(),
                timeout: params.timeout_secs.map(Duration::from_secs),
            })
            .await?;

        if !response.is_success() {
            return Ok(ActionOutcome::failure(format!(
                "Webhook returned status {}",
                response.status
            )));
        }

        Ok(ActionOutcome::success(Some(serde_json::json!({
            "url": params.url,
            "status_code": response.status
        }))))
    }

    async fn execute_assign_owner(
        &self,
        params: &AssignOwnerParams,
        context: &ExecutionContext,
    ) -> Result<ActionOutcome, ActionError> {
        let module = normalize_model(&params.module);
        let Some(record_id) = Self::target_id(params.record_id.as_deref(), &module, context) else {
            return Ok(ActionOutcome::failure(format!("No {} record to assign", module)));
        };

        if let Some(owner_id) = params.owner_id {
            if !self.entities.set_owner(&module, &record_id, owner_id).await? {
                return Ok(ActionOutcome::failure(format!("{} {} not found", module, record_id)));
            }
            return Ok(ActionOutcome::success(Some(serde_json::json!({
                "record_id": record_id,
                "owner_id": owner_id
            }))));
        }

        let outcome = match self.assignment.assign(&module, &record_id, context.tenant_id).await {
            Ok(outcome) => outcome,
            Err(AssignmentError::RecordNotFound(_, _)) => {
                return Ok(ActionOutcome::failure(format!("{} {} not found", module, record_id)));
            }
            Err(e) => return Err(e.into()),
        };

        let output = match outcome {
            AssignmentOutcome::Assigned { rule_name, owner_id, .. } => serde_json::json!({
                "record_id": record_id,
                "owner_id": owner_id,
                "rule": rule_name
            }),
            AssignmentOutcome::AlreadyOwned { owner_id } => serde_json::json!({
                "record_id": record_id,
                "owner_id": owner_id,
                "already_owned": true
            }),
            AssignmentOutcome::Unassigned => serde_json::json!({
                "record_id": record_id,
                "owner_id": null
            }),
        };
        Ok(ActionOutcome::success(Some(output)))
    }
}
