// Assignment Rules - Picks an owner for an unowned record

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use compass_shared::{AssignmentRule, AssignmentRuleType};

use super::conditions::{as_text, resolve_path};
use super::store::{AssignmentRuleStore, StoreError};
use super::{Condition, ConditionOperator};
use crate::services::entities::{Entity, EntityError, EntityStore};

const ROTATION_ATTEMPTS: usize = 5;
const DEFAULT_TERRITORY_FIELD: &str = "country";

#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Entity error: {0}")]
    Entity(#[from] EntityError),

    #[error("Record not found: {0} {1}")]
    RecordNotFound(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentOutcome {
    Assigned {
        rule_id: Uuid,
        rule_name: String,
        owner_id: Uuid,
    },
    /// The record already had an owner; nothing changed
    AlreadyOwned { owner_id: Uuid },
    /// No rule matched or no rule had an eligible assignee
    Unassigned,
}

impl AssignmentOutcome {
    pub fn owner_id(&self) -> Option<Uuid> {
        match self {
            Self::Assigned { owner_id, .. } | Self::AlreadyOwned { owner_id } => Some(*owner_id),
            Self::Unassigned => None,
        }
    }
}

/// `field` means equality, `field__op` uses the named operator.
pub fn criteria_conditions(criteria: &serde_json::Map<String, serde_json::Value>) -> Vec<Condition> {
    criteria
        .iter()
        .map(|(key, value)| match key.rsplit_once("__") {
            Some((field, op)) => Condition::new(field, ConditionOperator::parse(op), value.clone()),
            None => Condition::eq(key, value.clone()),
        })
        .collect()
}

#[derive(Clone)]
pub struct AssignmentRuleEngine {
    rules: Arc<dyn AssignmentRuleStore>,
    entities: Arc<dyn EntityStore>,
}

impl AssignmentRuleEngine {
    pub fn new(rules: Arc<dyn AssignmentRuleStore>, entities: Arc<dyn EntityStore>) -> Self {
        Self { rules, entities }
    }

    /// Run the module's rules against one record and persist the chosen owner.
    pub async fn assign(
        &self,
        module: &str,
        record_id: &str,
        tenant_id: Option<Uuid>,
    ) -> Result<AssignmentOutcome, AssignmentError> {
        let record = self
            .entities
            .find(module, record_id)
            .await?
            .ok_or_else(|| AssignmentError::RecordNotFound(module.to_string(), record_id.to_string()))?;

        if let Some(owner_id) = record.owner_id() {
            debug!("{} {} already owned by {}", module, record_id, owner_id);
            return Ok(AssignmentOutcome::AlreadyOwned { owner_id });
        }

        let document = record.to_json();
        for rule in self.rules.rules_for_module(module, tenant_id).await? {
            if !Self::matches_criteria(&rule, &document) {
                continue;
            }

            let Some(owner_id) = self.pick(&rule, &record, &document).await? else {
                debug!("Rule '{}' matched but has no eligible assignee", rule.name);
                continue;
            };

            if !self.entities.set_owner(module, record_id, owner_id).await? {
                return Err(AssignmentError::RecordNotFound(module.to_string(), record_id.to_string()));
            }

            info!(
                "Assigned {} {} to {} via rule '{}'",
                module, record_id, owner_id, rule.name
            );
            return Ok(AssignmentOutcome::Assigned {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                owner_id,
            });
        }

        info!("No assignment rule applied to {} {}", module, record_id);
        Ok(AssignmentOutcome::Unassigned)
    }

    fn matches_criteria(rule: &AssignmentRule, document: &serde_json::Value) -> bool {
        criteria_conditions(&rule.criteria)
            .iter()
            .all(|c| c.evaluate(document))
    }

    async fn pick(
        &self,
        rule: &AssignmentRule,
        record: &Entity,
        document: &serde_json::Value,
    ) -> Result<Option<Uuid>, AssignmentError> {
        match rule.rule_type {
            AssignmentRuleType::RoundRobin => self.next_in_rotation(rule).await,
            AssignmentRuleType::Territory => Ok(Self::by_territory(rule, document)),
            AssignmentRuleType::Criteria => Ok(rule.active_assignees().first().map(|a| a.user_id)),
            AssignmentRuleType::LoadBalanced => self.least_loaded(rule, &record.entity_type).await,
        }
    }

    /// Advances the rule's rotation with compare-and-swap so that concurrent
    /// callers never hand out the same slot twice.
    async fn next_in_rotation(&self, rule: &AssignmentRule) -> Result<Option<Uuid>, AssignmentError> {
        let mut current = rule.clone();

        for _ in 0..ROTATION_ATTEMPTS {
            let assignees = current.active_assignees();
            if assignees.is_empty() {
                return Ok(None);
            }

            let len = assignees.len() as i32;
            let index = current.last_assigned_index.rem_euclid(len);
            let chosen = assignees[index as usize].user_id;

            if self
                .rules
                .advance_rotation(current.id, current.last_assigned_index, (index + 1) % len)
                .await?
            {
                return Ok(Some(chosen));
            }

            warn!("Rotation for rule '{}' moved underneath us, reloading", current.name);
            current = match self.rules.get_rule(current.id).await? {
                Some(rule) => rule,
                None => return Ok(None),
            };
        }

        warn!("Gave up advancing rotation for rule '{}'", rule.name);
        Ok(None)
    }

    fn by_territory(rule: &AssignmentRule, document: &serde_json::Value) -> Option<Uuid> {
        let field = rule.territory_field.as_deref().unwrap_or(DEFAULT_TERRITORY_FIELD);
        let territory = resolve_path(document, field).map(as_text)?;
        let territory = territory.trim();
        if territory.is_empty() {
            return None;
        }

        rule.active_assignees()
            .into_iter()
            .find(|a| a.territories.iter().any(|t| t.eq_ignore_ascii_case(territory)))
            .map(|a| a.user_id)
    }

    async fn least_loaded(&self, rule: &AssignmentRule, entity_type: &str) -> Result<Option<Uuid>, AssignmentError> {
        let mut best: Option<(Uuid, i64)> = None;
        for assignee in rule.active_assignees() {
            let count = self.entities.count_owned(entity_type, assignee.user_id).await?;
            if best.map(|(_, c)| count < c).unwrap_or(true) {
                best = Some((assignee.user_id, count));
            }
        }
        Ok(best.map(|(id, _)| id))
    }
}
