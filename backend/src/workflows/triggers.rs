// Workflow Triggers - Matching events to workflows and loading their subject record

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use compass_shared::WorkflowDefinition;

use super::conditions::{as_text, resolve_path};
use super::store::WorkflowStore;
use crate::services::entities::{Entity, EntityStore};

/// Event domains that carry a primary record, e.g. `lead.created`.
const DEFAULT_DOMAINS: &[&str] = &[
    "lead",
    "opportunity",
    "case",
    "account",
    "contact",
    "subscription",
    "invoice",
    "campaign",
    "product",
    "sale",
];

/// Domain part of an event type: `lead.created` -> `lead`.
pub fn event_domain(event_type: &str) -> &str {
    event_type.split('.').next().unwrap_or(event_type)
}

#[derive(Clone)]
pub struct EventRouter {
    store: Arc<dyn WorkflowStore>,
}

impl EventRouter {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// Active workflows subscribed to `event_type` whose trigger conditions all
    /// hold for `payload`. A lookup failure is logged and yields no workflows.
    pub async fn evaluate_trigger(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
        tenant_id: Option<Uuid>,
    ) -> Vec<WorkflowDefinition> {
        let candidates = match self.store.workflows_for_event(event_type, tenant_id).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Failed to load workflows for {}: {}", event_type, e);
                return Vec::new();
            }
        };

        let matched: Vec<WorkflowDefinition> = candidates
            .into_iter()
            .filter(|(workflow, conditions)| {
                let hit = conditions.matches(payload);
                if !hit {
                    debug!("Workflow '{}' conditions not met for {}", workflow.name, event_type);
                }
                hit
            })
            .map(|(workflow, _)| workflow)
            .collect();

        debug!("{} workflows matched {}", matched.len(), event_type);
        matched
    }
}

/// Where to find the primary record for an event domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextBinding {
    pub entity_type: String,
    /// Payload keys tried in order
    pub id_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContextResolver {
    bindings: HashMap<String, ContextBinding>,
}

impl Default for ContextResolver {
    fn default() -> Self {
        let mut resolver = Self {
            bindings: HashMap::new(),
        };
        for domain in DEFAULT_DOMAINS {
            resolver = resolver.bind(domain, domain, &[&format!("{}_id", domain), "id"]);
        }
        resolver
    }
}

impl ContextResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, domain: &str, entity_type: &str, id_keys: &[&str]) -> Self {
        self.bindings.insert(
            domain.to_string(),
            ContextBinding {
                entity_type: entity_type.to_string(),
                id_keys: id_keys.iter().map(|k| k.to_string()).collect(),
            },
        );
        self
    }

    pub fn binding(&self, event_type: &str) -> Option<&ContextBinding> {
        self.bindings.get(event_domain(event_type))
    }

    /// Load the record the event is about. Unknown domains, missing ids and
    /// lookup failures all resolve to `None`.
    pub async fn resolve(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
        entities: &dyn EntityStore,
    ) -> Option<Entity> {
        let binding = self.binding(event_type)?;
        let id = binding
            .id_keys
            .iter()
            .filter_map(|key| resolve_path(payload, key))
            .find(|v| !v.is_null())
            .map(as_text)?;

        match entities.find(&binding.entity_type, &id).await {
            Ok(Some(entity)) => Some(entity),
            Ok(None) => {
                debug!("{} {} not found for {}", binding.entity_type, id, event_type);
                None
            }
            Err(e) => {
                warn!("Failed to load {} {}: {}", binding.entity_type, id, e);
                None
            }
        }
    }
}
