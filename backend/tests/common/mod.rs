// Common test utilities that are shared across integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use compass_backend::build_engine;
use compass_backend::services::{InMemoryEntityStore, MailError, Mailer, OutgoingEmail, WebhookClient};
use compass_backend::services::webhook::DEFAULT_SIGNATURE_HEADER;
use compass_backend::workflows::{InMemoryStore, SaveWorkflow, WorkflowEngine};
use compass_shared::WorkflowDefinition;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init()
            .ok();
    });
}

/// Mailer that keeps every message it is asked to send.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<(), MailError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(email);
        }
        Ok(())
    }
}

pub struct Harness {
    pub engine: WorkflowEngine,
    pub store: Arc<InMemoryStore>,
    pub entities: Arc<InMemoryEntityStore>,
    pub mailer: Arc<RecordingMailer>,
}

pub fn harness() -> Harness {
    init_test_logging();

    let store = Arc::new(InMemoryStore::new());
    let entities = InMemoryEntityStore::new();
    let mailer = Arc::new(RecordingMailer::default());
    let engine = build_engine(
        store.clone(),
        entities.clone(),
        mailer.clone(),
        WebhookClient::new(Duration::from_secs(5), DEFAULT_SIGNATURE_HEADER),
    );

    Harness {
        engine,
        store,
        entities,
        mailer,
    }
}

impl Harness {
    pub async fn save(&self, name: &str, builder_data: serde_json::Value) -> WorkflowDefinition {
        self.engine
            .save(SaveWorkflow {
                name: name.to_string(),
                builder_data,
                ..Default::default()
            })
            .await
            .expect("workflow should save")
    }
}

// ==================== Graph fixtures ====================

pub fn trigger(event_type: &str, conditions: serde_json::Value) -> serde_json::Value {
    json!({"id": "trigger", "name": "trigger", "data": {"event_type": event_type, "conditions": conditions}})
}

pub fn node(id: &str, name: &str, data: serde_json::Value) -> serde_json::Value {
    json!({"id": id, "name": name, "data": data})
}

pub fn edge(from: &str, to: &str) -> serde_json::Value {
    json!({"from": from, "to": to})
}

pub fn branch_edge(from: &str, to: &str, yes: bool) -> serde_json::Value {
    json!({"from": from, "to": to, "output": if yes { "output_1" } else { "output_2" }})
}

pub fn graph(nodes: Vec<serde_json::Value>, edges: Vec<serde_json::Value>) -> serde_json::Value {
    json!({"nodes": nodes, "edges": edges})
}

pub fn set_field(id: &str, field: &str, value: serde_json::Value) -> serde_json::Value {
    node(id, "update_field", json!({"model": "lead", "field_name": field, "new_value": value}))
}

/// trigger -> a -> b -> ... in order
pub fn chain(event_type: &str, steps: Vec<serde_json::Value>) -> serde_json::Value {
    let mut nodes = vec![trigger(event_type, json!({}))];
    let mut edges = Vec::new();
    let mut previous = "trigger".to_string();
    for step in steps {
        let id = step["id"].as_str().unwrap_or_default().to_string();
        edges.push(edge(&previous, &id));
        nodes.push(step);
        previous = id;
    }
    graph(nodes, edges)
}
