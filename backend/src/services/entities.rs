// Entity Store - Access to the business records workflows act on

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

pub type EntityResult<T> = Result<T, EntityError>;

/// A loaded business record (lead, opportunity, case, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub entity_type: String,
    pub id: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Entity {
    pub fn new(entity_type: &str, id: impl ToString, attributes: serde_json::Value) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            attributes: match attributes {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
        }
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.attributes.get(field)
    }

    pub fn owner_id(&self) -> Option<Uuid> {
        self.attributes
            .get("owner_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Attributes plus `id` and `entity_type`, for templating and conditions.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = self.attributes.clone();
        map.entry("id").or_insert_with(|| serde_json::Value::String(self.id.clone()));
        map.insert(
            "entity_type".to_string(),
            serde_json::Value::String(self.entity_type.clone()),
        );
        serde_json::Value::Object(map)
    }
}

/// Task created by the `create_task` action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub assigned_to: Option<Uuid>,
    pub priority: Option<String>,
    pub related_type: Option<String>,
    pub related_id: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Support case opened by the `create_case` action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewCase {
    pub id: Uuid,
    pub subject: String,
    pub description: String,
    pub account_id: Option<String>,
    pub priority: String,
    pub tenant_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find(&self, entity_type: &str, id: &str) -> EntityResult<Option<Entity>>;

    /// `Ok(false)` when the record does not exist.
    async fn update_field(
        &self,
        entity_type: &str,
        id: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> EntityResult<bool>;

    async fn create_task(&self, task: NewTask) -> EntityResult<Uuid>;

    async fn create_case(&self, case: NewCase) -> EntityResult<Uuid>;

    async fn set_owner(&self, entity_type: &str, id: &str, owner: Uuid) -> EntityResult<bool> {
        self.update_field(entity_type, id, "owner_id", &serde_json::json!(owner.to_string()))
            .await
    }

    async fn count_owned(&self, entity_type: &str, owner: Uuid) -> EntityResult<i64>;
}

/// Process-local entity store used by tests and the no-database mode.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    records: RwLock<HashMap<(String, String), Entity>>,
    tasks: RwLock<Vec<NewTask>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, entity: Entity) {
        self.records
            .write()
            .await
            .insert((entity.entity_type.clone(), entity.id.clone()), entity);
    }

    pub async fn get(&self, entity_type: &str, id: &str) -> Option<Entity> {
        self.records
            .read()
            .await
            .get(&(entity_type.to_string(), id.to_string()))
            .cloned()
    }

    pub async fn all(&self, entity_type: &str) -> Vec<Entity> {
        self.records
            .read()
            .await
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect()
    }

    pub async fn tasks(&self) -> Vec<NewTask> {
        self.tasks.read().await.clone()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn find(&self, entity_type: &str, id: &str) -> EntityResult<Option<Entity>> {
        Ok(self.get(entity_type, id).await)
    }

    async fn update_field(
        &self,
        entity_type: &str,
        id: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> EntityResult<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(&(entity_type.to_string(), id.to_string())) {
            Some(entity) => {
                entity.attributes.insert(field.to_string(), value.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_task(&self, task: NewTask) -> EntityResult<Uuid> {
        let id = task.id;
        self.tasks.write().await.push(task);
        Ok(id)
    }

    async fn create_case(&self, case: NewCase) -> EntityResult<Uuid> {
        let id = case.id;
        let attributes = serde_json::json!({
            "subject": case.subject,
            "description": case.description,
            "account_id": case.account_id,
            "priority": case.priority,
            "tenant_id": case.tenant_id,
            "created_at": case.created_at,
        });
        self.insert(Entity::new("case", id, attributes)).await;
        Ok(id)
    }

    async fn count_owned(&self, entity_type: &str, owner: Uuid) -> EntityResult<i64> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|e| e.entity_type == entity_type && e.owner_id() == Some(owner))
            .count() as i64)
    }
}

/// Entity store over the host application's tables.
#[derive(Clone)]
pub struct PgEntityStore {
    pool: PgPool,
    tables: HashMap<String, String>,
    task_table: String,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        let tables = [
            ("lead", "leads"),
            ("opportunity", "opportunities"),
            ("case", "cases"),
            ("account", "accounts"),
            ("contact", "contacts"),
            ("subscription", "subscriptions"),
            ("invoice", "invoices"),
            ("campaign", "campaigns"),
            ("product", "products"),
            ("sale", "sales"),
        ]
        .into_iter()
        .map(|(entity, table)| (entity.to_string(), table.to_string()))
        .collect();

        Self {
            pool,
            tables,
            task_table: "tasks".to_string(),
        }
    }

    pub fn with_table(mut self, entity_type: &str, table: &str) -> Self {
        self.tables.insert(entity_type.to_string(), table.to_string());
        self
    }

    fn table(&self, entity_type: &str) -> EntityResult<&str> {
        let table = self
            .tables
            .get(entity_type)
            .ok_or_else(|| EntityError::UnknownEntityType(entity_type.to_string()))?;
        identifier(table)
    }
}

/// Identifiers are interpolated into SQL, so only plain snake_case names pass.
fn identifier(name: &str) -> EntityResult<&str> {
    let valid = !name.is_empty()
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(EntityError::InvalidIdentifier(name.to_string()))
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn find(&self, entity_type: &str, id: &str) -> EntityResult<Option<Entity>> {
        let table = self.table(entity_type)?;
        let row = sqlx::query(&format!(
            "SELECT to_jsonb(t) AS record FROM {} t WHERE t.id::text = $1",
            table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|r| r.try_get::<serde_json::Value, _>("record"))
            .transpose()?
            .map(|record| Entity::new(entity_type, id, record)))
    }

    async fn update_field(
        &self,
        entity_type: &str,
        id: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> EntityResult<bool> {
        let table = self.table(entity_type)?;
        let column = identifier(field)?;

        // jsonb_populate_record casts the JSON value to the column's own type
        let result = sqlx::query(&format!(
            "UPDATE {table} SET {column} = (jsonb_populate_record(NULL::{table}, jsonb_build_object($2::text, $3::jsonb))).{column} WHERE id::text = $1",
        ))
        .bind(id)
        .bind(column)
        .bind(value)
        .execute(&self.pool)
        .await?;

        debug!("Updated {}.{} on {} {}", table, column, entity_type, id);
        Ok(result.rows_affected() > 0)
    }

    async fn create_task(&self, task: NewTask) -> EntityResult<Uuid> {
        let table = identifier(&self.task_table)?;
        sqlx::query(&format!(
            "INSERT INTO {} (id, title, description, due_date, assigned_to, priority, related_type, related_id, tenant_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            table
        ))
        .bind(task.id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.due_date)
        .bind(task.assigned_to)
        .bind(&task.priority)
        .bind(&task.related_type)
        .bind(&task.related_id)
        .bind(task.tenant_id)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;

        info!("Created task {} ({})", task.id, task.title);
        Ok(task.id)
    }

    async fn create_case(&self, case: NewCase) -> EntityResult<Uuid> {
        let table = self.table("case")?;
        sqlx::query(&format!(
            "INSERT INTO {} (id, subject, description, account_id, priority, tenant_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            table
        ))
        .bind(case.id)
        .bind(&case.subject)
        .bind(&case.description)
        .bind(&case.account_id)
        .bind(&case.priority)
        .bind(case.tenant_id)
        .bind(case.created_at)
        .execute(&self.pool)
        .await?;

        info!("Created case {} ({})", case.id, case.subject);
        Ok(case.id)
    }

    async fn count_owned(&self, entity_type: &str, owner: Uuid) -> EntityResult<i64> {
        let table = self.table(entity_type)?;
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE owner_id::text = $1",
            table
        ))
        .bind(owner.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_update_missing_record_reports_false() {
        let store = InMemoryEntityStore::new();
        let updated = store.update_field("lead", "42", "status", &json!("qualified")).await.unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn test_set_owner_and_count() {
        let store = InMemoryEntityStore::new();
        let owner = Uuid::new_v4();
        store.insert(Entity::new("lead", "1", json!({"name": "Ada"}))).await;
        store.insert(Entity::new("lead", "2", json!({"name": "Grace"}))).await;

        assert!(store.set_owner("lead", "1", owner).await.unwrap());
        assert_eq!(store.count_owned("lead", owner).await.unwrap(), 1);
        assert_eq!(store.get("lead", "1").await.unwrap().owner_id(), Some(owner));
    }

    #[tokio::test]
    async fn test_created_case_is_findable() {
        let store = InMemoryEntityStore::new();
        let id = store
            .create_case(NewCase {
                id: Uuid::new_v4(),
                subject: "Printer on fire".to_string(),
                description: String::new(),
                account_id: Some("acme".to_string()),
                priority: "high".to_string(),
                tenant_id: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let case = store.find("case", &id.to_string()).await.unwrap().unwrap();
        assert_eq!(case.get("subject"), Some(&json!("Printer on fire")));
        assert_eq!(case.get("account_id"), Some(&json!("acme")));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(identifier("owner_id").is_ok());
        assert!(identifier("status; DROP TABLE leads").is_err());
        assert!(identifier("Status").is_err());
        assert!(identifier("").is_err());
    }

    #[test]
    fn test_entity_json_includes_id() {
        let entity = Entity::new("lead", 7, json!({"name": "Ada"}));
        let doc = entity.to_json();
        assert_eq!(doc["id"], json!("7"));
        assert_eq!(doc["entity_type"], json!("lead"));
    }
}
