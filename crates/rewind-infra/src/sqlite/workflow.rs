//! SQLite workflow definition store.
//!
//! Definitions are stored as JSON blobs keyed by id, with the name and status
//! pulled out into columns for lookup.

use chrono::Utc;
use rewind_core::repository::workflow::WorkflowDefinitionStore;
use rewind_types::error::RepositoryError;
use rewind_types::workflow::WorkflowDefinition;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, is_unique_violation};

/// SQLite-backed implementation of `WorkflowDefinitionStore`.
#[derive(Debug, Clone)]
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a definition by id. A different definition already
    /// holding the same name is a `Conflict`.
    pub async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;
        let now = format_datetime(&Utc::now());

        let result = sqlx::query(
            r#"INSERT INTO workflows (id, name, status, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 status = excluded.status,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(def.status.to_string())
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(workflow_id = %def.id, name = def.name.as_str(), "saved workflow definition");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::Conflict(format!(
                "workflow '{}' already exists",
                def.name
            ))),
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    pub async fn get_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode_definition).transpose()
    }
}

fn decode_definition(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let json: String = row
        .try_get("definition")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    serde_json::from_str(&json)
        .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
}

impl WorkflowDefinitionStore for SqliteWorkflowStore {
    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode_definition).transpose()
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflows ORDER BY name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(decode_definition).collect()
    }
}
