//! SQLite execution repository.

use rewind_core::repository::execution::ExecutionRepository;
use rewind_types::error::RepositoryError;
use rewind_types::execution::{Execution, ExecutionFilter, ExecutionStatus};
use rewind_types::value::ValueMap;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, is_unique_violation, parse_datetime, parse_uuid};

/// SQLite-backed implementation of `ExecutionRepository`.
#[derive(Debug, Clone)]
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    workflow_id: String,
    triggered_by: String,
    parent_execution_id: Option<String>,
    status: String,
    current_step_index: i64,
    total_steps: i64,
    variables: String,
    progress: f64,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
    error: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            triggered_by: row.try_get("triggered_by")?,
            parent_execution_id: row.try_get("parent_execution_id")?,
            status: row.try_get("status")?,
            current_step_index: row.try_get("current_step_index")?,
            total_steps: row.try_get("total_steps")?,
            variables: row.try_get("variables")?,
            progress: row.try_get("progress")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        let status: ExecutionStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let variables: ValueMap = serde_json::from_str(&self.variables)
            .map_err(|e| RepositoryError::Query(format!("invalid variables JSON: {e}")))?;

        Ok(Execution {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            triggered_by: self.triggered_by,
            parent_execution_id: self
                .parent_execution_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            status,
            current_step_index: self.current_step_index as u32,
            total_steps: self.total_steps as u32,
            variables,
            progress: self.progress,
            started_at: parse_datetime(&self.started_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            error: self.error,
        })
    }
}

fn variables_json(execution: &Execution) -> Result<String, RepositoryError> {
    serde_json::to_string(&execution.variables)
        .map_err(|e| RepositoryError::Query(format!("serialize variables: {e}")))
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let variables = variables_json(execution)?;

        let result = sqlx::query(
            r#"INSERT INTO executions
               (id, workflow_id, triggered_by, parent_execution_id, status, current_step_index,
                total_steps, variables, progress, started_at, updated_at, completed_at, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(&execution.triggered_by)
        .bind(execution.parent_execution_id.map(|id| id.to_string()))
        .bind(execution.status.as_str())
        .bind(i64::from(execution.current_step_index))
        .bind(i64::from(execution.total_steps))
        .bind(&variables)
        .bind(execution.progress)
        .bind(format_datetime(&execution.started_at))
        .bind(format_datetime(&execution.updated_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(&execution.error)
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.id
            ))),
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let variables = variables_json(execution)?;

        let result = sqlx::query(
            r#"UPDATE executions SET
                 status = ?, current_step_index = ?, total_steps = ?, variables = ?,
                 progress = ?, updated_at = ?, completed_at = ?, error = ?
               WHERE id = ?"#,
        )
        .bind(execution.status.as_str())
        .bind(i64::from(execution.current_step_index))
        .bind(i64::from(execution.total_steps))
        .bind(&variables)
        .bind(execution.progress)
        .bind(format_datetime(&execution.updated_at))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(&execution.error)
        .bind(execution.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let workflow_id = filter.workflow_id.map(|id| id.to_string());
        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query(
            r#"SELECT * FROM executions
               WHERE (?1 IS NULL OR workflow_id = ?1)
                 AND (?2 IS NULL OR status = ?2)
               ORDER BY started_at DESC, id DESC
               LIMIT ?3"#,
        )
        .bind(&workflow_id)
        .bind(status)
        .bind(i64::from(filter.limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }
}
