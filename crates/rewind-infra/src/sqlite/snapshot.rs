//! SQLite snapshot repository.
//!
//! The `execution_snapshots` table is append-only: triggers abort any UPDATE
//! or DELETE, and `(execution_id, sequence)` is unique.

use rewind_core::repository::snapshot::SnapshotRepository;
use rewind_types::error::RepositoryError;
use rewind_types::snapshot::{ExecutionSnapshot, SnapshotOrder, SnapshotQuery, SnapshotType};
use rewind_types::value::ValueMap;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, is_unique_violation, parse_datetime, parse_uuid};

/// SQLite-backed implementation of `SnapshotRepository`.
#[derive(Debug, Clone)]
pub struct SqliteSnapshotRepository {
    pool: DatabasePool,
}

impl SqliteSnapshotRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct SnapshotRow {
    id: String,
    execution_id: String,
    sequence: i64,
    step_index: i64,
    timestamp: String,
    snapshot_type: String,
    state: String,
    metadata: String,
    description: Option<String>,
    is_checkpoint: bool,
}

impl SnapshotRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            sequence: row.try_get("sequence")?,
            step_index: row.try_get("step_index")?,
            timestamp: row.try_get("timestamp")?,
            snapshot_type: row.try_get("snapshot_type")?,
            state: row.try_get("state")?,
            metadata: row.try_get("metadata")?,
            description: row.try_get("description")?,
            is_checkpoint: row.try_get("is_checkpoint")?,
        })
    }

    fn into_snapshot(self) -> Result<ExecutionSnapshot, RepositoryError> {
        let snapshot_type: SnapshotType = self
            .snapshot_type
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let state: ValueMap = serde_json::from_str(&self.state)
            .map_err(|e| RepositoryError::Query(format!("invalid snapshot state JSON: {e}")))?;
        let metadata: ValueMap = serde_json::from_str(&self.metadata)
            .map_err(|e| RepositoryError::Query(format!("invalid snapshot metadata JSON: {e}")))?;

        Ok(ExecutionSnapshot {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            sequence: self.sequence as u64,
            step_index: self.step_index as u32,
            timestamp: parse_datetime(&self.timestamp)?,
            snapshot_type,
            state,
            metadata,
            description: self.description,
            is_checkpoint: self.is_checkpoint,
        })
    }
}

fn decode_all(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<ExecutionSnapshot>, RepositoryError> {
    let mut snapshots = Vec::with_capacity(rows.len());
    for row in rows {
        let r = SnapshotRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        snapshots.push(r.into_snapshot()?);
    }
    Ok(snapshots)
}

// ---------------------------------------------------------------------------
// SnapshotRepository impl
// ---------------------------------------------------------------------------

impl SnapshotRepository for SqliteSnapshotRepository {
    async fn append_snapshot(&self, snapshot: &ExecutionSnapshot) -> Result<(), RepositoryError> {
        let state = serde_json::to_string(&snapshot.state)
            .map_err(|e| RepositoryError::Query(format!("serialize snapshot state: {e}")))?;
        let metadata = serde_json::to_string(&snapshot.metadata)
            .map_err(|e| RepositoryError::Query(format!("serialize snapshot metadata: {e}")))?;

        let result = sqlx::query(
            r#"INSERT INTO execution_snapshots
               (id, execution_id, sequence, step_index, timestamp, snapshot_type,
                state, metadata, description, is_checkpoint)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(snapshot.id.to_string())
        .bind(snapshot.execution_id.to_string())
        .bind(snapshot.sequence as i64)
        .bind(i64::from(snapshot.step_index))
        .bind(format_datetime(&snapshot.timestamp))
        .bind(snapshot.snapshot_type.as_str())
        .bind(&state)
        .bind(&metadata)
        .bind(&snapshot.description)
        .bind(snapshot.is_checkpoint)
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::Conflict(format!(
                "sequence {} already used for execution {}",
                snapshot.sequence, snapshot.execution_id
            ))),
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn get_snapshot(&self, id: &Uuid) -> Result<Option<ExecutionSnapshot>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM execution_snapshots WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = SnapshotRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_snapshot()?))
            }
            None => Ok(None),
        }
    }

    async fn list_snapshots(
        &self,
        execution_id: &Uuid,
        query: &SnapshotQuery,
        order: SnapshotOrder,
    ) -> Result<Vec<ExecutionSnapshot>, RepositoryError> {
        let order_by = match order {
            SnapshotOrder::Step => "step_index ASC, sequence ASC",
            SnapshotOrder::Creation => "sequence ASC",
        };
        let sql = format!(
            r#"SELECT * FROM execution_snapshots
               WHERE execution_id = ?1
                 AND (?2 IS NULL OR step_index >= ?2)
                 AND (?3 IS NULL OR step_index <= ?3)
                 AND (?4 = 0 OR is_checkpoint = 1)
               ORDER BY {order_by}"#
        );

        let rows = sqlx::query(&sql)
            .bind(execution_id.to_string())
            .bind(query.from_step.map(i64::from))
            .bind(query.to_step.map(i64::from))
            .bind(query.checkpoints_only)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_all(&rows)
    }

    async fn latest_snapshot(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<ExecutionSnapshot>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM execution_snapshots WHERE execution_id = ? ORDER BY sequence DESC LIMIT 1",
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = SnapshotRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_snapshot()?))
            }
            None => Ok(None),
        }
    }
}
