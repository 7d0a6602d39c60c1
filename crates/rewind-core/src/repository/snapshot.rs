//! Append-only snapshot log persistence.

use rewind_types::error::RepositoryError;
use rewind_types::snapshot::{ExecutionSnapshot, SnapshotOrder, SnapshotQuery};
use uuid::Uuid;

/// Repository trait for the snapshot log.
///
/// Snapshots are immutable once appended, so there is no update or delete.
pub trait SnapshotRepository: Send + Sync {
    /// Append a snapshot. `Conflict` if `(execution_id, sequence)` is taken.
    fn append_snapshot(
        &self,
        snapshot: &ExecutionSnapshot,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a snapshot by its UUID.
    fn get_snapshot(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionSnapshot>, RepositoryError>> + Send;

    /// List one execution's snapshots matching `query` in the given order.
    fn list_snapshots(
        &self,
        execution_id: &Uuid,
        query: &SnapshotQuery,
        order: SnapshotOrder,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionSnapshot>, RepositoryError>> + Send;

    /// The snapshot with the highest sequence for an execution.
    fn latest_snapshot(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionSnapshot>, RepositoryError>> + Send;
}
