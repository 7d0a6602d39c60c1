//! Execution record persistence.

use rewind_types::error::RepositoryError;
use rewind_types::execution::{Execution, ExecutionFilter};
use uuid::Uuid;

/// Repository trait for execution records.
pub trait ExecutionRepository: Send + Sync {
    /// Insert a new execution. `Conflict` if the ID already exists.
    fn create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution by its UUID.
    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Replace the stored record. `NotFound` if it was never created.
    fn update_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List executions matching `filter`, newest first (`started_at` DESC,
    /// then `id` DESC), at most `filter.limit` entries.
    fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;
}
