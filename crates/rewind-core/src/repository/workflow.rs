//! Workflow definition lookup.

use rewind_types::error::RepositoryError;
use rewind_types::workflow::WorkflowDefinition;
use uuid::Uuid;

/// Read-only lookup of workflow definitions.
///
/// Registering definitions is an infrastructure concern (see the SQLite and
/// in-memory stores); the engine only ever reads.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowDefinitionStore: Send + Sync {
    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List all workflow definitions, ordered by name.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;
}
