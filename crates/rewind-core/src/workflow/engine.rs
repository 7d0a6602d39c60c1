//! Execution engine: runs workflows as a state machine over the snapshot log.
//!
//! `ExecutionEngine` owns the lifecycle of every execution: it creates the
//! record, spawns one background stepper per running execution, and routes
//! pause / resume / rollback through the per-execution lock so that the
//! execution record and the snapshot log always move together.
//!
//! Control operations (pause, resume, rollback) also hold a per-execution
//! control lock from stopping the old stepper until the new one is
//! registered, so two overlapping calls can never leave two steppers alive.
//!
//! # Stepper flow
//!
//! 1. Find the wave containing `current_step_index`.
//! 2. Run the rest of that wave: one step at a time when the fan-out bound is
//!    1 or only one step remains, otherwise concurrently under a semaphore.
//! 3. Each attempt writes `step_start`, invokes the callback, then writes
//!    `step_end` (plus a `checkpoint` for flagged steps) or one `error`.
//! 4. Advance the cursor past the finished steps and recompute progress.
//! 5. Past the last step, mark the execution completed.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use rewind_types::config::EngineConfig;
use rewind_types::error::{ErrorKind, RepositoryError};
use rewind_types::event::ExecutionEvent;
use rewind_types::execution::{Execution, ExecutionFilter, ExecutionProgress, ExecutionStatus};
use rewind_types::snapshot::{ExecutionSnapshot, NewSnapshot, SnapshotType};
use rewind_types::value::{ValueMap, first_non_finite};
use rewind_types::workflow::{StepDefinition, WorkflowDefinition};
use tokio::sync::{OwnedMutexGuard, Semaphore, broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::execution::ExecutionRepository;
use crate::repository::snapshot::SnapshotRepository;
use crate::repository::workflow::WorkflowDefinitionStore;
use crate::snapshot::locks::ExecutionLocks;
use crate::snapshot::store::{SnapshotError, SnapshotStore};
use crate::snapshot::time_travel::TimeTravelService;

use super::dag::ExecutionPlan;
use super::definition::{WorkflowError, validate_definition};
use super::registry::{StepFailure, StepInvocation, StepRegistry};
use super::retry::{RetryDecision, RetryTracker};
use super::step_executor::{AttemptResult, StepExecutor, resolve_input};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("workflow {0} is not active")]
    WorkflowInactive(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(Uuid),

    #[error("no checkpoint at step index {step_index} for execution {execution_id}")]
    CheckpointNotFound { execution_id: Uuid, step_index: u32 },

    #[error("cannot {operation} execution {execution_id} while it is {status}")]
    InvalidState {
        execution_id: Uuid,
        status: ExecutionStatus,
        operation: &'static str,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("step execution error: {0}")]
    StepExecution(String),

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::WorkflowNotFound(_)
            | EngineError::ExecutionNotFound(_)
            | EngineError::SnapshotNotFound(_)
            | EngineError::CheckpointNotFound { .. } => ErrorKind::NotFound,
            EngineError::WorkflowInactive(_) | EngineError::InvalidState { .. } => {
                ErrorKind::InvalidState
            }
            EngineError::Validation(_) | EngineError::Workflow(_) => ErrorKind::Validation,
            EngineError::StepExecution(_) => ErrorKind::StepExecution,
            EngineError::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            EngineError::Repository(_) => ErrorKind::Storage,
        }
    }
}

impl From<SnapshotError> for EngineError {
    fn from(e: SnapshotError) -> Self {
        match e {
            SnapshotError::SnapshotNotFound(id) => EngineError::SnapshotNotFound(id),
            SnapshotError::ExecutionNotFound(id) => EngineError::ExecutionNotFound(id),
            SnapshotError::Validation(msg) => EngineError::Validation(msg),
            SnapshotError::ConcurrencyConflict(msg) => EngineError::ConcurrencyConflict(msg),
            SnapshotError::Repository(e) => EngineError::Repository(e),
        }
    }
}

fn invalid_state(execution: &Execution, operation: &'static str) -> EngineError {
    EngineError::InvalidState {
        execution_id: execution.id,
        status: execution.status,
        operation,
    }
}

// ---------------------------------------------------------------------------
// Public option / handle types
// ---------------------------------------------------------------------------

/// Per-start overrides.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Execution that spawned this one, if any. Must exist.
    pub parent_execution_id: Option<Uuid>,
    /// Override of `EngineConfig::max_fan_out` for this execution.
    pub max_fan_out: Option<usize>,
}

#[derive(Debug)]
struct StepperHandle {
    generation: u64,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Held across a control operation. Dropping it unlocks and prunes the
/// execution's idle lock slots.
struct ControlGuard<'a, S: SnapshotRepository> {
    guard: Option<OwnedMutexGuard<()>>,
    controls: &'a ExecutionLocks<()>,
    snapshots: &'a SnapshotStore<S>,
    execution_id: Uuid,
}

impl<S: SnapshotRepository> Drop for ControlGuard<'_, S> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.controls.release(self.execution_id);
        self.snapshots.release(self.execution_id);
    }
}

/// Where a step's snapshots go. Concurrent branches share the wave's first
/// index; sequential steps use their own.
#[derive(Debug, Clone, Copy)]
struct StepSlot {
    plan_index: u32,
    snapshot_index: u32,
}

/// Result of running all attempts of one step.
enum StepRun {
    Succeeded { updates: ValueMap, duration_ms: u64 },
    Failed(String),
    Cancelled,
}

/// Result of advancing the execution by one step or one wave.
#[derive(Debug)]
enum StepResult {
    Completed,
    Failed(String),
    Cancelled,
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

/// Workflow execution engine.
///
/// Generic over its three storage ports. Cloning is cheap and shares state.
pub struct ExecutionEngine<W, E, S>
where
    W: WorkflowDefinitionStore,
    E: ExecutionRepository,
    S: SnapshotRepository,
{
    inner: Arc<EngineInner<W, E, S>>,
}

impl<W, E, S> Clone for ExecutionEngine<W, E, S>
where
    W: WorkflowDefinitionStore,
    E: ExecutionRepository,
    S: SnapshotRepository,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<W, E, S>
where
    W: WorkflowDefinitionStore,
    E: ExecutionRepository,
    S: SnapshotRepository,
{
    workflows: W,
    executions: E,
    snapshots: Arc<SnapshotStore<S>>,
    steps: StepExecutor,
    config: EngineConfig,
    events: EventBus,
    /// At most one live stepper per execution.
    steppers: DashMap<Uuid, StepperHandle>,
    /// Serializes pause / resume / rollback per execution.
    controls: ExecutionLocks<()>,
    /// Effective fan-out bound per unfinished execution.
    fan_out: DashMap<Uuid, usize>,
    generation: AtomicU64,
}

impl<W, E, S> ExecutionEngine<W, E, S>
where
    W: WorkflowDefinitionStore + 'static,
    E: ExecutionRepository + 'static,
    S: SnapshotRepository + 'static,
{
    pub fn new(
        workflows: W,
        executions: E,
        snapshots: S,
        registry: StepRegistry,
        config: EngineConfig,
    ) -> Self {
        let snapshots = Arc::new(SnapshotStore::new(
            snapshots,
            Duration::from_millis(config.lock_timeout_ms),
        ));
        let steps = StepExecutor::new(
            registry,
            Duration::from_secs(config.default_step_timeout_secs),
        );
        // Long enough to cover a stepper stop plus a writer wait.
        let control_timeout = Duration::from_millis(
            config
                .lock_timeout_ms
                .saturating_add(config.stepper_stop_timeout_ms),
        );
        Self {
            inner: Arc::new(EngineInner {
                workflows,
                executions,
                snapshots,
                steps,
                events: EventBus::new(config.event_capacity),
                config,
                steppers: DashMap::new(),
                controls: ExecutionLocks::new(control_timeout),
                fan_out: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Receive lifecycle events for every execution from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    /// The snapshot store shared with the time-travel layer.
    pub fn snapshot_store(&self) -> Arc<SnapshotStore<S>> {
        Arc::clone(&self.inner.snapshots)
    }

    /// A read-only time-travel service over this engine's log.
    pub fn time_travel(&self) -> TimeTravelService<E, S>
    where
        E: Clone,
    {
        TimeTravelService::new(self.inner.executions.clone(), self.snapshot_store())
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// Create an execution of an active workflow and start stepping it.
    pub async fn start_execution(
        &self,
        workflow_id: Uuid,
        triggered_by: &str,
        initial_variables: ValueMap,
        options: StartOptions,
    ) -> Result<Uuid, EngineError> {
        let definition = self.inner.load_definition(workflow_id).await?;
        if !definition.is_active() {
            return Err(EngineError::WorkflowInactive(workflow_id));
        }
        if let Some(parent) = options.parent_execution_id {
            self.inner.load_execution(parent).await?;
        }
        let plan = Arc::new(plan_for(&definition)?);
        let fan_out = options
            .max_fan_out
            .unwrap_or(self.inner.config.max_fan_out)
            .max(1);

        let mut execution = Execution::new(
            workflow_id,
            triggered_by,
            options.parent_execution_id,
            plan.len() as u32,
            initial_variables,
        );
        let execution_id = execution.id;
        self.inner.executions.create_execution(&execution).await?;

        {
            let _writer = self.inner.snapshots.lock(execution_id).await?;
            execution.status = ExecutionStatus::Running;
            execution.refresh_progress();
            execution.touch();
            self.inner.executions.update_execution(&execution).await?;
        }

        self.inner.fan_out.insert(execution_id, fan_out);
        self.inner.events.publish(ExecutionEvent::ExecutionStarted {
            execution_id,
            workflow_id,
            total_steps: execution.total_steps,
        });
        tracing::info!(
            execution_id = %execution_id,
            workflow = definition.name.as_str(),
            total_steps = execution.total_steps,
            fan_out,
            "starting execution"
        );

        self.spawn_stepper(execution_id, plan);
        Ok(execution_id)
    }

    /// Resume a paused or failed execution.
    ///
    /// With `resume_from_step_id`, variables are restored from the nearest
    /// checkpoint at or before that step and the cursor moves to the step;
    /// the jump is logged as a `rollback` snapshot. Without it, stepping
    /// continues from the current cursor with the live variables.
    pub async fn resume_execution(
        &self,
        execution_id: Uuid,
        resume_from_step_id: Option<&str>,
    ) -> Result<Execution, EngineError> {
        let execution = self.inner.load_execution(execution_id).await?;
        if !is_resumable(execution.status) {
            return Err(invalid_state(&execution, "resume"));
        }
        let definition = self.inner.load_definition(execution.workflow_id).await?;
        let plan = Arc::new(plan_for(&definition)?);
        let _control = self.control(execution_id).await?;
        self.stop_stepper(execution_id).await?;

        let execution = {
            let mut writer = self.inner.snapshots.lock(execution_id).await?;
            let mut execution = self.inner.load_execution(execution_id).await?;
            if !is_resumable(execution.status) {
                return Err(invalid_state(&execution, "resume"));
            }

            if let Some(step_id) = resume_from_step_id {
                let step_index = plan.index_of(step_id).ok_or_else(|| {
                    EngineError::Validation(format!(
                        "workflow '{}' has no step '{step_id}'",
                        definition.name
                    ))
                })? as u32;
                let checkpoint = self
                    .inner
                    .snapshots
                    .checkpoint_at_or_before(execution_id, step_index)
                    .await?
                    .ok_or(EngineError::CheckpointNotFound {
                        execution_id,
                        step_index,
                    })?;

                let previous_step_index = execution.current_step_index;
                execution.variables = checkpoint.state.clone();
                execution.current_step_index = step_index;
                writer
                    .append(
                        NewSnapshot::new(
                            execution_id,
                            step_index,
                            SnapshotType::Rollback,
                            execution.variables.clone(),
                        )
                        .with_meta("reason", "resume")
                        .with_meta("step_id", step_id)
                        .with_meta("target_step_index", step_index)
                        .with_meta("previous_step_index", previous_step_index)
                        .with_meta("previous_status", execution.status.as_str())
                        .with_meta("checkpoint_snapshot_id", checkpoint.id.to_string())
                        .with_description(format!("resumed from step '{step_id}'")),
                    )
                    .await?;
            }

            execution.status = ExecutionStatus::Running;
            execution.error = None;
            execution.refresh_progress();
            execution.touch();
            self.inner.executions.update_execution(&execution).await?;
            execution
        };

        self.inner.events.publish(ExecutionEvent::ExecutionResumed {
            execution_id,
            step_index: execution.current_step_index,
        });
        tracing::info!(
            execution_id = %execution_id,
            step_index = execution.current_step_index,
            from_step = resume_from_step_id,
            "resumed execution"
        );

        self.spawn_stepper(execution_id, plan);
        Ok(execution)
    }

    /// Stop a running execution after its in-flight attempt is cancelled.
    pub async fn pause_execution(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let execution = self.inner.load_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Running {
            return Err(invalid_state(&execution, "pause"));
        }
        let _control = self.control(execution_id).await?;
        self.stop_stepper(execution_id).await?;

        let execution = {
            let _writer = self.inner.snapshots.lock(execution_id).await?;
            let mut execution = self.inner.load_execution(execution_id).await?;
            // The stepper may have finished the workflow before it saw the cancel.
            if execution.status != ExecutionStatus::Running {
                return Err(invalid_state(&execution, "pause"));
            }
            execution.status = ExecutionStatus::Paused;
            execution.touch();
            self.inner.executions.update_execution(&execution).await?;
            execution
        };

        self.inner.events.publish(ExecutionEvent::ExecutionPaused {
            execution_id,
            step_index: execution.current_step_index,
        });
        tracing::info!(
            execution_id = %execution_id,
            step_index = execution.current_step_index,
            "paused execution"
        );
        Ok(execution)
    }

    /// Roll back to the most recent checkpoint recorded at `checkpoint_index`.
    pub async fn rollback_to_checkpoint(
        &self,
        execution_id: Uuid,
        checkpoint_index: u32,
    ) -> Result<Execution, EngineError> {
        let execution = self.inner.load_execution(execution_id).await?;
        let checkpoint = self
            .inner
            .snapshots
            .checkpoint_at(execution_id, checkpoint_index)
            .await?
            .ok_or(EngineError::CheckpointNotFound {
                execution_id,
                step_index: checkpoint_index,
            })?;
        self.rollback_to(execution, checkpoint).await
    }

    /// Roll back to a specific checkpoint snapshot.
    pub async fn rollback_to_snapshot(
        &self,
        execution_id: Uuid,
        snapshot_id: Uuid,
    ) -> Result<Execution, EngineError> {
        let execution = self.inner.load_execution(execution_id).await?;
        let snapshot = match self.inner.snapshots.get_snapshot(snapshot_id).await {
            Ok(s) if s.execution_id == execution_id => s,
            Ok(_) | Err(SnapshotError::SnapshotNotFound(_)) => {
                return Err(EngineError::SnapshotNotFound(snapshot_id));
            }
            Err(e) => return Err(e.into()),
        };
        if !snapshot.is_checkpoint {
            return Err(EngineError::CheckpointNotFound {
                execution_id,
                step_index: snapshot.step_index,
            });
        }
        self.rollback_to(execution, snapshot).await
    }

    async fn rollback_to(
        &self,
        execution: Execution,
        checkpoint: ExecutionSnapshot,
    ) -> Result<Execution, EngineError> {
        let execution_id = execution.id;
        if !execution.status.can_transition_to(ExecutionStatus::RolledBack) {
            return Err(invalid_state(&execution, "roll back"));
        }
        let definition = self.inner.load_definition(execution.workflow_id).await?;
        let plan = Arc::new(plan_for(&definition)?);
        let _control = self.control(execution_id).await?;
        self.stop_stepper(execution_id).await?;

        let (execution, previous_step_index) = {
            let mut writer = self.inner.snapshots.lock(execution_id).await?;
            let mut execution = self.inner.load_execution(execution_id).await?;
            if !execution.status.can_transition_to(ExecutionStatus::RolledBack) {
                return Err(invalid_state(&execution, "roll back"));
            }
            let previous_status = execution.status;
            let previous_step_index = execution.current_step_index;

            execution.status = ExecutionStatus::RolledBack;
            execution.touch();
            self.inner.executions.update_execution(&execution).await?;

            execution.variables = checkpoint.state.clone();
            execution.current_step_index = checkpoint.step_index;
            execution.error = None;
            execution.completed_at = None;
            writer
                .append(
                    NewSnapshot::new(
                        execution_id,
                        checkpoint.step_index,
                        SnapshotType::Rollback,
                        execution.variables.clone(),
                    )
                    .with_meta("reason", "rollback")
                    .with_meta("target_step_index", checkpoint.step_index)
                    .with_meta("previous_step_index", previous_step_index)
                    .with_meta("previous_status", previous_status.as_str())
                    .with_meta("checkpoint_snapshot_id", checkpoint.id.to_string())
                    .with_description(format!(
                        "rolled back to checkpoint at step {}",
                        checkpoint.step_index
                    )),
                )
                .await?;

            execution.status = ExecutionStatus::Running;
            execution.refresh_progress();
            execution.touch();
            self.inner.executions.update_execution(&execution).await?;
            (execution, previous_step_index)
        };

        self.inner.events.publish(ExecutionEvent::ExecutionRolledBack {
            execution_id,
            from_step_index: previous_step_index,
            to_step_index: execution.current_step_index,
        });
        tracing::info!(
            execution_id = %execution_id,
            from_step_index = previous_step_index,
            to_step_index = execution.current_step_index,
            "rolled back execution"
        );

        self.spawn_stepper(execution_id, plan);
        Ok(execution)
    }

    // -----------------------------------------------------------------------
    // Reads and manual snapshots
    // -----------------------------------------------------------------------

    pub async fn get_progress(&self, execution_id: Uuid) -> Result<ExecutionProgress, EngineError> {
        Ok(self.inner.load_execution(execution_id).await?.progress_report())
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.inner.load_execution(execution_id).await
    }

    /// Executions matching `filter`, newest first.
    pub async fn get_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<Execution>, EngineError> {
        if filter.limit == 0 {
            return Ok(vec![]);
        }
        Ok(self.inner.executions.list_executions(filter).await?)
    }

    /// Append a snapshot on behalf of a caller. The execution must exist.
    pub async fn create_snapshot(
        &self,
        snapshot: NewSnapshot,
    ) -> Result<ExecutionSnapshot, EngineError> {
        let execution_id = snapshot.execution_id;
        self.inner.load_execution(execution_id).await?;
        let created = self.inner.snapshots.create_snapshot(snapshot).await;
        if !self.inner.steppers.contains_key(&execution_id) {
            self.inner.snapshots.release(execution_id);
        }
        Ok(created?)
    }

    /// Wait until the execution's current stepper, if any, has stopped.
    pub async fn wait_for_idle(&self, execution_id: Uuid) {
        let done = self
            .inner
            .steppers
            .get(&execution_id)
            .map(|h| h.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    // -----------------------------------------------------------------------
    // Stepper management
    // -----------------------------------------------------------------------

    /// Take the execution's control lock.
    async fn control(&self, execution_id: Uuid) -> Result<ControlGuard<'_, S>, EngineError> {
        let guard = self
            .inner
            .controls
            .acquire(execution_id)
            .await
            .map_err(|e| EngineError::ConcurrencyConflict(e.to_string()))?;
        Ok(ControlGuard {
            guard: Some(guard),
            controls: &self.inner.controls,
            snapshots: self.inner.snapshots.as_ref(),
            execution_id,
        })
    }

    /// Register and start a stepper. Callers other than `start_execution`
    /// hold the control lock.
    fn spawn_stepper(&self, execution_id: Uuid, plan: Arc<ExecutionPlan>) {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        self.inner.steppers.insert(
            execution_id,
            StepperHandle {
                generation,
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = Arc::clone(&inner).drive(execution_id, plan, cancel).await {
                tracing::error!(execution_id = %execution_id, error = %e, "stepper stopped with error");
                if let Err(e) = inner.fail_execution(execution_id, &e.to_string()).await {
                    tracing::error!(
                        execution_id = %execution_id,
                        error = %e,
                        "could not mark execution failed"
                    );
                }
            }
            // Released before the handle goes, so an idle execution holds no slot.
            inner.snapshots.release(execution_id);
            inner
                .steppers
                .remove_if(&execution_id, |_, h| h.generation == generation);
            let _ = done_tx.send(true);
        });
    }

    /// Cancel the execution's stepper and wait for it to stop.
    async fn stop_stepper(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let handle = self
            .inner
            .steppers
            .get(&execution_id)
            .map(|h| (h.cancel.clone(), h.done.clone()));
        let Some((cancel, mut done)) = handle else {
            return Ok(());
        };

        cancel.cancel();
        let limit = Duration::from_millis(self.inner.config.stepper_stop_timeout_ms);
        tokio::time::timeout(limit, async move {
            let _ = done.wait_for(|finished| *finished).await;
        })
        .await
        .map_err(|_| {
            EngineError::ConcurrencyConflict(format!(
                "stepper for execution {execution_id} did not stop within {}ms",
                limit.as_millis()
            ))
        })
    }
}

fn is_resumable(status: ExecutionStatus) -> bool {
    matches!(status, ExecutionStatus::Paused | ExecutionStatus::Failed)
}

fn plan_for(definition: &WorkflowDefinition) -> Result<ExecutionPlan, EngineError> {
    validate_definition(definition)?;
    Ok(ExecutionPlan::build(definition)?)
}

// ---------------------------------------------------------------------------
// Stepper internals
// ---------------------------------------------------------------------------

impl<W, E, S> EngineInner<W, E, S>
where
    W: WorkflowDefinitionStore + 'static,
    E: ExecutionRepository + 'static,
    S: SnapshotRepository + 'static,
{
    async fn load_execution(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.executions
            .get_execution(&execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    async fn load_definition(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, EngineError> {
        self.workflows
            .get_definition(&workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))
    }

    fn fan_out_for(&self, execution_id: Uuid) -> usize {
        self.fan_out
            .get(&execution_id)
            .map(|f| *f)
            .unwrap_or(self.config.max_fan_out)
            .max(1)
    }

    async fn append(&self, snapshot: NewSnapshot) -> Result<ExecutionSnapshot, EngineError> {
        let mut writer = self.snapshots.lock(snapshot.execution_id).await?;
        Ok(writer.append(snapshot).await?)
    }

    /// Stepper main loop. Returns when the execution completes, fails, or
    /// leaves `running`.
    async fn drive(
        self: Arc<Self>,
        execution_id: Uuid,
        plan: Arc<ExecutionPlan>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let fan_out = self.fan_out_for(execution_id);
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let execution = self.load_execution(execution_id).await?;
            if execution.status != ExecutionStatus::Running {
                return Ok(());
            }

            let index = execution.current_step_index as usize;
            let Some(wave) = plan.wave_containing(index) else {
                self.finish_execution(execution_id).await?;
                return Ok(());
            };

            let result = if fan_out > 1 && wave.end - index > 1 {
                self.run_wave(execution_id, &plan, index..wave.end, execution.variables, fan_out, &cancel)
                    .await?
            } else {
                match plan.step(index) {
                    Some(step) => {
                        let slot = StepSlot {
                            plan_index: index as u32,
                            snapshot_index: index as u32,
                        };
                        self.execute_step(execution_id, step, slot, &execution.variables, &cancel, true)
                            .await?
                    }
                    None => StepResult::Completed,
                }
            };

            match result {
                StepResult::Completed => {}
                StepResult::Failed(message) => {
                    self.fail_execution(execution_id, &message).await?;
                    return Ok(());
                }
                StepResult::Cancelled => {
                    tracing::debug!(execution_id = %execution_id, "stepper cancelled");
                    return Ok(());
                }
            }
        }
    }

    /// Run `range` of a wave concurrently, bounded by `fan_out`.
    ///
    /// The cursor only moves past the wave when every branch succeeded, so a
    /// partial failure re-runs the whole wave on resume.
    async fn run_wave(
        self: &Arc<Self>,
        execution_id: Uuid,
        plan: &ExecutionPlan,
        range: Range<usize>,
        variables: ValueMap,
        fan_out: usize,
        cancel: &CancellationToken,
    ) -> Result<StepResult, EngineError> {
        tracing::debug!(
            execution_id = %execution_id,
            wave_start = range.start,
            steps = range.len(),
            fan_out,
            "running wave concurrently"
        );

        let semaphore = Arc::new(Semaphore::new(fan_out));
        let variables = Arc::new(variables);
        let snapshot_index = range.start as u32;
        let mut join_set = JoinSet::new();

        for plan_index in range.clone() {
            let Some(step) = plan.step(plan_index).cloned() else {
                continue;
            };
            let inner = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let variables = Arc::clone(&variables);
            let cancel = cancel.clone();
            let slot = StepSlot {
                plan_index: plan_index as u32,
                snapshot_index,
            };

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (plan_index, Ok(StepResult::Cancelled));
                };
                if cancel.is_cancelled() {
                    return (plan_index, Ok(StepResult::Cancelled));
                }
                let result = inner
                    .execute_step(execution_id, &step, slot, &variables, &cancel, false)
                    .await;
                (plan_index, result)
            });
        }

        let mut results = Vec::with_capacity(range.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => results.push((
                    usize::MAX,
                    Err(EngineError::StepExecution(format!("step task failed: {e}"))),
                )),
            }
        }
        results.sort_by_key(|(plan_index, _)| *plan_index);

        let mut failure = None;
        let mut cancelled = false;
        for (_, result) in results {
            match result? {
                StepResult::Completed => {}
                StepResult::Failed(message) => {
                    failure.get_or_insert(message);
                }
                StepResult::Cancelled => cancelled = true,
            }
        }

        if cancelled {
            return Ok(StepResult::Cancelled);
        }
        if let Some(message) = failure {
            return Ok(StepResult::Failed(message));
        }
        self.advance(execution_id, range.end as u32).await?;
        Ok(StepResult::Completed)
    }

    /// Run one step to success or exhaustion and record the result.
    async fn execute_step(
        &self,
        execution_id: Uuid,
        step: &StepDefinition,
        slot: StepSlot,
        variables: &ValueMap,
        cancel: &CancellationToken,
        advance: bool,
    ) -> Result<StepResult, EngineError> {
        match self.run_attempts(execution_id, step, slot, variables, cancel).await? {
            StepRun::Succeeded {
                updates,
                duration_ms,
            } => {
                self.complete_step(execution_id, step, slot, updates, advance)
                    .await?;
                self.events.publish(ExecutionEvent::StepCompleted {
                    execution_id,
                    step_id: step.id.clone(),
                    step_index: slot.plan_index,
                    duration_ms,
                });
                tracing::info!(
                    execution_id = %execution_id,
                    step_id = step.id.as_str(),
                    step_index = slot.plan_index,
                    duration_ms,
                    "step completed"
                );
                Ok(StepResult::Completed)
            }
            StepRun::Failed(message) => Ok(StepResult::Failed(format!(
                "step '{}' failed: {message}",
                step.id
            ))),
            StepRun::Cancelled => Ok(StepResult::Cancelled),
        }
    }

    /// The attempt loop: one `step_start` per attempt, one `error` per failed
    /// attempt, bounded backoff between attempts.
    async fn run_attempts(
        &self,
        execution_id: Uuid,
        step: &StepDefinition,
        slot: StepSlot,
        variables: &ValueMap,
        cancel: &CancellationToken,
    ) -> Result<StepRun, EngineError> {
        let mut tracker = RetryTracker::new(step.retry.as_ref());
        loop {
            let attempt = tracker.begin_attempt();
            self.append(
                step_snapshot(execution_id, step, slot, SnapshotType::StepStart, variables.clone())
                    .with_meta("attempt", attempt),
            )
            .await?;
            self.events.publish(ExecutionEvent::StepStarted {
                execution_id,
                step_id: step.id.clone(),
                step_index: slot.plan_index,
                attempt,
            });
            tracing::debug!(
                execution_id = %execution_id,
                step_id = step.id.as_str(),
                attempt,
                "step attempt started"
            );

            let started = Instant::now();
            let result = match resolve_input(&step.input, variables) {
                Ok(input) => {
                    let invocation = StepInvocation {
                        execution_id,
                        step: step.clone(),
                        step_index: slot.plan_index,
                        attempt,
                        input,
                        variables: variables.clone(),
                        cancel: cancel.clone(),
                    };
                    self.steps.run_attempt(&invocation).await
                }
                Err(failure) => AttemptResult::Failed(failure),
            };

            let result = match result {
                AttemptResult::Succeeded(outcome) => match first_non_finite(&outcome.updates) {
                    Some(key) => AttemptResult::Failed(StepFailure::fatal(format!(
                        "output '{key}' is not a finite number"
                    ))),
                    None => AttemptResult::Succeeded(outcome),
                },
                other => other,
            };
            let failure = match result {
                AttemptResult::Succeeded(outcome) => {
                    tracker.record_success();
                    return Ok(StepRun::Succeeded {
                        updates: outcome.updates,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                AttemptResult::Cancelled => return Ok(StepRun::Cancelled),
                AttemptResult::Failed(failure) => failure,
            };

            let decision = tracker.record_failure(failure.retryable);
            let will_retry = matches!(decision, RetryDecision::Retry { .. });
            self.append(
                step_snapshot(execution_id, step, slot, SnapshotType::Error, variables.clone())
                    .with_meta("attempt", attempt)
                    .with_meta("error", failure.message.as_str())
                    .with_meta("final", !will_retry),
            )
            .await?;
            self.events.publish(ExecutionEvent::StepFailed {
                execution_id,
                step_id: step.id.clone(),
                step_index: slot.plan_index,
                error: failure.message.clone(),
                will_retry,
            });
            tracing::warn!(
                execution_id = %execution_id,
                step_id = step.id.as_str(),
                attempt,
                will_retry,
                error = %failure.message,
                "step attempt failed"
            );

            match decision {
                RetryDecision::Retry { delay } => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(StepRun::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => return Ok(StepRun::Failed(failure.message)),
            }
        }
    }

    /// Merge a successful step's updates and write its `step_end` (and
    /// `checkpoint`) under the execution lock.
    async fn complete_step(
        &self,
        execution_id: Uuid,
        step: &StepDefinition,
        slot: StepSlot,
        updates: ValueMap,
        advance: bool,
    ) -> Result<(), EngineError> {
        let mut writer = self.snapshots.lock(execution_id).await?;
        let mut execution = self.load_execution(execution_id).await?;
        execution.variables.extend(updates);

        writer
            .append(step_snapshot(
                execution_id,
                step,
                slot,
                SnapshotType::StepEnd,
                execution.variables.clone(),
            ))
            .await?;
        if step.checkpoint && !self.segment_has_checkpoint(execution_id, step, slot).await? {
            writer
                .append(
                    step_snapshot(
                        execution_id,
                        step,
                        slot,
                        SnapshotType::Checkpoint,
                        execution.variables.clone(),
                    )
                    .with_description(format!("after step '{}'", step.id)),
                )
                .await?;
        }

        if advance {
            execution.current_step_index = slot.plan_index + 1;
            execution.refresh_progress();
        }
        execution.touch();
        self.executions.update_execution(&execution).await?;
        Ok(())
    }

    async fn segment_has_checkpoint(
        &self,
        execution_id: Uuid,
        step: &StepDefinition,
        slot: StepSlot,
    ) -> Result<bool, EngineError> {
        let log = self.snapshots.get_snapshot_log(execution_id).await?;
        Ok(segment_has_checkpoint(&log, slot.snapshot_index, &step.id))
    }

    async fn advance(&self, execution_id: Uuid, next_index: u32) -> Result<(), EngineError> {
        let _writer = self.snapshots.lock(execution_id).await?;
        let mut execution = self.load_execution(execution_id).await?;
        execution.current_step_index = next_index;
        execution.refresh_progress();
        execution.touch();
        self.executions.update_execution(&execution).await?;
        Ok(())
    }

    async fn finish_execution(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let _writer = self.snapshots.lock(execution_id).await?;
        let mut execution = self.load_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Running {
            return Ok(());
        }
        execution.status = ExecutionStatus::Completed;
        execution.current_step_index = execution.total_steps;
        execution.completed_at = Some(Utc::now());
        execution.refresh_progress();
        execution.touch();
        self.executions.update_execution(&execution).await?;
        // A rollback of a completed execution runs at the configured bound.
        self.fan_out.remove(&execution_id);

        self.events
            .publish(ExecutionEvent::ExecutionCompleted { execution_id });
        tracing::info!(execution_id = %execution_id, "execution completed");
        Ok(())
    }

    async fn fail_execution(&self, execution_id: Uuid, message: &str) -> Result<(), EngineError> {
        let _writer = self.snapshots.lock(execution_id).await?;
        let mut execution = self.load_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Running {
            return Ok(());
        }
        execution.status = ExecutionStatus::Failed;
        execution.error = Some(message.to_string());
        execution.touch();
        self.executions.update_execution(&execution).await?;

        self.events.publish(ExecutionEvent::ExecutionFailed {
            execution_id,
            error: message.to_string(),
        });
        tracing::warn!(execution_id = %execution_id, error = message, "execution failed");
        Ok(())
    }
}

/// Whether the current rollback segment already has a checkpoint for this
/// step: one recorded since the last `rollback` snapshot, or the one that
/// rollback restored. A step re-entered after a rollback to its own
/// checkpoint, or re-run with its wave, records no second checkpoint.
fn segment_has_checkpoint(log: &[ExecutionSnapshot], step_index: u32, step_id: &str) -> bool {
    let is_match = |s: &ExecutionSnapshot| {
        s.snapshot_type == SnapshotType::Checkpoint
            && s.step_index == step_index
            && s.step_id() == Some(step_id)
    };
    for snapshot in log.iter().rev() {
        if snapshot.snapshot_type == SnapshotType::Rollback {
            let restored = snapshot
                .metadata
                .get("checkpoint_snapshot_id")
                .and_then(|v| v.as_str());
            return restored
                .is_some_and(|id| log.iter().any(|c| c.id.to_string() == id && is_match(c)));
        }
        if is_match(snapshot) {
            return true;
        }
    }
    false
}

fn step_snapshot(
    execution_id: Uuid,
    step: &StepDefinition,
    slot: StepSlot,
    snapshot_type: SnapshotType,
    state: ValueMap,
) -> NewSnapshot {
    let snapshot = NewSnapshot::new(execution_id, slot.snapshot_index, snapshot_type, state)
        .with_meta("step_id", step.id.as_str());
    if slot.plan_index != slot.snapshot_index {
        snapshot.with_meta("plan_index", slot.plan_index)
    } else {
        snapshot
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
