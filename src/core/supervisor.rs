//! Execution supervisor: claims tasks, drives backend calls, and owns the
//! map of in-flight executions used for cancellation and abandonment checks.
//!
//! Invariants:
//! - A task's cancellation token is registered before its claim is written,
//!   so a `processing` row never exists without an entry while its worker is
//!   alive.
//! - No lock is held across the backend call.
//! - Result and terminal status are written in one row update, guarded by
//!   the row still being in an executing state. Anything else is a late
//!   result and is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::audit::{AuditAction, AuditTrail};
use crate::core::billing::BillingGuard;
use crate::core::error::{EngineError, EngineResult};
use crate::core::executor::{GenerationBackend, GenerationRequest, GenerationResponse, ProgressReporter};
use crate::core::store::{publish_snapshot, DurableStore, FastCache, UpdateOutcome};
use crate::core::task::{Task, TaskId, TaskOutput, TaskStatus};
use crate::util::clock::now;

/// View of in-flight executions used by the reconciler.
pub trait ActiveExecutions: Send + Sync {
    /// Whether an execution for `task_id` is running in this process.
    fn is_active(&self, task_id: &TaskId) -> bool;

    /// Signal the execution for `task_id` to stop. Returns whether one existed.
    fn abort(&self, task_id: &TaskId) -> bool;
}

enum Outcome {
    Finished(GenerationResponse),
    Cancelled,
    TimedOut,
}

/// Dispatches tasks to the generation backend and tracks their executions.
pub struct ExecutionSupervisor {
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn FastCache>,
    backend: Arc<dyn GenerationBackend>,
    billing: Arc<BillingGuard>,
    audit: AuditTrail,
    execution_timeout: Duration,
    active: Mutex<HashMap<TaskId, CancellationToken>>,
}

impl ExecutionSupervisor {
    /// Create a supervisor.
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn FastCache>,
        backend: Arc<dyn GenerationBackend>,
        billing: Arc<BillingGuard>,
        audit: AuditTrail,
        execution_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            backend,
            billing,
            audit,
            execution_timeout,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Number of executions in flight.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Claim `task_id` (pending to processing) and run it to a terminal state.
    ///
    /// Returns [`EngineError::ConcurrencyConflict`] if the task was no longer
    /// pending when the claim was attempted.
    pub async fn dispatch(&self, task_id: &TaskId, at: DateTime<Utc>) -> EngineResult<TaskStatus> {
        let token = CancellationToken::new();
        {
            let mut active = self.active.lock();
            if active.contains_key(task_id) {
                return Err(EngineError::ConcurrencyConflict(task_id.clone()));
            }
            active.insert(task_id.clone(), token.clone());
        }

        let claimed = self.store.update(task_id, &mut |t| {
            if t.status != TaskStatus::Pending {
                return false;
            }
            t.status = TaskStatus::Processing;
            t.started_at = Some(at);
            t.updated_at = at;
            t.queue_position = Some(0);
            t.progress = 0.0;
            true
        });
        let task = match claimed {
            Ok(UpdateOutcome::Updated(task)) => task,
            Ok(UpdateOutcome::Unchanged(_)) => {
                self.active.lock().remove(task_id);
                tracing::debug!(task_id = %task_id, "claim lost to another writer");
                return Err(EngineError::ConcurrencyConflict(task_id.clone()));
            }
            Err(e) => {
                self.active.lock().remove(task_id);
                return Err(e);
            }
        };

        self.write_cache(&task);
        self.audit.record(task_id, &task.owner, AuditAction::Started, None);
        tracing::info!(task_id = %task_id, owner = %task.owner, task_type = %task.task_type, "task started");

        let result = self.execute(task, token).await;
        self.active.lock().remove(task_id);
        result
    }

    /// Cancel `task_id`.
    ///
    /// The terminal status is written first, then any live execution is
    /// signalled. Cancelling an already-cancelled task succeeds; a completed
    /// one is refused.
    pub fn cancel(&self, task_id: &TaskId, at: DateTime<Utc>) -> EngineResult<TaskStatus> {
        let outcome = self.store.update(task_id, &mut |t| {
            if !matches!(t.status, TaskStatus::Pending | TaskStatus::Processing) {
                return false;
            }
            t.error_message = Some("cancelled by owner".into());
            t.finish(TaskStatus::Cancelled, at);
            true
        })?;

        let task = match outcome {
            UpdateOutcome::Updated(task) => task,
            UpdateOutcome::Unchanged(task) => {
                return match task.status {
                    TaskStatus::Cancelled => Ok(TaskStatus::Cancelled),
                    TaskStatus::Completed | TaskStatus::ProcessingCompleted => {
                        Err(EngineError::AlreadyCompleted(task_id.clone()))
                    }
                    from => Err(EngineError::InvalidTransition {
                        from,
                        to: TaskStatus::Cancelled,
                    }),
                };
            }
        };

        let signalled = self.abort(task_id);
        self.write_cache(&task);
        self.audit.record(task_id, &task.owner, AuditAction::Cancelled, None);
        tracing::info!(task_id = %task_id, signalled, "task cancelled");
        Ok(TaskStatus::Cancelled)
    }

    /// Cancel `task_id` only if it is still waiting for a worker. Returns
    /// whether this call cancelled it; a task claimed in the meantime is
    /// left to finish.
    pub fn cancel_pending(&self, task_id: &TaskId, at: DateTime<Utc>, reason: &str) -> EngineResult<bool> {
        let outcome = self.store.update(task_id, &mut |t| {
            if t.status != TaskStatus::Pending {
                return false;
            }
            t.error_message = Some(reason.to_owned());
            t.finish(TaskStatus::Cancelled, at);
            true
        })?;
        let UpdateOutcome::Updated(task) = outcome else {
            return Ok(false);
        };
        self.write_cache(&task);
        self.audit
            .record(task_id, &task.owner, AuditAction::Cancelled, Some(reason.to_owned()));
        tracing::info!(task_id = %task_id, reason, "pending task cancelled");
        Ok(true)
    }

    /// Signal every in-flight execution to stop. Their rows stay
    /// `processing` and are requeued by startup recovery.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.active.lock().drain().collect();
        for (task_id, token) in drained {
            tracing::debug!(task_id = %task_id, "aborting execution for shutdown");
            token.cancel();
        }
    }

    async fn execute(&self, task: Task, token: CancellationToken) -> EngineResult<TaskStatus> {
        let request = GenerationRequest {
            task_id: task.task_id.clone(),
            task_type: task.task_type,
            input: task.input_data.clone(),
            progress: ProgressReporter::new(
                task.task_id.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.cache),
            ),
        };
        let started = Instant::now();
        let call = self.backend.generate(request, token.clone());

        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => Outcome::Cancelled,
            () = tokio::time::sleep(self.execution_timeout) => Outcome::TimedOut,
            response = call => Outcome::Finished(response),
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Outcome::Finished(response) => self.record_result(&task, response, elapsed_ms),
            Outcome::Cancelled => {
                let status = self
                    .store
                    .get(&task.task_id)?
                    .map_or(TaskStatus::Cancelled, |t| t.status);
                tracing::debug!(task_id = %task.task_id, status = %status, "execution abandoned after signal");
                Ok(status)
            }
            Outcome::TimedOut => {
                token.cancel();
                self.record_timeout(&task, elapsed_ms)
            }
        }
    }

    fn record_result(&self, task: &Task, response: GenerationResponse, elapsed_ms: u64) -> EngineResult<TaskStatus> {
        let (status, output, error) = if response.success && response.image_urls.iter().any(|u| !u.is_empty()) {
            (TaskStatus::Completed, Some(TaskOutput::new(response.image_urls)), None)
        } else if response.success {
            (TaskStatus::Failed, None, Some("backend returned no artifacts".to_owned()))
        } else {
            let reason = response.error.unwrap_or_else(|| "unknown backend error".to_owned());
            (
                TaskStatus::Failed,
                None,
                Some(EngineError::BackendInvocationFailed(reason).to_string()),
            )
        };

        let at = now();
        let outcome = self.store.update(&task.task_id, &mut |t| {
            if !t.status.can_transition_to(status) || !t.status.is_executing() {
                return false;
            }
            t.output_data.clone_from(&output);
            t.error_message.clone_from(&error);
            t.processing_time_ms = Some(elapsed_ms);
            t.finish(status, at);
            true
        })?;

        let written = match outcome {
            UpdateOutcome::Updated(written) => written,
            UpdateOutcome::Unchanged(current) => {
                tracing::warn!(
                    task_id = %task.task_id,
                    status = %current.status,
                    "late result discarded"
                );
                self.audit.record(
                    &task.task_id,
                    &task.owner,
                    AuditAction::Discarded,
                    Some(format!("result arrived while {}", current.status)),
                );
                return Ok(current.status);
            }
        };

        self.write_cache(&written);
        if status == TaskStatus::Completed {
            self.audit.record(&task.task_id, &task.owner, AuditAction::Completed, None);
            tracing::info!(task_id = %task.task_id, elapsed_ms, "task completed");
            if let Err(e) = self.billing.settle(&task.task_id) {
                tracing::warn!(task_id = %task.task_id, error = %e, "billing deferred to sweep");
            }
        } else {
            self.audit.record(&task.task_id, &task.owner, AuditAction::Failed, error.clone());
            tracing::warn!(task_id = %task.task_id, error = ?error, "task failed");
        }
        Ok(status)
    }

    fn record_timeout(&self, task: &Task, elapsed_ms: u64) -> EngineResult<TaskStatus> {
        let at = now();
        let message = EngineError::Timeout(task.task_id.clone()).to_string();
        let outcome = self.store.update(&task.task_id, &mut |t| {
            if t.status != TaskStatus::Processing {
                return false;
            }
            t.error_message = Some(format!(
                "{message}: execution exceeded {}s",
                self.execution_timeout.as_secs()
            ));
            t.processing_time_ms = Some(elapsed_ms);
            t.finish(TaskStatus::StuckTimeout, at);
            true
        })?;
        let updated = outcome.is_updated();
        let current = outcome.into_task();
        if updated {
            self.write_cache(&current);
            self.audit.record(&task.task_id, &task.owner, AuditAction::TimedOut, current.error_message.clone());
            tracing::warn!(task_id = %task.task_id, elapsed_ms, "execution timed out");
        }
        Ok(current.status)
    }

    fn write_cache(&self, task: &Task) {
        if let Err(e) = publish_snapshot(self.store.as_ref(), self.cache.as_ref(), &task.task_id) {
            tracing::warn!(task_id = %task.task_id, error = %e, "cache write failed; reconciler will repair");
        }
    }
}

impl ActiveExecutions for ExecutionSupervisor {
    fn is_active(&self, task_id: &TaskId) -> bool {
        self.active.lock().contains_key(task_id)
    }

    fn abort(&self, task_id: &TaskId) -> bool {
        let token = self.active.lock().remove(task_id);
        token.is_some_and(|token| {
            token.cancel();
            true
        })
    }
}
