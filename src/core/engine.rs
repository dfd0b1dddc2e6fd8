//! The task engine: one explicitly constructed service owning admission,
//! queueing, execution, reconciliation, retry and billing.
//!
//! All public operations take `now` explicitly (except the worker path,
//! which reads the clock), so callers and tests control time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::admission::AdmissionController;
use crate::core::audit::{AuditAction, AuditTrail};
use crate::core::billing::{BillingGuard, PointsLedger};
use crate::core::error::{EngineError, EngineResult};
use crate::core::executor::GenerationBackend;
use crate::core::queue::{PriorityQueueManager, QueueStats, RecomputeReport};
use crate::core::reconciler::{RepairKind, StatusReconciler, SweepMode, SweepReport};
use crate::core::retry::build_retry;
use crate::core::store::{publish_snapshot, DurableStore, FastCache, UpdateOutcome};
use crate::core::supervisor::{ActiveExecutions, ExecutionSupervisor};
use crate::core::task::{OwnerId, Priority, Task, TaskId, TaskStatus, TaskType};
use crate::util::clock;

/// A new generation request.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Submitting user.
    pub owner: OwnerId,
    /// Quota tier of the owner.
    pub tier: Option<String>,
    /// Generation kind.
    pub task_type: TaskType,
    /// Scheduling tier.
    pub priority: Priority,
    /// Backend payload.
    pub input: serde_json::Value,
    /// Conversation linkage.
    pub session_id: Option<String>,
}

impl Submission {
    /// Medium-priority submission without tier or session.
    pub fn new(owner: impl Into<OwnerId>, task_type: TaskType, input: serde_json::Value) -> Self {
        Self {
            owner: owner.into(),
            tier: None,
            task_type,
            priority: Priority::Medium,
            input,
            session_id: None,
        }
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the quota tier.
    #[must_use]
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }
}

/// GPU task engine.
pub struct TaskEngine {
    config: EngineConfig,
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn FastCache>,
    admission: AdmissionController,
    queue: PriorityQueueManager,
    supervisor: Arc<ExecutionSupervisor>,
    reconciler: StatusReconciler,
    audit: AuditTrail,
    work_ready: Notify,
    paused: AtomicBool,
    shutdown: CancellationToken,
}

impl TaskEngine {
    /// Wire an engine from its collaborators.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn FastCache>,
        backend: Arc<dyn GenerationBackend>,
        ledger: Arc<dyn PointsLedger>,
        audit: AuditTrail,
    ) -> EngineResult<Self> {
        config.validate().map_err(EngineError::Config)?;

        let billing = Arc::new(
            BillingGuard::new(Arc::clone(&store), ledger, config.billing.clone()).with_audit(audit.clone()),
        );
        let supervisor = Arc::new(ExecutionSupervisor::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            backend,
            Arc::clone(&billing),
            audit.clone(),
            config.worker.execution_timeout(),
        ));
        let active: Arc<dyn ActiveExecutions> = supervisor.clone();
        let reconciler = StatusReconciler::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            active,
            billing,
            audit.clone(),
            &config.reconciler,
        );

        Ok(Self {
            admission: AdmissionController::new(Arc::clone(&store), config.admission.clone()),
            queue: PriorityQueueManager::new(Arc::clone(&store), Arc::clone(&cache), config.queue.aging()),
            supervisor,
            reconciler,
            audit,
            store,
            cache,
            config,
            work_ready: Notify::new(),
            paused: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Active configuration.
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Durable store handle.
    pub const fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Cache handle.
    pub const fn cache(&self) -> &Arc<dyn FastCache> {
        &self.cache
    }

    /// Queue manager.
    pub const fn queue(&self) -> &PriorityQueueManager {
        &self.queue
    }

    /// Reconciler.
    pub const fn reconciler(&self) -> &StatusReconciler {
        &self.reconciler
    }

    /// Execution supervisor.
    pub const fn supervisor(&self) -> &Arc<ExecutionSupervisor> {
        &self.supervisor
    }

    /// Token cancelled when the engine shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Admit a new task as pending.
    pub fn submit(&self, submission: Submission, now: DateTime<Utc>) -> EngineResult<Task> {
        let task = Task::new(
            submission.owner,
            submission.task_type,
            submission.priority,
            submission.input,
            now,
        )
        .with_session(submission.session_id);
        self.admit_and_enqueue(task, submission.tier.as_deref(), now)
    }

    /// Current state of a task, repairing it inline if its two views
    /// disagree or it looks stuck.
    pub fn poll(&self, task_id: &TaskId, now: DateTime<Utc>) -> EngineResult<Task> {
        let before = self
            .store
            .get(task_id)?
            .ok_or_else(|| EngineError::NotFound(task_id.clone()))?;

        match self.reconciler.reconcile_task(task_id, now, SweepMode::Apply) {
            Ok(Some(kind)) => {
                tracing::debug!(task_id = %task_id, repair = ?kind, "inline repair on poll");
                self.refresh_positions(now);
                if kind == RepairKind::ResetAbandoned {
                    self.work_ready.notify_one();
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(task_id = %task_id, error = %e, "inline repair failed"),
        }

        Ok(self.store.get(task_id)?.unwrap_or(before))
    }

    /// Cancel a task.
    pub fn cancel(&self, task_id: &TaskId, now: DateTime<Utc>) -> EngineResult<TaskStatus> {
        let status = self.supervisor.cancel(task_id, now)?;
        self.refresh_positions(now);
        Ok(status)
    }

    /// Resubmit a terminal task as a new task. The original is not modified.
    pub fn retry(&self, task_id: &TaskId, tier: Option<&str>, now: DateTime<Utc>) -> EngineResult<Task> {
        let original = self
            .store
            .get(task_id)?
            .ok_or_else(|| EngineError::NotFound(task_id.clone()))?;
        let retry = build_retry(&original, now)?;
        let admitted = self.admit_and_enqueue(retry, tier, now)?;
        self.audit.record(
            task_id,
            &original.owner,
            AuditAction::Retried,
            Some(format!("retried as {}", admitted.task_id)),
        );
        tracing::info!(task_id = %task_id, retry_id = %admitted.task_id, "task retried");
        Ok(admitted)
    }

    /// Claim and execute the head of the pending queue.
    ///
    /// Returns `None` when nothing is pending, the queue is paused or the
    /// engine is shutting down.
    pub async fn run_next(&self) -> EngineResult<Option<(TaskId, TaskStatus)>> {
        loop {
            if self.shutdown.is_cancelled() || self.is_paused() {
                return Ok(None);
            }
            let now = clock::now();
            let Some(task) = self.queue.next_pending(now)? else {
                return Ok(None);
            };
            match self.supervisor.dispatch(&task.task_id, now).await {
                Ok(status) => {
                    self.refresh_positions(clock::now());
                    return Ok(Some((task.task_id, status)));
                }
                Err(EngineError::ConcurrencyConflict(_)) => tokio::task::yield_now().await,
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop handing pending tasks to workers. Submissions are still
    /// admitted and running executions are not touched.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::info!(in_flight = self.supervisor.active_count(), "queue paused");
        }
    }

    /// Let workers claim pending tasks again.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("queue resumed");
            self.work_ready.notify_waiters();
            self.work_ready.notify_one();
        }
    }

    /// Whether [`TaskEngine::pause`] is in effect.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Counts by status and priority plus the current queue order.
    pub fn stats(&self, now: DateTime<Utc>) -> EngineResult<QueueStats> {
        self.queue.stats(now)
    }

    /// Cancel every task still waiting for a worker. Executing tasks are
    /// left alone. Returns how many were cancelled.
    pub fn clear_pending(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let pending = self.store.list_by_status(&[TaskStatus::Pending])?;
        let mut cleared = 0;
        for task in &pending {
            match self.supervisor.cancel_pending(&task.task_id, now, "cleared by administrator") {
                Ok(true) => cleared += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(task_id = %task.task_id, error = %e, "clear skipped task"),
            }
        }
        self.refresh_positions(now);
        tracing::info!(cleared, seen = pending.len(), "pending queue cleared");
        Ok(cleared)
    }

    /// Move a pending task to another priority tier and re-derive positions.
    pub fn set_priority(&self, task_id: &TaskId, priority: Priority, now: DateTime<Utc>) -> EngineResult<Task> {
        let mut previous = priority;
        let outcome = self.store.update(task_id, &mut |t| {
            if t.status != TaskStatus::Pending || t.priority == priority {
                return false;
            }
            previous = t.priority;
            t.priority = priority;
            t.updated_at = now;
            true
        })?;
        let task = match outcome {
            UpdateOutcome::Updated(task) => task,
            UpdateOutcome::Unchanged(task) if task.status == TaskStatus::Pending => return Ok(task),
            UpdateOutcome::Unchanged(task) => {
                return Err(EngineError::NotPending {
                    task_id: task_id.clone(),
                    status: task.status,
                });
            }
        };

        self.audit.record(
            task_id,
            &task.owner,
            AuditAction::PriorityChanged,
            Some(format!("{previous} -> {priority}")),
        );
        tracing::info!(task_id = %task_id, from = %previous, to = %priority, "priority changed");
        self.refresh_positions(now);
        if let Err(e) = publish_snapshot(self.store.as_ref(), self.cache.as_ref(), task_id) {
            tracing::warn!(task_id = %task_id, error = %e, "cache write failed after priority change");
        }
        Ok(self.store.get(task_id)?.unwrap_or(task))
    }

    /// Re-derive queue positions.
    pub fn recompute_positions(&self, now: DateTime<Utc>) -> EngineResult<RecomputeReport> {
        self.queue.recompute_positions(now)
    }

    /// Short-cadence sweep.
    pub fn sweep_recent(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let report = self.reconciler.sweep_recent(now, SweepMode::Apply)?;
        self.after_sweep(&report, now);
        Ok(report)
    }

    /// Long-cadence full sweep.
    pub fn sweep_full(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let report = self.reconciler.sweep_full(now, SweepMode::Apply)?;
        self.after_sweep(&report, now);
        Ok(report)
    }

    /// Requeue work orphaned by a previous process and repair divergence.
    pub fn recover_on_startup(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let report = self.reconciler.recover_on_startup(now)?;
        self.after_sweep(&report, now);
        Ok(report)
    }

    /// Stop accepting work and signal every in-flight execution.
    pub fn shutdown(&self) {
        tracing::info!(in_flight = self.supervisor.active_count(), "engine shutting down");
        self.shutdown.cancel();
        self.supervisor.shutdown();
        self.work_ready.notify_waiters();
    }

    /// Wait until a submission or requeue signals new work.
    pub async fn work_ready(&self) {
        self.work_ready.notified().await;
    }

    fn admit_and_enqueue(&self, task: Task, tier: Option<&str>, now: DateTime<Utc>) -> EngineResult<Task> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        let owner = task.owner.clone();
        let task_id = task.task_id.clone();

        let first = self.admission.admit(&owner, tier, || self.store.insert(task.clone()));
        match first {
            Ok(()) => {}
            Err(EngineError::AdmissionRejected { .. }) if self.repair_owner(&owner, now) > 0 => {
                self.admission
                    .admit(&owner, tier, || self.store.insert(task.clone()))
                    .inspect_err(|_| {
                        self.audit.record(&task_id, &owner, AuditAction::Rejected, None);
                    })?;
            }
            Err(e) => {
                if matches!(e, EngineError::AdmissionRejected { .. }) {
                    self.audit.record(&task_id, &owner, AuditAction::Rejected, None);
                }
                return Err(e);
            }
        }

        if let Err(e) = publish_snapshot(self.store.as_ref(), self.cache.as_ref(), &task_id) {
            tracing::warn!(task_id = %task_id, error = %e, "cache write failed on submit");
        }
        self.audit.record(&task_id, &owner, AuditAction::Submitted, None);
        tracing::info!(
            task_id = %task_id,
            owner = %owner,
            priority = %task.priority,
            task_type = %task.task_type,
            "task submitted"
        );

        self.refresh_positions(now);
        self.work_ready.notify_one();
        Ok(self.store.get(&task_id)?.unwrap_or(task))
    }

    /// Reconcile the owner's executing tasks; some may already have results.
    fn repair_owner(&self, owner: &str, now: DateTime<Utc>) -> usize {
        let executing = match self
            .store
            .list_for_owner(owner, &[TaskStatus::Processing, TaskStatus::ProcessingCompleted])
        {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(owner = owner, error = %e, "owner repair skipped");
                return 0;
            }
        };
        executing
            .iter()
            .filter_map(|t| {
                self.reconciler
                    .reconcile_task(&t.task_id, now, SweepMode::Apply)
                    .inspect_err(|e| tracing::warn!(task_id = %t.task_id, error = %e, "owner repair failed"))
                    .ok()
                    .flatten()
            })
            .count()
    }

    fn refresh_positions(&self, now: DateTime<Utc>) {
        if let Err(e) = self.queue.recompute_positions(now) {
            tracing::warn!(error = %e, "queue position refresh failed");
        }
    }

    fn after_sweep(&self, report: &SweepReport, now: DateTime<Utc>) {
        if report.total_repairs() > 0 {
            self.refresh_positions(now);
        }
        if report.count(RepairKind::ResetAbandoned) > 0 {
            self.work_ready.notify_waiters();
            self.work_ready.notify_one();
        }
    }
}
