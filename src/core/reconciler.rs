//! Status reconciliation between the durable store and the cache.
//!
//! Deciding and repairing are separate: [`diagnose`] is a pure function of
//! one task's two views, and [`StatusReconciler`] applies its verdict with
//! row-locked writes that re-check the row before committing. Every repair
//! is idempotent, so overlapping sweeps and inline poll repairs are safe.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::ReconcilerConfig;
use crate::core::audit::{AuditAction, AuditTrail};
use crate::core::billing::BillingGuard;
use crate::core::error::{EngineError, EngineResult};
use crate::core::merge::{merge_snapshots, MergeResolution};
use crate::core::store::{publish_snapshot, DurableStore, FastCache, UpdateOutcome};
use crate::core::supervisor::ActiveExecutions;
use crate::core::task::{Task, TaskId, TaskOutput, TaskSnapshot, TaskStatus};
use crate::util::clock::{ago, elapsed};

/// Thresholds used by [`diagnose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Lifetime after which a non-terminal task without a result times out.
    pub absolute_timeout: Duration,
    /// Quiet period before an unowned processing task is requeued.
    pub abandon_grace: Duration,
}

impl From<&ReconcilerConfig> for ReconcilePolicy {
    fn from(cfg: &ReconcilerConfig) -> Self {
        Self {
            absolute_timeout: Duration::from_secs(cfg.absolute_timeout_secs),
            abandon_grace: Duration::from_secs(cfg.abandon_grace_secs),
        }
    }
}

/// A repair one task needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnosis {
    /// Copy the cache's terminal state into the durable row.
    PromoteFromCache(TaskSnapshot),
    /// A result exists; finish as completed with it.
    CompleteWithArtifacts(TaskOutput),
    /// `processing_completed` without artifacts; finish as completed.
    FinalizeTransient,
    /// Exceeded the absolute lifetime.
    TimedOut {
        /// Age at diagnosis.
        age: Duration,
    },
    /// Processing with no live execution; requeue.
    ResetAbandoned,
    /// Durable row is right; overwrite the cache.
    RefreshCache(TaskSnapshot),
}

/// Category of a repair, for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairKind {
    /// Cache terminal state copied to the durable row.
    PromotedFromCache,
    /// Completed from an existing result.
    CompletedWithArtifacts,
    /// Transient status promoted.
    FinalizedTransient,
    /// Forced to `stuck_timeout`.
    TimedOut,
    /// Requeued after abandonment.
    ResetAbandoned,
    /// Cache overwritten from the durable row.
    CacheRefreshed,
    /// Cache entry without a durable row removed.
    OrphanCacheDeleted,
}

impl Diagnosis {
    /// Report category.
    pub const fn kind(&self) -> RepairKind {
        match self {
            Self::PromoteFromCache(_) => RepairKind::PromotedFromCache,
            Self::CompleteWithArtifacts(_) => RepairKind::CompletedWithArtifacts,
            Self::FinalizeTransient => RepairKind::FinalizedTransient,
            Self::TimedOut { .. } => RepairKind::TimedOut,
            Self::ResetAbandoned => RepairKind::ResetAbandoned,
            Self::RefreshCache(_) => RepairKind::CacheRefreshed,
        }
    }
}

/// Decide what, if anything, `durable` needs given its cache entry.
pub fn diagnose(
    durable: &Task,
    cache: Option<&TaskSnapshot>,
    active: bool,
    now: DateTime<Utc>,
    policy: &ReconcilePolicy,
) -> Option<Diagnosis> {
    let mut refresh = None;
    match merge_snapshots(cache, &durable.snapshot()) {
        MergeResolution::PromoteDurable(snap) if durable.status.can_reach(snap.status) => {
            return Some(Diagnosis::PromoteFromCache(snap));
        }
        MergeResolution::CompleteWithArtifacts(output) if durable.status.is_executing() => {
            return Some(Diagnosis::CompleteWithArtifacts(output));
        }
        // A cached result can only finish a row that is itself executing.
        MergeResolution::CompleteWithArtifacts(_) => refresh = Some(durable.snapshot()),
        MergeResolution::RefreshCache(snap) if durable.status.is_terminal() => {
            return Some(Diagnosis::RefreshCache(snap));
        }
        MergeResolution::RefreshCache(snap) => refresh = Some(snap),
        MergeResolution::PromoteDurable(_) | MergeResolution::InSync => {}
    }

    if durable.status.is_terminal() {
        return None;
    }
    if durable.status == TaskStatus::ProcessingCompleted {
        return Some(Diagnosis::FinalizeTransient);
    }
    let age = elapsed(durable.created_at, now);
    if age > policy.absolute_timeout {
        return Some(Diagnosis::TimedOut { age });
    }
    if durable.status == TaskStatus::Processing
        && !active
        && elapsed(durable.updated_at, now) >= policy.abandon_grace
    {
        return Some(Diagnosis::ResetAbandoned);
    }
    refresh.map(Diagnosis::RefreshCache)
}

/// Whether a sweep writes its repairs or only reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepMode {
    /// Write repairs.
    #[default]
    Apply,
    /// Report what would be repaired.
    CheckOnly,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tasks looked at.
    pub examined: usize,
    /// Repairs by kind.
    pub repairs: HashMap<RepairKind, usize>,
    /// Tasks whose repair failed; retried next sweep.
    pub errors: usize,
    /// Billing charges made.
    pub charged: usize,
}

impl SweepReport {
    /// Repairs of `kind`.
    pub fn count(&self, kind: RepairKind) -> usize {
        self.repairs.get(&kind).copied().unwrap_or(0)
    }

    /// All repairs.
    pub fn total_repairs(&self) -> usize {
        self.repairs.values().sum()
    }

    fn note(&mut self, kind: RepairKind) {
        *self.repairs.entry(kind).or_default() += 1;
    }
}

/// Repairs divergence, enforces timeouts and requeues abandoned work.
pub struct StatusReconciler {
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn FastCache>,
    active: Arc<dyn ActiveExecutions>,
    billing: Arc<BillingGuard>,
    audit: AuditTrail,
    policy: ReconcilePolicy,
    recent_window: Duration,
}

impl StatusReconciler {
    /// Create a reconciler.
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn FastCache>,
        active: Arc<dyn ActiveExecutions>,
        billing: Arc<BillingGuard>,
        audit: AuditTrail,
        config: &ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            cache,
            active,
            billing,
            audit,
            policy: ReconcilePolicy::from(config),
            recent_window: Duration::from_secs(config.recent_window_secs),
        }
    }

    /// Active policy.
    pub const fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// Diagnose and (in [`SweepMode::Apply`]) repair one task.
    pub fn reconcile_task(
        &self,
        task_id: &TaskId,
        now: DateTime<Utc>,
        mode: SweepMode,
    ) -> EngineResult<Option<RepairKind>> {
        self.reconcile_with(task_id, now, mode, &self.policy)
    }

    /// Sweep over tasks updated within the recent window.
    pub fn sweep_recent(&self, now: DateTime<Utc>, mode: SweepMode) -> EngineResult<SweepReport> {
        let mut report = SweepReport::default();
        for task in self.store.updated_since(ago(now, self.recent_window))? {
            self.sweep_one(&task.task_id, now, mode, &self.policy, &mut report);
        }
        tracing::debug!(examined = report.examined, repairs = report.total_repairs(), "recent sweep finished");
        Ok(report)
    }

    /// Sweep over every non-terminal task and the whole cache, then settle
    /// outstanding billing.
    pub fn sweep_full(&self, now: DateTime<Utc>, mode: SweepMode) -> EngineResult<SweepReport> {
        self.sweep_full_with(now, mode, &self.policy)
    }

    /// Full sweep with no abandonment grace: any processing row without a
    /// live execution in this process is requeued.
    pub fn recover_on_startup(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let policy = ReconcilePolicy {
            abandon_grace: Duration::ZERO,
            ..self.policy
        };
        let report = self.sweep_full_with(now, SweepMode::Apply, &policy)?;
        tracing::info!(
            examined = report.examined,
            requeued = report.count(RepairKind::ResetAbandoned),
            repairs = report.total_repairs(),
            "startup recovery finished"
        );
        Ok(report)
    }

    fn sweep_full_with(
        &self,
        now: DateTime<Utc>,
        mode: SweepMode,
        policy: &ReconcilePolicy,
    ) -> EngineResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut seen = HashSet::new();

        let overdue = self.store.non_terminal_older_than(ago(now, policy.absolute_timeout))?;
        let active = self.store.list_by_status(&TaskStatus::ACTIVE)?;
        for task in overdue.into_iter().chain(active) {
            if seen.insert(task.task_id.clone()) {
                self.sweep_one(&task.task_id, now, mode, policy, &mut report);
            }
        }

        for snap in self.cache.dump()? {
            if !seen.insert(snap.task_id.clone()) {
                continue;
            }
            match self.store.get(&snap.task_id) {
                Ok(Some(_)) => self.sweep_one(&snap.task_id, now, mode, policy, &mut report),
                Ok(None) => {
                    report.examined += 1;
                    report.note(RepairKind::OrphanCacheDeleted);
                    if mode == SweepMode::Apply {
                        if let Err(e) = self.cache.delete(&snap.task_id) {
                            report.errors += 1;
                            tracing::warn!(task_id = %snap.task_id, error = %e, "orphan cache delete failed");
                        }
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(task_id = %snap.task_id, error = %e, "durable read failed during sweep");
                }
            }
        }

        if mode == SweepMode::Apply {
            report.charged = self.billing.settle_outstanding()?;
        }
        tracing::info!(
            examined = report.examined,
            repairs = report.total_repairs(),
            errors = report.errors,
            charged = report.charged,
            check_only = mode == SweepMode::CheckOnly,
            "full sweep finished"
        );
        Ok(report)
    }

    fn sweep_one(
        &self,
        task_id: &TaskId,
        now: DateTime<Utc>,
        mode: SweepMode,
        policy: &ReconcilePolicy,
        report: &mut SweepReport,
    ) {
        report.examined += 1;
        match self.reconcile_with(task_id, now, mode, policy) {
            Ok(Some(kind)) => report.note(kind),
            Ok(None) => {}
            Err(e) => {
                report.errors += 1;
                tracing::warn!(task_id = %task_id, error = %e, "reconcile failed; will retry next sweep");
            }
        }
    }

    fn reconcile_with(
        &self,
        task_id: &TaskId,
        now: DateTime<Utc>,
        mode: SweepMode,
        policy: &ReconcilePolicy,
    ) -> EngineResult<Option<RepairKind>> {
        let durable = self
            .store
            .get(task_id)?
            .ok_or_else(|| EngineError::NotFound(task_id.clone()))?;
        let cached = self.cache.get(task_id).unwrap_or_else(|e| {
            tracing::debug!(task_id = %task_id, error = %e, "cache read failed; treating as missing");
            None
        });
        let active = self.active.is_active(task_id);

        let Some(diagnosis) = diagnose(&durable, cached.as_ref(), active, now, policy) else {
            return Ok(None);
        };
        let kind = diagnosis.kind();
        if mode == SweepMode::CheckOnly {
            tracing::info!(task_id = %task_id, repair = ?kind, "repair needed (check only)");
            return Ok(Some(kind));
        }
        Ok(self.apply(&durable, diagnosis, now)?.then_some(kind))
    }

    fn apply(&self, durable: &Task, diagnosis: Diagnosis, now: DateTime<Utc>) -> EngineResult<bool> {
        let task_id = &durable.task_id;
        let outcome = match &diagnosis {
            Diagnosis::RefreshCache(_) => {
                return publish_snapshot(self.store.as_ref(), self.cache.as_ref(), task_id);
            }
            Diagnosis::PromoteFromCache(snap) => self.store.update(task_id, &mut |t| {
                if !t.status.can_reach(snap.status) {
                    return false;
                }
                if snap.output_data.is_some() {
                    t.output_data.clone_from(&snap.output_data);
                }
                t.error_message.clone_from(&snap.error_message);
                t.finish(snap.status, snap.completed_at.unwrap_or(now));
                true
            })?,
            Diagnosis::CompleteWithArtifacts(output) => self.store.update(task_id, &mut |t| {
                if !t.status.is_executing() {
                    return false;
                }
                t.output_data = Some(output.clone());
                t.error_message = None;
                t.finish(TaskStatus::Completed, now);
                true
            })?,
            Diagnosis::FinalizeTransient => self.store.update(task_id, &mut |t| {
                if t.status != TaskStatus::ProcessingCompleted {
                    return false;
                }
                t.finish(TaskStatus::Completed, now);
                true
            })?,
            Diagnosis::TimedOut { age } => self.store.update(task_id, &mut |t| {
                if !t.status.can_transition_to(TaskStatus::StuckTimeout) {
                    return false;
                }
                t.error_message = Some(format!(
                    "{}: no result after {}s (limit {}s)",
                    EngineError::Timeout(t.task_id.clone()),
                    age.as_secs(),
                    self.policy.absolute_timeout.as_secs()
                ));
                t.finish(TaskStatus::StuckTimeout, now);
                true
            })?,
            Diagnosis::ResetAbandoned => self.store.update(task_id, &mut |t| {
                if t.status != TaskStatus::Processing || self.active.is_active(&t.task_id) {
                    return false;
                }
                t.status = TaskStatus::Pending;
                t.started_at = None;
                t.progress = 0.0;
                t.queue_position = None;
                t.updated_at = now;
                true
            })?,
        };

        let task = match outcome {
            UpdateOutcome::Updated(task) => task,
            UpdateOutcome::Unchanged(current) => {
                if let Diagnosis::PromoteFromCache(snap) = &diagnosis {
                    if !current.status.is_terminal() {
                        let err = EngineError::StaleState(task_id.clone());
                        tracing::warn!(
                            task_id = %task_id,
                            durable = %current.status,
                            cached = %snap.status,
                            error = %err,
                            "cache state unreachable from durable state"
                        );
                        return Err(err);
                    }
                }
                tracing::debug!(task_id = %task_id, repair = ?diagnosis.kind(), "row changed before repair; skipped");
                return Ok(false);
            }
        };

        if let Err(e) = publish_snapshot(self.store.as_ref(), self.cache.as_ref(), task_id) {
            tracing::warn!(task_id = %task_id, error = %e, "cache write failed after repair");
        }
        if task.status.is_terminal() && self.active.abort(task_id) {
            tracing::debug!(task_id = %task_id, "live execution signalled after forced transition");
        }

        let (action, detail) = match &diagnosis {
            Diagnosis::TimedOut { .. } => (AuditAction::TimedOut, task.error_message.clone()),
            Diagnosis::ResetAbandoned => (AuditAction::Requeued, None),
            other => (AuditAction::Repaired, Some(format!("{:?} -> {}", other.kind(), task.status))),
        };
        self.audit.record(task_id, &task.owner, action, detail);
        tracing::warn!(
            task_id = %task_id,
            from = %durable.status,
            to = %task.status,
            repair = ?diagnosis.kind(),
            "task repaired"
        );

        if task.status == TaskStatus::Completed {
            if let Err(e) = self.billing.settle(task_id) {
                tracing::warn!(task_id = %task_id, error = %e, "billing deferred to sweep");
            }
        }
        Ok(true)
    }
}
