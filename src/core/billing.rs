//! At-most-once points deduction for completed tasks.

use std::sync::Arc;

use crate::config::BillingConfig;
use crate::core::audit::{AuditAction, AuditTrail};
use crate::core::error::EngineResult;
use crate::core::store::DurableStore;
use crate::core::task::{TaskId, TaskStatus};

/// External points bookkeeping.
pub trait PointsLedger: Send + Sync {
    /// Debit `points` from `owner` for `task_id`.
    fn deduct(&self, owner: &str, points: u32, task_id: &TaskId) -> EngineResult<()>;
}

/// Charges owners for completed tasks exactly once.
///
/// The ledger call and the `is_points_deducted` flip both happen inside the
/// row lock, so concurrent settlements of one task cannot both charge, and a
/// failed ledger call leaves the flag clear for the next attempt.
pub struct BillingGuard {
    store: Arc<dyn DurableStore>,
    ledger: Arc<dyn PointsLedger>,
    config: BillingConfig,
    audit: AuditTrail,
}

impl BillingGuard {
    /// Create a guard.
    pub fn new(store: Arc<dyn DurableStore>, ledger: Arc<dyn PointsLedger>, config: BillingConfig) -> Self {
        Self {
            store,
            ledger,
            config,
            audit: AuditTrail::disabled(),
        }
    }

    /// Record each charge in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = audit;
        self
    }

    /// Charge for `task_id` if it is completed and not yet charged.
    /// Returns whether this call performed the charge.
    pub fn settle(&self, task_id: &TaskId) -> EngineResult<bool> {
        let mut ledger_error = None;
        let outcome = self.store.update(task_id, &mut |task| {
            if task.status != TaskStatus::Completed || task.is_points_deducted {
                return false;
            }
            let cost = self.config.cost_of(task.task_type);
            if cost > 0 {
                if let Err(e) = self.ledger.deduct(&task.owner, cost, &task.task_id) {
                    ledger_error = Some(e);
                    return false;
                }
            }
            task.is_points_deducted = true;
            true
        })?;
        if let Some(e) = ledger_error {
            tracing::error!(task_id = %task_id, error = %e, "points deduction failed");
            return Err(e);
        }
        if outcome.is_updated() {
            let task = outcome.into_task();
            let points = self.config.cost_of(task.task_type);
            self.audit
                .record(task_id, &task.owner, AuditAction::Charged, Some(format!("{points} points")));
            tracing::info!(task_id = %task_id, owner = %task.owner, points, "points deducted");
            return Ok(true);
        }
        Ok(false)
    }

    /// Settle every completed task that has not been charged yet.
    /// Returns the number of charges made.
    pub fn settle_outstanding(&self) -> EngineResult<usize> {
        let mut charged = 0;
        for task in self.store.list_by_status(&[TaskStatus::Completed])? {
            if task.is_points_deducted {
                continue;
            }
            match self.settle(&task.task_id) {
                Ok(true) => charged += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(task_id = %task.task_id, error = %e, "settlement deferred"),
            }
        }
        Ok(charged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EngineError, Priority, Task, TaskType};
    use crate::infra::{InMemoryLedger, InMemoryStore};
    use crate::util::clock::now;

    struct RefusingLedger;

    impl PointsLedger for RefusingLedger {
        fn deduct(&self, _owner: &str, _points: u32, _task_id: &TaskId) -> EngineResult<()> {
            Err(EngineError::Store("ledger offline".into()))
        }
    }

    fn completed_task(store: &InMemoryStore) -> TaskId {
        let mut task = Task::new("payer", TaskType::Upscale, Priority::Medium, serde_json::json!({}), now());
        task.finish(TaskStatus::Completed, now());
        let id = task.task_id.clone();
        store.insert(task).unwrap();
        id
    }

    #[test]
    fn test_settle_charges_once() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let guard = BillingGuard::new(store.clone(), ledger.clone(), BillingConfig::default());
        let id = completed_task(&store);

        assert!(guard.settle(&id).unwrap());
        assert!(!guard.settle(&id).unwrap());
        assert_eq!(ledger.charges_for(&id), 1);
        assert_eq!(ledger.total_for("payer"), 4);
        assert!(store.get(&id).unwrap().unwrap().is_points_deducted);
    }

    #[test]
    fn test_non_completed_tasks_are_not_charged() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let guard = BillingGuard::new(store.clone(), ledger.clone(), BillingConfig::default());
        let mut task = Task::new("payer", TaskType::Upscale, Priority::Medium, serde_json::json!({}), now());
        task.finish(TaskStatus::Failed, now());
        let id = task.task_id.clone();
        store.insert(task).unwrap();

        assert!(!guard.settle(&id).unwrap());
        assert!(ledger.charges().is_empty());
    }

    #[test]
    fn test_ledger_failure_leaves_flag_clear() {
        let store = Arc::new(InMemoryStore::new());
        let guard = BillingGuard::new(store.clone(), Arc::new(RefusingLedger), BillingConfig::default());
        let id = completed_task(&store);

        assert!(guard.settle(&id).is_err());
        assert!(!store.get(&id).unwrap().unwrap().is_points_deducted);
    }

    #[test]
    fn test_settle_outstanding_sweeps_all_unbilled() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let guard = BillingGuard::new(store.clone(), ledger.clone(), BillingConfig::default());
        for _ in 0..3 {
            completed_task(&store);
        }
        assert_eq!(guard.settle_outstanding().unwrap(), 3);
        assert_eq!(guard.settle_outstanding().unwrap(), 0);
        assert_eq!(ledger.charges().len(), 3);
    }
}
