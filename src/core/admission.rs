//! Per-owner concurrency admission.
//!
//! Counting and inserting happen under a per-owner lock so two concurrent
//! submissions from the same owner cannot both pass a count of `limit - 1`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::AdmissionConfig;
use crate::core::error::{EngineError, EngineResult};
use crate::core::store::DurableStore;
use crate::core::task::TaskStatus;

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    /// Active tasks counted.
    pub active: usize,
    /// Ceiling that applied.
    pub limit: usize,
}

impl QuotaDecision {
    /// Whether another task fits.
    pub const fn allowed(&self) -> bool {
        self.active < self.limit
    }
}

/// Gates submissions by the owner's count of active tasks.
pub struct AdmissionController {
    store: Arc<dyn DurableStore>,
    config: AdmissionConfig,
    owner_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AdmissionController {
    /// Create a controller over `store`.
    pub fn new(store: Arc<dyn DurableStore>, config: AdmissionConfig) -> Self {
        Self {
            store,
            config,
            owner_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Count `owner`'s active tasks against the ceiling for `tier`.
    pub fn check_quota(&self, owner: &str, tier: Option<&str>) -> EngineResult<QuotaDecision> {
        let active = self.store.count_for_owner(owner, &TaskStatus::ACTIVE)?;
        Ok(QuotaDecision {
            active,
            limit: self.config.limit_for(tier),
        })
    }

    /// Run `insert` if `owner` is under quota, holding the owner's admission
    /// lock across the count and the insert.
    pub fn admit<T>(
        &self,
        owner: &str,
        tier: Option<&str>,
        insert: impl FnOnce() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let lock = self.owner_lock(owner);
        let admitted = {
            let _guard = lock.lock();
            self.admit_locked(owner, tier, insert)
        };
        self.release_owner_lock(owner, lock);
        admitted
    }

    fn admit_locked<T>(
        &self,
        owner: &str,
        tier: Option<&str>,
        insert: impl FnOnce() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let decision = self.check_quota(owner, tier)?;
        if !decision.allowed() {
            tracing::warn!(
                owner = owner,
                active = decision.active,
                limit = decision.limit,
                "admission rejected"
            );
            return Err(EngineError::AdmissionRejected {
                owner: owner.to_owned(),
                active: decision.active,
                limit: decision.limit,
            });
        }
        insert()
    }

    fn owner_lock(&self, owner: &str) -> Arc<Mutex<()>> {
        let mut locks = self.owner_locks.lock();
        Arc::clone(locks.entry(owner.to_owned()).or_default())
    }

    /// Drop the owner's lock entry once no other admission holds or waits on it.
    fn release_owner_lock(&self, owner: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.owner_locks.lock();
        // Map entry plus `lock`; clones are only taken under the map lock.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(owner);
        }
    }

    #[cfg(test)]
    fn tracked_owners(&self) -> usize {
        self.owner_locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::core::{Priority, Task, TaskType};
    use crate::infra::InMemoryStore;
    use crate::util::clock::now;

    fn make_task(owner: &str) -> Task {
        Task::new(owner, TaskType::TextToImage, Priority::Medium, serde_json::json!({}), now())
    }

    #[test]
    fn test_rejects_at_limit() {
        let store = Arc::new(InMemoryStore::new());
        let admission = AdmissionController::new(store.clone(), AdmissionConfig::default());

        let first = make_task("alice");
        admission.admit("alice", None, || store.insert(first)).unwrap();

        let err = admission
            .admit("alice", None, || store.insert(make_task("alice")))
            .unwrap_err();
        assert!(matches!(err, EngineError::AdmissionRejected { active: 1, limit: 1, .. }));
    }

    #[test]
    fn test_terminal_tasks_do_not_count() {
        let store = Arc::new(InMemoryStore::new());
        let admission = AdmissionController::new(store.clone(), AdmissionConfig::default());
        let mut done = make_task("alice");
        done.status = TaskStatus::Failed;
        store.insert(done).unwrap();
        assert!(admission.check_quota("alice", None).unwrap().allowed());
    }

    #[test]
    fn test_tier_raises_limit() {
        let store = Arc::new(InMemoryStore::new());
        let admission = AdmissionController::new(store.clone(), AdmissionConfig::default());
        for _ in 0..5 {
            admission
                .admit("vip-user", Some("vip"), || store.insert(make_task("vip-user")))
                .unwrap();
        }
        assert!(!admission.check_quota("vip-user", Some("vip")).unwrap().allowed());
    }

    #[test]
    fn test_concurrent_submissions_respect_limit() {
        let store = Arc::new(InMemoryStore::new());
        let admission = Arc::new(AdmissionController::new(store.clone(), AdmissionConfig::default()));
        let admitted = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    let task = make_task("racer");
                    if admission.admit("racer", None, || store.insert(task)).is_ok() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(admission.tracked_owners(), 0);
    }

    #[test]
    fn test_owner_locks_are_released_after_admission() {
        let store = Arc::new(InMemoryStore::new());
        let admission = AdmissionController::new(store.clone(), AdmissionConfig::default());

        for i in 0..100 {
            let owner = format!("user-{i}");
            let task = make_task(&owner);
            admission.admit(&owner, None, || store.insert(task)).unwrap();
        }
        let err = admission
            .admit("user-0", None, || store.insert(make_task("user-0")))
            .unwrap_err();
        assert!(matches!(err, EngineError::AdmissionRejected { .. }));

        assert_eq!(store.len(), 100);
        assert_eq!(admission.tracked_owners(), 0);
    }
}
