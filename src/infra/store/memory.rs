//! In-memory durable store with per-row locks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::core::{DurableStore, EngineError, EngineResult, Task, TaskId, TaskStatus, UpdateOutcome};

/// Row storage keyed by task id.
///
/// The outer map lock is held only to look up or insert a row handle; all
/// mutation happens under the row's own mutex, so writers to different tasks
/// never contend.
#[derive(Default)]
pub struct InMemoryStore {
    rows: RwLock<HashMap<TaskId, Arc<Mutex<Task>>>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// True when no rows exist.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn row(&self, task_id: &TaskId) -> Option<Arc<Mutex<Task>>> {
        self.rows.read().get(task_id).cloned()
    }

    fn collect(&self, mut keep: impl FnMut(&Task) -> bool) -> Vec<Task> {
        let handles: Vec<_> = self.rows.read().values().cloned().collect();
        let mut out: Vec<Task> = handles
            .iter()
            .filter_map(|row| {
                let task = row.lock();
                keep(&task).then(|| task.clone())
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.task_id.cmp(&b.task_id)));
        out
    }
}

impl DurableStore for InMemoryStore {
    fn insert(&self, task: Task) -> EngineResult<()> {
        let mut rows = self.rows.write();
        if rows.contains_key(&task.task_id) {
            return Err(EngineError::Store(format!("duplicate task id {}", task.task_id)));
        }
        rows.insert(task.task_id.clone(), Arc::new(Mutex::new(task)));
        Ok(())
    }

    fn get(&self, task_id: &TaskId) -> EngineResult<Option<Task>> {
        Ok(self.row(task_id).map(|row| row.lock().clone()))
    }

    fn update(
        &self,
        task_id: &TaskId,
        mutate: &mut dyn FnMut(&mut Task) -> bool,
    ) -> EngineResult<UpdateOutcome> {
        let row = self
            .row(task_id)
            .ok_or_else(|| EngineError::NotFound(task_id.clone()))?;
        let mut guard = row.lock();
        let mut draft = guard.clone();
        if mutate(&mut draft) {
            *guard = draft;
            Ok(UpdateOutcome::Updated(guard.clone()))
        } else {
            Ok(UpdateOutcome::Unchanged(guard.clone()))
        }
    }

    fn list_by_status(&self, statuses: &[TaskStatus]) -> EngineResult<Vec<Task>> {
        Ok(self.collect(|task| statuses.contains(&task.status)))
    }

    fn list_for_owner(&self, owner: &str, statuses: &[TaskStatus]) -> EngineResult<Vec<Task>> {
        Ok(self.collect(|task| task.owner == owner && statuses.contains(&task.status)))
    }

    fn non_terminal_older_than(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Task>> {
        Ok(self.collect(|task| !task.status.is_terminal() && task.created_at < cutoff))
    }

    fn updated_since(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Task>> {
        Ok(self.collect(|task| task.updated_at >= cutoff))
    }
}
