//! Storage seams: the authoritative durable store and the low-latency cache.
//!
//! The durable store serializes writers per row: [`DurableStore::update`]
//! runs the mutation under the row lock, which is what every
//! compare-and-set in the engine relies on. The cache is a plain key-value
//! view with no TTL and may lag behind the store.

use chrono::{DateTime, Utc};

use crate::core::error::EngineResult;
use crate::core::task::{Task, TaskId, TaskSnapshot, TaskStatus};

/// Result of a row-locked update.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The mutation applied; carries the row after the write.
    Updated(Task),
    /// The mutation declined to write; carries the current row.
    Unchanged(Task),
}

impl UpdateOutcome {
    /// True if the row was written.
    pub const fn is_updated(&self) -> bool {
        matches!(self, Self::Updated(_))
    }

    /// Row state after the call.
    pub fn into_task(self) -> Task {
        match self {
            Self::Updated(task) | Self::Unchanged(task) => task,
        }
    }
}

/// Authoritative task persistence.
pub trait DurableStore: Send + Sync {
    /// Insert a new row. Fails if the id already exists.
    fn insert(&self, task: Task) -> EngineResult<()>;

    /// Read a row.
    fn get(&self, task_id: &TaskId) -> EngineResult<Option<Task>>;

    /// Run `mutate` under the row lock. The closure returns `true` to commit
    /// its changes and `false` to leave the row untouched.
    ///
    /// Returns [`crate::core::EngineError::NotFound`] for unknown ids.
    fn update(
        &self,
        task_id: &TaskId,
        mutate: &mut dyn FnMut(&mut Task) -> bool,
    ) -> EngineResult<UpdateOutcome>;

    /// Rows whose status is in `statuses`.
    fn list_by_status(&self, statuses: &[TaskStatus]) -> EngineResult<Vec<Task>>;

    /// Rows of `owner` whose status is in `statuses`.
    fn list_for_owner(&self, owner: &str, statuses: &[TaskStatus]) -> EngineResult<Vec<Task>>;

    /// Non-terminal rows created before `cutoff`.
    fn non_terminal_older_than(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Task>>;

    /// Rows updated at or after `cutoff`.
    fn updated_since(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Task>>;

    /// Count of `owner`'s rows whose status is in `statuses`.
    fn count_for_owner(&self, owner: &str, statuses: &[TaskStatus]) -> EngineResult<usize> {
        Ok(self.list_for_owner(owner, statuses)?.len())
    }
}

/// Copy the current row for `task_id` into `cache` while holding the row
/// lock.
///
/// Every writer publishes after its own commit, so a publish can only be
/// followed by newer row states, never overtake them. A terminal cache entry
/// is not replaced by a non-terminal row; the reconciler promotes it instead.
/// Returns whether the cache was written.
pub fn publish_snapshot(store: &dyn DurableStore, cache: &dyn FastCache, task_id: &TaskId) -> EngineResult<bool> {
    let mut published = Ok(false);
    store.update(task_id, &mut |row| {
        let snapshot = row.snapshot();
        let shadows_terminal = matches!(
            cache.get(task_id),
            Ok(Some(current)) if current.status.is_terminal() && !snapshot.status.is_terminal()
        );
        published = if shadows_terminal {
            Ok(false)
        } else {
            cache.set(snapshot).map(|()| true)
        };
        false
    })?;
    published
}

/// Low-latency task status cache.
pub trait FastCache: Send + Sync {
    /// Read an entry.
    fn get(&self, task_id: &TaskId) -> EngineResult<Option<TaskSnapshot>>;

    /// Write an entry, replacing any previous one.
    fn set(&self, snapshot: TaskSnapshot) -> EngineResult<()>;

    /// Remove an entry.
    fn delete(&self, task_id: &TaskId) -> EngineResult<()>;

    /// Every entry currently held.
    fn dump(&self) -> EngineResult<Vec<TaskSnapshot>>;
}
