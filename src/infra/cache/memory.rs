//! In-memory status cache.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::core::{EngineResult, FastCache, TaskId, TaskSnapshot};

/// Simple in-memory cache for development/testing.
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<TaskId, TaskSnapshot>>,
}

impl InMemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl FastCache for InMemoryCache {
    fn get(&self, task_id: &TaskId) -> EngineResult<Option<TaskSnapshot>> {
        Ok(self.entries.read().get(task_id).cloned())
    }

    fn set(&self, snapshot: TaskSnapshot) -> EngineResult<()> {
        self.entries.write().insert(snapshot.task_id.clone(), snapshot);
        Ok(())
    }

    fn delete(&self, task_id: &TaskId) -> EngineResult<()> {
        self.entries.write().remove(task_id);
        Ok(())
    }

    fn dump(&self) -> EngineResult<Vec<TaskSnapshot>> {
        Ok(self.entries.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Priority, Task, TaskType};
    use crate::util::clock::now;

    #[test]
    fn test_set_get_delete() {
        let cache = InMemoryCache::new();
        let snap = Task::new("u1", TaskType::Upscale, Priority::Low, serde_json::json!({}), now()).snapshot();
        let id = snap.task_id.clone();
        cache.set(snap.clone()).unwrap();
        assert_eq!(cache.get(&id).unwrap(), Some(snap));
        assert_eq!(cache.dump().unwrap().len(), 1);
        cache.delete(&id).unwrap();
        assert!(cache.get(&id).unwrap().is_none());
        assert!(cache.is_empty());
    }
}
