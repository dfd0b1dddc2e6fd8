//! Priority ordering and display queue positions.
//!
//! Order: executing tasks first, then by priority tier (optionally aged),
//! then FIFO by creation time. Pending tasks get 1-based positions in that
//! order; executing tasks are pinned to 0.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::error::EngineResult;
use crate::core::store::{publish_snapshot, DurableStore, FastCache};
use crate::core::task::{Priority, Task, TaskId, TaskStatus};
use crate::util::clock::{ago, elapsed};

/// Maximum tier boost granted by aging.
const MAX_AGING_BOOST: f64 = 3.0;

/// Window for [`QueueStats::recent_by_status`].
const RECENT_STATS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Sort key for one queued task.
#[derive(Debug, Clone)]
struct QueueKey<'a> {
    executing: bool,
    effective_rank: f64,
    created_at: DateTime<Utc>,
    task_id: &'a TaskId,
}

impl PartialEq for QueueKey<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueKey<'_> {}

impl PartialOrd for QueueKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Executing before waiting, lower rank first, then FIFO.
        other
            .executing
            .cmp(&self.executing)
            .then_with(|| self.effective_rank.total_cmp(&other.effective_rank))
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.task_id.cmp(other.task_id))
    }
}

/// Sort `tasks` into queue order as of `now`.
///
/// With `aging`, a pending task that has waited longer than the threshold
/// gains up to three tiers, proportional to its excess wait relative to the
/// longest waiter.
pub fn order_tasks(tasks: &mut [Task], now: DateTime<Utc>, aging: Option<Duration>) {
    let max_wait = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .map(|t| elapsed(t.created_at, now))
        .max()
        .unwrap_or_default();

    let boost = |task: &Task| -> f64 {
        let Some(threshold) = aging else { return 0.0 };
        if task.status != TaskStatus::Pending {
            return 0.0;
        }
        let waited = elapsed(task.created_at, now);
        if waited <= threshold {
            return 0.0;
        }
        let span = max_wait.saturating_sub(threshold).as_secs_f64();
        if span <= 0.0 {
            return MAX_AGING_BOOST;
        }
        (MAX_AGING_BOOST * waited.saturating_sub(threshold).as_secs_f64() / span).min(MAX_AGING_BOOST)
    };

    let ranks: Vec<f64> = tasks
        .iter()
        .map(|t| f64::from(t.priority.rank()) - boost(t))
        .collect();
    let mut indexed: Vec<(usize, Task)> = tasks.iter().cloned().enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| {
        let ka = QueueKey {
            executing: a.status.is_executing(),
            effective_rank: ranks[*ia],
            created_at: a.created_at,
            task_id: &a.task_id,
        };
        let kb = QueueKey {
            executing: b.status.is_executing(),
            effective_rank: ranks[*ib],
            created_at: b.created_at,
            task_id: &b.task_id,
        };
        ka.cmp(&kb)
    });
    for (slot, (_, task)) in tasks.iter_mut().zip(indexed) {
        *slot = task;
    }
}

/// Counts from one recompute pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecomputeReport {
    /// Non-terminal tasks in the snapshot.
    pub examined: usize,
    /// Rows whose position changed.
    pub written: usize,
}

/// Overview of the whole task table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Every task, by status.
    pub by_status: HashMap<TaskStatus, usize>,
    /// Pending tasks, by priority tier.
    pub pending_by_priority: HashMap<Priority, usize>,
    /// Tasks created in the last 24 hours, by status.
    pub recent_by_status: HashMap<TaskStatus, usize>,
    /// Pending tasks in claim order.
    pub pending: Vec<TaskId>,
    /// Tasks currently executing.
    pub executing: Vec<TaskId>,
}

impl QueueStats {
    /// Tasks in `status`.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Pending tasks at `priority`.
    pub fn pending_at(&self, priority: Priority) -> usize {
        self.pending_by_priority.get(&priority).copied().unwrap_or(0)
    }

    /// Tasks created in the last 24 hours and now in `status`.
    pub fn recent(&self, status: TaskStatus) -> usize {
        self.recent_by_status.get(&status).copied().unwrap_or(0)
    }

    /// Every task counted.
    pub fn total(&self) -> usize {
        self.by_status.values().sum()
    }
}

/// Orders non-terminal tasks and maintains their queue positions.
pub struct PriorityQueueManager {
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn FastCache>,
    aging: Option<Duration>,
}

impl PriorityQueueManager {
    /// Create a manager; `aging` enables priority aging past that wait.
    pub fn new(store: Arc<dyn DurableStore>, cache: Arc<dyn FastCache>, aging: Option<Duration>) -> Self {
        Self { store, cache, aging }
    }

    /// Snapshot of all non-terminal tasks in queue order.
    pub fn ordered(&self, now: DateTime<Utc>) -> EngineResult<Vec<Task>> {
        let mut tasks = self.store.list_by_status(&TaskStatus::ACTIVE)?;
        order_tasks(&mut tasks, now, self.aging);
        Ok(tasks)
    }

    /// Pending tasks in the order workers should claim them.
    pub fn pending_in_order(&self, now: DateTime<Utc>) -> EngineResult<Vec<Task>> {
        Ok(self
            .ordered(now)?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect())
    }

    /// Head of the pending queue.
    pub fn next_pending(&self, now: DateTime<Utc>) -> EngineResult<Option<Task>> {
        Ok(self.pending_in_order(now)?.into_iter().next())
    }

    /// Position `task_id` would be shown, or `None` if it is terminal or unknown.
    pub fn position_of(&self, task_id: &TaskId, now: DateTime<Utc>) -> EngineResult<Option<u32>> {
        let mut pending = 0u32;
        for task in self.ordered(now)? {
            if task.status == TaskStatus::Pending {
                pending += 1;
            }
            if &task.task_id == task_id {
                return Ok(Some(if task.status.is_executing() { 0 } else { pending }));
            }
        }
        Ok(None)
    }

    /// Status, priority and recency counts over every stored task.
    pub fn stats(&self, now: DateTime<Utc>) -> EngineResult<QueueStats> {
        let recent_cutoff = ago(now, RECENT_STATS_WINDOW);
        let mut stats = QueueStats::default();
        for task in self.store.list_by_status(&TaskStatus::ALL)? {
            *stats.by_status.entry(task.status).or_default() += 1;
            if task.status == TaskStatus::Pending {
                *stats.pending_by_priority.entry(task.priority).or_default() += 1;
            }
            if task.created_at >= recent_cutoff {
                *stats.recent_by_status.entry(task.status).or_default() += 1;
            }
        }
        for task in self.ordered(now)? {
            if task.status == TaskStatus::Pending {
                stats.pending.push(task.task_id);
            } else {
                stats.executing.push(task.task_id);
            }
        }
        Ok(stats)
    }

    /// Re-derive every non-terminal task's position from a fresh snapshot.
    ///
    /// Each write re-checks the row's current status, so tasks claimed or
    /// finished after the snapshot was taken are never given a stale value.
    pub fn recompute_positions(&self, now: DateTime<Utc>) -> EngineResult<RecomputeReport> {
        let ordered = self.ordered(now)?;
        let mut report = RecomputeReport {
            examined: ordered.len(),
            written: 0,
        };
        let mut pending = 0u32;
        for task in ordered {
            let expected = if task.status == TaskStatus::Pending {
                pending += 1;
                pending
            } else {
                0
            };
            let outcome = self.store.update(&task.task_id, &mut |row| {
                let want = match row.status {
                    TaskStatus::Processing | TaskStatus::ProcessingCompleted => Some(0),
                    TaskStatus::Pending if expected > 0 => Some(expected),
                    _ => return false,
                };
                if row.queue_position == want {
                    return false;
                }
                row.queue_position = want;
                true
            });
            match outcome {
                Ok(outcome) if outcome.is_updated() => {
                    report.written += 1;
                    if let Err(e) = publish_snapshot(self.store.as_ref(), self.cache.as_ref(), &task.task_id) {
                        tracing::warn!(task_id = %task.task_id, error = %e, "cache write failed during recompute");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(task_id = %task.task_id, error = %e, "position write failed"),
            }
        }
        tracing::debug!(examined = report.examined, written = report.written, "queue positions recomputed");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Priority, TaskType};
    use crate::infra::{InMemoryCache, InMemoryStore};
    use crate::util::clock::now;

    fn make_task(priority: Priority, created_at: DateTime<Utc>) -> Task {
        Task::new("u", TaskType::TextToImage, priority, serde_json::json!({}), created_at)
    }

    fn manager(store: &Arc<InMemoryStore>, aging: Option<Duration>) -> PriorityQueueManager {
        PriorityQueueManager::new(store.clone(), Arc::new(InMemoryCache::new()), aging)
    }

    #[test]
    fn test_priority_ordering() {
        let t0 = now();
        let mut tasks = vec![
            make_task(Priority::Low, t0),
            make_task(Priority::High, t0 + chrono::Duration::seconds(1)),
            make_task(Priority::Medium, t0 + chrono::Duration::seconds(2)),
        ];
        order_tasks(&mut tasks, t0, None);
        let order: Vec<_> = tasks.iter().map(|t| t.priority).collect();
        assert_eq!(order, vec![Priority::High, Priority::Medium, Priority::Low]);
    }

    #[test]
    fn test_fifo_within_priority_and_processing_first() {
        let t0 = now();
        let a = make_task(Priority::Medium, t0 + chrono::Duration::seconds(3));
        let b = make_task(Priority::Medium, t0 + chrono::Duration::seconds(1));
        let mut c = make_task(Priority::Low, t0 + chrono::Duration::seconds(5));
        c.status = TaskStatus::Processing;
        let mut tasks = vec![a.clone(), b.clone(), c.clone()];
        order_tasks(&mut tasks, t0, None);
        let ids: Vec<_> = tasks.iter().map(|t| t.task_id.clone()).collect();
        assert_eq!(ids, vec![c.task_id, b.task_id, a.task_id]);
    }

    #[test]
    fn test_aging_lifts_long_waiters() {
        let t0 = now();
        let old_low = make_task(Priority::Low, t0 - chrono::Duration::minutes(60));
        let fresh_high = make_task(Priority::High, t0);
        let mut tasks = vec![fresh_high.clone(), old_low.clone()];
        order_tasks(&mut tasks, t0, Some(Duration::from_secs(600)));
        assert_eq!(tasks[0].task_id, old_low.task_id);

        let mut tasks = vec![fresh_high.clone(), old_low];
        order_tasks(&mut tasks, t0, None);
        assert_eq!(tasks[0].task_id, fresh_high.task_id);
    }

    #[test]
    fn test_recompute_assigns_positions_and_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let t0 = now();
        let mut running = make_task(Priority::Low, t0);
        running.status = TaskStatus::Processing;
        let first = make_task(Priority::High, t0 + chrono::Duration::seconds(1));
        let second = make_task(Priority::High, t0 + chrono::Duration::seconds(2));
        let third = make_task(Priority::Medium, t0);
        for t in [&running, &first, &second, &third] {
            store.insert(t.clone()).unwrap();
        }
        let queue = manager(&store, None);

        let report = queue.recompute_positions(t0).unwrap();
        assert_eq!(report, RecomputeReport { examined: 4, written: 4 });
        let pos = |t: &Task| store.get(&t.task_id).unwrap().unwrap().queue_position;
        assert_eq!(pos(&running), Some(0));
        assert_eq!(pos(&first), Some(1));
        assert_eq!(pos(&second), Some(2));
        assert_eq!(pos(&third), Some(3));

        assert_eq!(queue.recompute_positions(t0).unwrap().written, 0);
        assert_eq!(queue.position_of(&third.task_id, t0).unwrap(), Some(3));
        assert_eq!(queue.next_pending(t0).unwrap().unwrap().task_id, first.task_id);
    }

    #[test]
    fn test_stats_counts_by_status_priority_and_recency() {
        let store = Arc::new(InMemoryStore::new());
        let t0 = now();
        let mut running = make_task(Priority::Low, t0);
        running.status = TaskStatus::Processing;
        let high = make_task(Priority::High, t0);
        let low = make_task(Priority::Low, t0 - chrono::Duration::seconds(5));
        let mut old_done = make_task(Priority::Medium, t0 - chrono::Duration::hours(30));
        old_done.status = TaskStatus::Completed;
        for t in [&running, &high, &low, &old_done] {
            store.insert(t.clone()).unwrap();
        }

        let stats = manager(&store, None).stats(t0).unwrap();
        assert_eq!(stats.total(), 4);
        assert_eq!(stats.count(TaskStatus::Pending), 2);
        assert_eq!(stats.count(TaskStatus::Completed), 1);
        assert_eq!(stats.pending_at(Priority::High), 1);
        assert_eq!(stats.pending_at(Priority::Low), 1);
        assert_eq!(stats.pending_at(Priority::Medium), 0);
        assert_eq!(stats.recent(TaskStatus::Completed), 0);
        assert_eq!(stats.recent(TaskStatus::Pending), 2);
        assert_eq!(stats.pending, vec![high.task_id.clone(), low.task_id.clone()]);
        assert_eq!(stats.executing, vec![running.task_id.clone()]);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["by_status"]["pending"], 2);
        assert_eq!(json["pending_by_priority"]["high"], 1);
    }
}
