//! Retry: a terminal task is resubmitted as a brand-new task.
//!
//! The original row is only read. The copy gets a new id, a fresh seed when
//! the input carried one, and `retry_of` pointing back at the original.

use chrono::{DateTime, Utc};

use crate::core::error::{EngineError, EngineResult};
use crate::core::task::{Task, TaskStatus};
use crate::util::ids::fresh_seed;

/// Build the pending task that retries `original`.
///
/// Failed and timed-out tasks are bumped one priority tier.
pub fn build_retry(original: &Task, now: DateTime<Utc>) -> EngineResult<Task> {
    if !original.status.is_terminal() {
        return Err(EngineError::NotRetryable {
            task_id: original.task_id.clone(),
            status: original.status,
        });
    }

    let priority = match original.status {
        TaskStatus::Failed | TaskStatus::StuckTimeout => original.priority.bumped(),
        _ => original.priority,
    };

    let mut input = original.input_data.clone();
    if let Some(fields) = input.as_object_mut() {
        if fields.contains_key("seed") {
            fields.insert("seed".into(), fresh_seed(original.seed()).into());
        }
    }

    let mut retry = Task::new(original.owner.clone(), original.task_type, priority, input, now)
        .with_session(original.session_id.clone());
    retry.retry_of = Some(original.task_id.clone());
    Ok(retry)
}
