//! Error types for engine operations.

use thiserror::Error;

use crate::core::task::{OwnerId, TaskId, TaskStatus};

/// Errors produced by engine components.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Owner is at its concurrent-task ceiling. Never auto-retried.
    #[error("queue full: owner {owner} has {active} active tasks (limit {limit})")]
    AdmissionRejected {
        /// Rejected owner.
        owner: OwnerId,
        /// Active tasks counted at rejection time.
        active: usize,
        /// Ceiling that applied.
        limit: usize,
    },
    /// The generation backend returned an error.
    #[error("generation backend failed: {0}")]
    BackendInvocationFailed(String),
    /// Stores disagree in a way no legal transition can repair.
    #[error("stale state for task {0}")]
    StaleState(TaskId),
    /// Task exceeded its time budget.
    #[error("task {0} timed out")]
    Timeout(TaskId),
    /// Another writer won a compare-and-set on the same row.
    #[error("concurrent update lost on task {0}")]
    ConcurrencyConflict(TaskId),
    /// No durable record for the id.
    #[error("task {0} not found")]
    NotFound(TaskId),
    /// Requested status change is not an edge of the state machine.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },
    /// Only terminal tasks can be retried.
    #[error("task {task_id} is {status} and cannot be retried")]
    NotRetryable {
        /// Task that was asked to retry.
        task_id: TaskId,
        /// Its current status.
        status: TaskStatus,
    },
    /// Only pending tasks can be rescheduled.
    #[error("task {task_id} is {status}; only pending tasks can be rescheduled")]
    NotPending {
        /// Task that was asked to change.
        task_id: TaskId,
        /// Its current status.
        status: TaskStatus,
    },
    /// A request field failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Completed tasks cannot be cancelled.
    #[error("task {0} already completed")]
    AlreadyCompleted(TaskId),
    /// Collaborator (store, cache, ledger) failure.
    #[error("store error: {0}")]
    Store(String),
    /// Engine configuration or wiring is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Engine has been shut down.
    #[error("engine is shut down")]
    Shutdown,
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_message_names_owner_and_limit() {
        let err = EngineError::AdmissionRejected {
            owner: "alice".into(),
            active: 1,
            limit: 1,
        };
        assert_eq!(err.to_string(), "queue full: owner alice has 1 active tasks (limit 1)");
    }

    #[test]
    fn transition_message_uses_wire_names() {
        let err = EngineError::InvalidTransition {
            from: TaskStatus::Completed,
            to: TaskStatus::Pending,
        };
        assert_eq!(err.to_string(), "invalid transition completed -> pending");
    }
}
