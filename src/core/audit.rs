//! Audit sink implementations.
//!
//! Lifecycle events are recorded alongside tracing output so tests and
//! operators can inspect exactly which component moved a task and why.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::core::task::TaskId;
use crate::util::clock::now;
use crate::util::ids::new_task_id;

/// Lifecycle action recorded by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Admitted as pending.
    Submitted,
    /// Refused by admission.
    Rejected,
    /// Claimed by a worker.
    Started,
    /// Finished with artifacts.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by the owner.
    Cancelled,
    /// Timed out.
    TimedOut,
    /// Abandoned execution reset to pending.
    Requeued,
    /// Stores brought back into agreement.
    Repaired,
    /// Resubmitted as a new task.
    Retried,
    /// Late backend result dropped.
    Discarded,
    /// Points deducted.
    Charged,
    /// Pending task moved to another tier by an administrator.
    PriorityChanged,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submitted => "submitted",
            Self::Rejected => "rejected",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Requeued => "requeued",
            Self::Repaired => "repaired",
            Self::Retried => "retried",
            Self::Discarded => "discarded",
            Self::Charged => "charged",
            Self::PriorityChanged => "priority_changed",
        };
        f.write_str(name)
    }
}

/// Audit event structure.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Related task.
    pub task_id: TaskId,
    /// Task owner.
    pub owner: String,
    /// Action taken.
    pub action: AuditAction,
    /// Event time.
    pub created_at: DateTime<Utc>,
    /// Additional context.
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events.min(1024)),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }

    /// Actions recorded for one task, oldest first.
    pub fn actions_for(&self, task_id: &TaskId) -> Vec<AuditAction> {
        self.events
            .iter()
            .filter(|e| &e.task_id == task_id)
            .map(|e| e.action)
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    task_id: &TaskId,
    owner: impl Into<String>,
    action: AuditAction,
    detail: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: new_task_id(),
        task_id: task_id.clone(),
        owner: owner.into(),
        action,
        created_at: now(),
        detail,
    }
}

/// Cloneable, optional handle to a shared sink.
#[derive(Clone, Default)]
pub struct AuditTrail {
    sink: Option<Arc<Mutex<dyn AuditSink>>>,
}

impl AuditTrail {
    /// Trail that records into `sink`.
    pub fn new(sink: Arc<Mutex<dyn AuditSink>>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Trail that drops everything.
    pub const fn disabled() -> Self {
        Self { sink: None }
    }

    /// Record one event if a sink is attached.
    pub fn record(&self, task_id: &TaskId, owner: &str, action: AuditAction, detail: Option<String>) {
        if let Some(sink) = &self.sink {
            sink.lock().record(build_audit_event(task_id, owner, action, detail));
        }
    }
}
