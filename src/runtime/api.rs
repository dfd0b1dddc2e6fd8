//! API-facing request/response models.
//!
//! The HTTP layer is a collaborator; these types are what it exchanges with
//! the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{
    EngineResult, Priority, QueueStats, Submission, Task, TaskEngine, TaskId, TaskStatus, TaskType,
};

/// Task submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Submitting user.
    pub owner: String,
    /// Quota tier.
    #[serde(default)]
    pub tier: Option<String>,
    /// Generation kind.
    pub task_type: TaskType,
    /// Requested priority; unknown values mean medium.
    #[serde(default)]
    pub priority: Option<String>,
    /// Backend payload.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Conversation linkage.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Response to a submission or retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// New task id.
    pub task_id: TaskId,
    /// Status at admission.
    pub status: TaskStatus,
    /// Position at admission.
    pub queue_position: Option<u32>,
    /// Effective priority.
    pub priority: Priority,
}

impl From<&Task> for SubmitReceipt {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            queue_position: task.queue_position,
            priority: task.priority,
        }
    }
}

/// Poll response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    /// Task id.
    pub task_id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Progress fraction.
    pub progress: f32,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// Display position while non-terminal.
    pub queue_position: Option<u32>,
    /// Artifacts, once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<String>>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Task> for PollResponse {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status: task.status,
            progress: task.progress,
            created_at: task.created_at,
            queue_position: task.queue_position,
            result: task.output_data.as_ref().map(|o| o.image_urls.clone()),
            error: task.error_message.clone(),
        }
    }
}

/// Cancel response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Task id.
    pub task_id: TaskId,
    /// Status after the call.
    pub status: TaskStatus,
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Executions in flight in this process.
    pub in_flight: usize,
    /// Workers are not claiming new tasks.
    pub paused: bool,
}

/// Administrative queue overview.
#[derive(Debug, Clone, Serialize)]
pub struct QueueOverview {
    /// Workers are not claiming new tasks.
    pub paused: bool,
    /// Executions in flight in this process.
    pub in_flight: usize,
    /// Table-wide counts and queue order.
    #[serde(flatten)]
    pub stats: QueueStats,
}

/// Administrative priority change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityUpdate {
    /// Task to move.
    pub task_id: TaskId,
    /// New tier: `low`, `medium` or `high`.
    pub priority: String,
}

/// Result of clearing the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearResponse {
    /// Tasks cancelled.
    pub cancelled: usize,
}

/// Submit a generation request.
pub fn submit_task(engine: &TaskEngine, req: SubmitRequest, now: DateTime<Utc>) -> EngineResult<SubmitReceipt> {
    let submission = Submission {
        owner: req.owner,
        tier: req.tier,
        task_type: req.task_type,
        priority: req.priority.as_deref().map_or(Priority::Medium, Priority::parse_lenient),
        input: req.input,
        session_id: req.session_id,
    };
    engine.submit(submission, now).map(|task| SubmitReceipt::from(&task))
}

/// Poll a task.
pub fn poll_task(engine: &TaskEngine, task_id: &TaskId, now: DateTime<Utc>) -> EngineResult<PollResponse> {
    engine.poll(task_id, now).map(|task| PollResponse::from(&task))
}

/// Cancel a task.
pub fn cancel_task(engine: &TaskEngine, task_id: &TaskId, now: DateTime<Utc>) -> EngineResult<CancelResponse> {
    engine.cancel(task_id, now).map(|status| CancelResponse {
        task_id: task_id.clone(),
        status,
    })
}

/// Retry a terminal task.
pub fn retry_task(
    engine: &TaskEngine,
    task_id: &TaskId,
    tier: Option<&str>,
    now: DateTime<Utc>,
) -> EngineResult<SubmitReceipt> {
    engine.retry(task_id, tier, now).map(|task| SubmitReceipt::from(&task))
}

/// Return a health payload.
pub fn health(engine: &TaskEngine) -> Health {
    Health {
        ok: !engine.shutdown_token().is_cancelled(),
        in_flight: engine.supervisor().active_count(),
        paused: engine.is_paused(),
    }
}

/// Queue overview for operators.
pub fn queue_overview(engine: &TaskEngine, now: DateTime<Utc>) -> EngineResult<QueueOverview> {
    Ok(QueueOverview {
        paused: engine.is_paused(),
        in_flight: engine.supervisor().active_count(),
        stats: engine.stats(now)?,
    })
}

/// Cancel every pending task.
pub fn clear_queue(engine: &TaskEngine, now: DateTime<Utc>) -> EngineResult<ClearResponse> {
    engine.clear_pending(now).map(|cancelled| ClearResponse { cancelled })
}

/// Change a pending task's priority. Unknown tiers are rejected.
pub fn update_priority(engine: &TaskEngine, req: &PriorityUpdate, now: DateTime<Utc>) -> EngineResult<SubmitReceipt> {
    let priority = req.priority.parse::<Priority>()?;
    engine
        .set_priority(&req.task_id, priority, now)
        .map(|task| SubmitReceipt::from(&task))
}
