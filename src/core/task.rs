//! Task model and lifecycle state machine.
//!
//! ```text
//! pending -> processing -> processing_completed -> completed
//!                       -> completed | failed | cancelled | stuck_timeout
//!                       -> pending            (abandonment reset)
//! pending -> cancelled | failed | stuck_timeout
//! ```
//!
//! Terminal states have no outgoing edges.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::EngineError;
use crate::util::ids::new_task_id;

/// Owner (user) identifier.
pub type OwnerId = String;

/// Opaque, immutable task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Allocate a new random identifier.
    pub fn generate() -> Self {
        Self(new_task_id())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Admitted and waiting for a worker.
    Pending,
    /// Claimed by a worker; backend call in flight.
    Processing,
    /// Result written but status not yet finalized. Always promoted.
    ProcessingCompleted,
    /// Finished with artifacts.
    Completed,
    /// Backend reported an error.
    Failed,
    /// Cancelled by the owner.
    Cancelled,
    /// Exceeded its time budget.
    StuckTimeout,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Processing,
        Self::ProcessingCompleted,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::StuckTimeout,
    ];

    /// Statuses counted against a user's concurrency quota.
    pub const ACTIVE: [Self; 3] = [Self::Pending, Self::Processing, Self::ProcessingCompleted];

    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::ProcessingCompleted => "processing_completed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::StuckTimeout => "stuck_timeout",
        }
    }

    /// True for end states that never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::StuckTimeout
        )
    }

    /// True for statuses counted by admission.
    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// True while a backend result may still be written.
    pub const fn is_executing(self) -> bool {
        matches!(self, Self::Processing | Self::ProcessingCompleted)
    }

    /// Statuses directly reachable from `self`.
    pub const fn successors(self) -> &'static [Self] {
        match self {
            Self::Pending => &[
                Self::Processing,
                Self::Cancelled,
                Self::Failed,
                Self::StuckTimeout,
            ],
            Self::Processing => &[
                Self::ProcessingCompleted,
                Self::Completed,
                Self::Failed,
                Self::Cancelled,
                Self::StuckTimeout,
                Self::Pending,
            ],
            Self::ProcessingCompleted => &[Self::Completed],
            Self::Completed | Self::Failed | Self::Cancelled | Self::StuckTimeout => &[],
        }
    }

    /// Whether `self -> to` is a single legal edge.
    pub fn can_transition_to(self, to: Self) -> bool {
        self.successors().contains(&to)
    }

    /// Whether `to` is reachable from `self` along one or more legal edges
    /// without passing through the abandonment reset.
    pub fn can_reach(self, to: Self) -> bool {
        if self == to {
            return false;
        }
        let mut frontier = vec![self];
        let mut seen = vec![self];
        while let Some(current) = frontier.pop() {
            for &next in current.successors() {
                if next == to {
                    return true;
                }
                if next != Self::Pending && !seen.contains(&next) {
                    seen.push(next);
                    frontier.push(next);
                }
            }
        }
        false
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EngineError::Store(format!("unknown task status `{s}`")))
    }
}

/// Check a single-edge transition.
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), EngineError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

/// Scheduling priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default tier.
    #[default]
    Medium,
    /// Served first.
    High,
}

impl Priority {
    /// Every tier, highest first.
    pub const ALL: [Self; 3] = [Self::High, Self::Medium, Self::Low];

    /// Sort rank: lower is served earlier.
    pub const fn rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    /// One tier higher, saturating at `High`.
    pub const fn bumped(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
        }
    }

    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Parse a client-supplied string, falling back to `Medium`.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Medium,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = EngineError;

    /// Strict parse for administrative changes; unknown tiers are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| EngineError::InvalidRequest(format!("unknown priority `{s}`")))
    }
}

/// Kind of generation requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Prompt to image.
    TextToImage,
    /// Reference image plus prompt to image.
    ImageToImage,
    /// Masked or instruction-driven edit.
    ImageEdit,
    /// Super-resolution.
    Upscale,
    /// Matting.
    BackgroundRemoval,
}

impl TaskType {
    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TextToImage => "text_to_image",
            Self::ImageToImage => "image_to_image",
            Self::ImageEdit => "image_edit",
            Self::Upscale => "upscale",
            Self::BackgroundRemoval => "background_removal",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text_to_image" => Ok(Self::TextToImage),
            "image_to_image" => Ok(Self::ImageToImage),
            "image_edit" => Ok(Self::ImageEdit),
            "upscale" => Ok(Self::Upscale),
            "background_removal" => Ok(Self::BackgroundRemoval),
            other => Err(format!("unknown task type `{other}`")),
        }
    }
}

/// Structured result of a generation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Produced artifact references.
    pub image_urls: Vec<String>,
}

impl TaskOutput {
    /// Wrap a list of artifact URLs.
    pub const fn new(image_urls: Vec<String>) -> Self {
        Self { image_urls }
    }

    /// True when at least one artifact exists.
    pub fn has_artifacts(&self) -> bool {
        self.image_urls.iter().any(|url| !url.is_empty())
    }
}

/// Durable task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub task_id: TaskId,
    /// Submitting user.
    pub owner: OwnerId,
    /// Generation kind.
    pub task_type: TaskType,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Scheduling tier.
    pub priority: Priority,
    /// Display position; `Some(0)` while executing, `None` once terminal.
    pub queue_position: Option<u32>,
    /// Backend request payload.
    pub input_data: serde_json::Value,
    /// Backend result.
    pub output_data: Option<TaskOutput>,
    /// Failure description.
    pub error_message: Option<String>,
    /// Progress fraction in `[0, 1]`.
    pub progress: f32,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// Claim time of the current execution.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Set once the owner has been charged.
    pub is_points_deducted: bool,
    /// Conversation linkage.
    pub session_id: Option<String>,
    /// Task this one retries.
    pub retry_of: Option<TaskId>,
    /// Backend wall time in milliseconds.
    pub processing_time_ms: Option<u64>,
}

impl Task {
    /// Build a freshly admitted pending task.
    pub fn new(
        owner: impl Into<OwnerId>,
        task_type: TaskType,
        priority: Priority,
        input_data: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: TaskId::generate(),
            owner: owner.into(),
            task_type,
            status: TaskStatus::Pending,
            priority,
            queue_position: None,
            input_data,
            output_data: None,
            error_message: None,
            progress: 0.0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            is_points_deducted: false,
            session_id: None,
            retry_of: None,
            processing_time_ms: None,
        }
    }

    /// Attach a session id.
    #[must_use]
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Seed carried in the input payload, if any.
    pub fn seed(&self) -> Option<u64> {
        self.input_data.get("seed").and_then(serde_json::Value::as_u64)
    }

    /// True when the output holds at least one artifact.
    pub fn has_artifacts(&self) -> bool {
        self.output_data.as_ref().is_some_and(TaskOutput::has_artifacts)
    }

    /// Move to a terminal status, clearing the queue position.
    pub fn finish(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.queue_position = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        if status == TaskStatus::Completed {
            self.progress = 1.0;
        }
    }

    /// Cache view of this record.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            owner: self.owner.clone(),
            status: self.status,
            progress: self.progress,
            queue_position: self.queue_position,
            output_data: self.output_data.clone(),
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        }
    }
}

/// Cache representation of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub task_id: TaskId,
    /// Submitting user.
    pub owner: OwnerId,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Progress fraction.
    pub progress: f32,
    /// Display position.
    pub queue_position: Option<u32>,
    /// Backend result.
    pub output_data: Option<TaskOutput>,
    /// Failure description.
    pub error_message: Option<String>,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Terminal transition time.
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    /// True when the output holds at least one artifact.
    pub fn has_artifacts(&self) -> bool {
        self.output_data.as_ref().is_some_and(TaskOutput::has_artifacts)
    }

    /// Fields a poll reports; used to decide whether two views disagree.
    pub fn same_observable_state(&self, other: &Self) -> bool {
        self.status == other.status
            && self.output_data == other.output_data
            && self.error_message == other.error_message
            && self.queue_position == other.queue_position
            && (self.progress - other.progress).abs() < f32::EPSILON
    }
}
