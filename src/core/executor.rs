//! Generation backend seam.
//!
//! The backend performs the actual model invocation. The engine owns
//! everything around it: claiming, timeouts, cancellation and result writes.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use gpu_task_engine::core::{GenerationBackend, GenerationRequest, GenerationResponse};
//! use tokio_util::sync::CancellationToken;
//!
//! struct DiffusionBackend;
//!
//! #[async_trait]
//! impl GenerationBackend for DiffusionBackend {
//!     async fn generate(&self, request: GenerationRequest, cancel: CancellationToken) -> GenerationResponse {
//!         request.progress.report(0.5);
//!         if cancel.is_cancelled() {
//!             return GenerationResponse::failure("cancelled");
//!         }
//!         GenerationResponse::success(vec![format!("https://cdn/{}.png", request.task_id)])
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::store::{publish_snapshot, DurableStore, FastCache};
use crate::core::task::{TaskId, TaskStatus, TaskType};
use crate::util::clock::now;

/// Input handed to the backend.
#[derive(Clone)]
pub struct GenerationRequest {
    /// Task being executed.
    pub task_id: TaskId,
    /// Generation kind.
    pub task_type: TaskType,
    /// Task input payload.
    pub input: serde_json::Value,
    /// Sink for intermediate progress.
    pub progress: ProgressReporter,
}

/// Backend response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Whether the backend considers the call successful.
    pub success: bool,
    /// Produced artifacts.
    #[serde(default)]
    pub image_urls: Vec<String>,
    /// Error description on failure.
    #[serde(default)]
    pub error: Option<String>,
}

impl GenerationResponse {
    /// Successful response carrying `image_urls`.
    pub const fn success(image_urls: Vec<String>) -> Self {
        Self {
            success: true,
            image_urls,
            error: None,
        }
    }

    /// Failed response.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            image_urls: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// External generation service.
///
/// Implementations should poll `cancel` at safe points; the engine stops
/// waiting on cancellation regardless, and any result produced afterwards
/// is discarded.
#[async_trait]
pub trait GenerationBackend: Send + Sync + 'static {
    /// Run one generation.
    async fn generate(&self, request: GenerationRequest, cancel: CancellationToken) -> GenerationResponse;
}

/// Writes progress for one executing task into both stores.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn FastCache>,
}

impl ProgressReporter {
    /// Reporter for `task_id`.
    pub fn new(task_id: TaskId, store: Arc<dyn DurableStore>, cache: Arc<dyn FastCache>) -> Self {
        Self { task_id, store, cache }
    }

    /// Record `fraction` (clamped to `[0, 1)`) while the task is processing.
    /// Ignored once the task has left `processing`.
    pub fn report(&self, fraction: f32) {
        let fraction = fraction.clamp(0.0, 0.99);
        let at = now();
        let outcome = self.store.update(&self.task_id, &mut |t| {
            if t.status != TaskStatus::Processing {
                return false;
            }
            t.progress = fraction;
            t.updated_at = at;
            true
        });
        match outcome {
            Ok(outcome) if outcome.is_updated() => {
                if let Err(e) = publish_snapshot(self.store.as_ref(), self.cache.as_ref(), &self.task_id) {
                    tracing::debug!(task_id = %self.task_id, error = %e, "progress cache write failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(task_id = %self.task_id, error = %e, "progress write failed"),
        }
    }
}
