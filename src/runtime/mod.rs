//! Runtime adapters (tokio spawner, background loops) and API surface.

pub mod api;
pub mod background;
pub mod tokio_spawner;

pub use api::{
    cancel_task, clear_queue, health, poll_task, queue_overview, retry_task, submit_task, update_priority,
    CancelResponse, ClearResponse, Health, PollResponse, PriorityUpdate, QueueOverview, SubmitReceipt,
    SubmitRequest,
};
pub use background::{run_worker, start_engine};
pub use tokio_spawner::TokioSpawner;
