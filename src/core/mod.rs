//! Core engine: task model, admission, queueing, execution, reconciliation.

pub mod admission;
pub mod audit;
pub mod billing;
pub mod engine;
pub mod error;
pub mod executor;
pub mod merge;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod spawn;
pub mod store;
pub mod supervisor;
pub mod task;

pub use admission::{AdmissionController, QuotaDecision};
pub use audit::{build_audit_event, AuditAction, AuditEvent, AuditSink, AuditTrail, InMemoryAuditSink};
pub use billing::{BillingGuard, PointsLedger};
pub use engine::{Submission, TaskEngine};
pub use error::{AppResult, EngineError, EngineResult};
pub use executor::{GenerationBackend, GenerationRequest, GenerationResponse, ProgressReporter};
pub use merge::{merge_snapshots, MergeResolution};
pub use queue::{order_tasks, PriorityQueueManager, QueueStats, RecomputeReport};
pub use reconciler::{diagnose, Diagnosis, ReconcilePolicy, RepairKind, StatusReconciler, SweepMode, SweepReport};
pub use retry::build_retry;
pub use spawn::Spawn;
pub use store::{publish_snapshot, DurableStore, FastCache, UpdateOutcome};
pub use supervisor::{ActiveExecutions, ExecutionSupervisor};
pub use task::{
    validate_transition, OwnerId, Priority, Task, TaskId, TaskOutput, TaskSnapshot, TaskStatus, TaskType,
};
