//! Engine configuration models.

pub mod engine;

pub use engine::{
    AdmissionConfig, BillingConfig, EngineConfig, QueueConfig, ReconcilerConfig, WorkerConfig,
};
