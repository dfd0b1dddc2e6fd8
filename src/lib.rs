//! # GPU Task Engine
//!
//! Admission, priority scheduling, execution supervision and status
//! reconciliation for asynchronous GPU image-generation tasks.
//!
//! Tasks are admitted under per-owner concurrency ceilings, ordered by
//! priority tier and age, and executed by a pool of async workers against an
//! external [`core::GenerationBackend`]. Task state lives in two
//! independently writable places: a durable store (authoritative) and a
//! low-latency cache. The [`core::StatusReconciler`] keeps them convergent
//! despite crashed workers, lost writes and out-of-order completions.
//!
//! ## Key Features
//!
//! - **Quota admission**: per-owner ceilings with named tiers
//! - **Priority queue**: processing first, then tier, then FIFO, with optional aging
//! - **Cooperative cancellation**: `CancellationToken` per execution, late results discarded
//! - **Reconciliation**: terminal-wins merge, artifact promotion, timeouts, abandonment requeue
//! - **Retry**: terminal tasks resubmitted as new tasks with a fresh seed
//! - **At-most-once billing**: guarded by a row-locked flag
//! - **Queue administration**: overview counts, pause/resume, clearing pending work, priority changes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use gpu_task_engine::builders::EngineBuilder;
//! use gpu_task_engine::config::EngineConfig;
//! use gpu_task_engine::core::{Submission, TaskType};
//! use gpu_task_engine::runtime::{start_engine, TokioSpawner};
//! use gpu_task_engine::util::clock::now;
//!
//! let engine = Arc::new(
//!     EngineBuilder::new(EngineConfig::from_env()?)
//!         .with_backend(Arc::new(my_backend))
//!         .build()?,
//! );
//! start_engine(&engine, &TokioSpawner::current())?;
//!
//! let task = engine.submit(
//!     Submission::new("user-1", TaskType::TextToImage, serde_json::json!({"prompt": "a fox", "seed": 7})),
//!     now(),
//! )?;
//! let status = engine.poll(&task.task_id, now())?.status;
//! ```
//!
//! For complete scenarios, see `tests/engine_scenarios_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core engine: task model, admission, queueing, execution, reconciliation.
pub mod core;
/// Configuration models for admission, workers, reconciler and billing.
pub mod config;
/// Builders to construct the engine from configuration.
pub mod builders;
/// Infrastructure adapters for the durable store, cache and ledger.
pub mod infra;
/// Runtime adapters (tokio spawner, background loops) and API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
