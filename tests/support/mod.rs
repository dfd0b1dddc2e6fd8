//! Shared fixtures for integration tests: a scripted backend and a fully
//! wired in-memory engine.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpu_task_engine::builders::EngineBuilder;
use gpu_task_engine::config::EngineConfig;
use gpu_task_engine::core::{
    GenerationBackend, GenerationRequest, GenerationResponse, InMemoryAuditSink, Submission, Task,
    TaskEngine, TaskId, TaskStatus, TaskType,
};
use gpu_task_engine::core::DurableStore;
use gpu_task_engine::infra::{InMemoryCache, InMemoryLedger, InMemoryStore};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Backend whose behaviour is selected by `input["mode"]`:
///
/// - `ok` (default): one artifact
/// - `fail`: backend error
/// - `empty`: success with no artifacts
/// - `hold`: wait for [`ScriptedBackend::release`], then one artifact
/// - `progress`: report 0.5, then behave like `hold`
/// - `hang`: wait until cancelled
#[derive(Default)]
pub struct ScriptedBackend {
    gate: Notify,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let one held call finish.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn artifact_url(task_id: &TaskId) -> String {
    format!("https://cdn.test/{task_id}.png")
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn generate(&self, request: GenerationRequest, cancel: CancellationToken) -> GenerationResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let url = artifact_url(&request.task_id);
        let mode = request
            .input
            .get("mode")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("ok")
            .to_owned();
        match mode.as_str() {
            "fail" => GenerationResponse::failure("model exploded"),
            "empty" => GenerationResponse::success(Vec::new()),
            "hold" => {
                self.gate.notified().await;
                GenerationResponse::success(vec![url])
            }
            "progress" => {
                request.progress.report(0.5);
                self.gate.notified().await;
                GenerationResponse::success(vec![url])
            }
            "hang" => {
                cancel.cancelled().await;
                GenerationResponse::failure("cancelled")
            }
            _ => GenerationResponse::success(vec![url]),
        }
    }
}

pub struct Harness {
    pub engine: Arc<TaskEngine>,
    pub store: Arc<InMemoryStore>,
    pub cache: Arc<InMemoryCache>,
    pub ledger: Arc<InMemoryLedger>,
    pub audit: Arc<Mutex<InMemoryAuditSink>>,
    pub backend: Arc<ScriptedBackend>,
}

pub fn test_config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.worker.worker_count = 2;
    cfg.worker.idle_poll_ms = 20;
    cfg
}

pub fn harness() -> Harness {
    harness_with(test_config(), Arc::new(InMemoryStore::new()))
}

pub fn harness_with(config: EngineConfig, store: Arc<InMemoryStore>) -> Harness {
    gpu_task_engine::util::telemetry::init_tracing_with("gpu_task_engine=debug");
    let cache = Arc::new(InMemoryCache::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let audit = Arc::new(Mutex::new(InMemoryAuditSink::new(1024)));
    let backend = ScriptedBackend::new();
    let engine = EngineBuilder::new(config)
        .with_store(store.clone())
        .with_cache(cache.clone())
        .with_ledger(ledger.clone())
        .with_audit_sink(audit.clone())
        .with_backend(backend.clone())
        .build()
        .expect("engine builds");
    Harness {
        engine: Arc::new(engine),
        store,
        cache,
        ledger,
        audit,
        backend,
    }
}

pub fn submission(owner: &str, mode: &str) -> Submission {
    Submission::new(
        owner,
        TaskType::TextToImage,
        serde_json::json!({"prompt": "a red fox", "seed": 1234, "mode": mode}),
    )
}

pub fn row(store: &InMemoryStore, task_id: &TaskId) -> Task {
    store.get(task_id).unwrap().expect("row exists")
}

/// Poll the durable row until `pred` holds, failing after ~5s.
pub async fn wait_until(store: &InMemoryStore, task_id: &TaskId, pred: impl Fn(&Task) -> bool) -> Task {
    for _ in 0..500 {
        if let Some(task) = store.get(task_id).unwrap() {
            if pred(&task) {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} never reached the expected state: {:?}", store.get(task_id).unwrap());
}

pub async fn wait_for_status(store: &InMemoryStore, task_id: &TaskId, status: TaskStatus) -> Task {
    wait_until(store, task_id, |t| t.status == status).await
}
