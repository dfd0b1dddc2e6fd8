//! Execution supervision: claims, results, cancellation, late results and
//! the per-execution timeout.

mod support;

use std::sync::Arc;

use gpu_task_engine::core::{
    ActiveExecutions, AuditAction, DurableStore, EngineError, FastCache, TaskStatus,
};
use gpu_task_engine::infra::InMemoryStore;
use gpu_task_engine::util::clock::now;
use support::{artifact_url, harness, harness_with, row, submission, test_config, wait_for_status, wait_until};

#[tokio::test]
async fn test_completion_writes_both_stores_and_bills_once() {
    let h = harness();
    let task = h.engine.submit(submission("alice", "ok"), now()).unwrap();

    let status = h.engine.supervisor().dispatch(&task.task_id, now()).await.unwrap();
    assert_eq!(status, TaskStatus::Completed);

    let stored = row(&h.store, &task.task_id);
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.output_data.unwrap().image_urls, vec![artifact_url(&task.task_id)]);
    assert!((stored.progress - 1.0).abs() < f32::EPSILON);
    assert!(stored.is_points_deducted);
    assert!(stored.processing_time_ms.is_some());
    assert_eq!(stored.queue_position, None);

    let cached = h.cache.get(&task.task_id).unwrap().unwrap();
    assert_eq!(cached.status, TaskStatus::Completed);
    assert!(cached.has_artifacts());

    assert_eq!(h.ledger.charges_for(&task.task_id), 1);
    assert_eq!(h.ledger.total_for("alice"), 10);
    assert_eq!(h.engine.supervisor().active_count(), 0);
    assert_eq!(
        h.audit.lock().actions_for(&task.task_id),
        vec![
            AuditAction::Submitted,
            AuditAction::Started,
            AuditAction::Completed,
            AuditAction::Charged
        ]
    );
}

#[tokio::test]
async fn test_backend_failure_marks_failed() {
    let h = harness();
    let task = h.engine.submit(submission("alice", "fail"), now()).unwrap();

    let status = h.engine.supervisor().dispatch(&task.task_id, now()).await.unwrap();
    assert_eq!(status, TaskStatus::Failed);

    let stored = row(&h.store, &task.task_id);
    assert!(stored.error_message.unwrap().contains("model exploded"));
    assert!(stored.output_data.is_none());
    assert!(!stored.is_points_deducted);
    assert_eq!(h.ledger.charges_for(&task.task_id), 0);
}

#[tokio::test]
async fn test_success_without_artifacts_is_failure() {
    let h = harness();
    let task = h.engine.submit(submission("alice", "empty"), now()).unwrap();

    let status = h.engine.supervisor().dispatch(&task.task_id, now()).await.unwrap();
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(
        row(&h.store, &task.task_id).error_message.as_deref(),
        Some("backend returned no artifacts")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_progress_visible_in_both_stores() {
    let h = harness();
    let task = h.engine.submit(submission("alice", "progress"), now()).unwrap();

    let engine = Arc::clone(&h.engine);
    let id = task.task_id.clone();
    let running = tokio::spawn(async move { engine.supervisor().dispatch(&id, now()).await });

    let stored = wait_until(&h.store, &task.task_id, |t| t.progress > 0.0).await;
    assert!((stored.progress - 0.5).abs() < f32::EPSILON);
    assert_eq!(stored.status, TaskStatus::Processing);
    let cached = h.cache.get(&task.task_id).unwrap().unwrap();
    assert!((cached.progress - 0.5).abs() < f32::EPSILON);

    h.backend.release();
    assert_eq!(running.await.unwrap().unwrap(), TaskStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_task_stops_execution() {
    let h = harness();
    let task = h.engine.submit(submission("alice", "hang"), now()).unwrap();

    let engine = Arc::clone(&h.engine);
    let id = task.task_id.clone();
    let running = tokio::spawn(async move { engine.supervisor().dispatch(&id, now()).await });
    wait_for_status(&h.store, &task.task_id, TaskStatus::Processing).await;
    assert!(h.engine.supervisor().is_active(&task.task_id));

    assert_eq!(h.engine.cancel(&task.task_id, now()).unwrap(), TaskStatus::Cancelled);
    assert_eq!(running.await.unwrap().unwrap(), TaskStatus::Cancelled);

    let stored = row(&h.store, &task.task_id);
    assert_eq!(stored.status, TaskStatus::Cancelled);
    assert!(stored.output_data.is_none());
    assert!(!h.engine.supervisor().is_active(&task.task_id));
    assert_eq!(h.cache.get(&task.task_id).unwrap().unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_result_after_external_cancel_is_discarded() {
    let h = harness();
    let task = h.engine.submit(submission("alice", "hold"), now()).unwrap();

    let engine = Arc::clone(&h.engine);
    let id = task.task_id.clone();
    let running = tokio::spawn(async move { engine.supervisor().dispatch(&id, now()).await });
    wait_for_status(&h.store, &task.task_id, TaskStatus::Processing).await;

    // Another process cancels the row without reaching our token.
    h.store
        .update(&task.task_id, &mut |t| {
            t.finish(TaskStatus::Cancelled, now());
            true
        })
        .unwrap();
    h.backend.release();

    assert_eq!(running.await.unwrap().unwrap(), TaskStatus::Cancelled);
    let stored = row(&h.store, &task.task_id);
    assert_eq!(stored.status, TaskStatus::Cancelled);
    assert!(stored.output_data.is_none());
    assert_eq!(h.ledger.charges_for(&task.task_id), 0);
    assert!(h.audit.lock().actions_for(&task.task_id).contains(&AuditAction::Discarded));
}

#[tokio::test]
async fn test_execution_timeout_marks_stuck() {
    let mut config = test_config();
    config.worker.execution_timeout_secs = 1;
    let h = harness_with(config, Arc::new(InMemoryStore::new()));
    let task = h.engine.submit(submission("alice", "hang"), now()).unwrap();

    let status = h.engine.supervisor().dispatch(&task.task_id, now()).await.unwrap();
    assert_eq!(status, TaskStatus::StuckTimeout);

    let stored = row(&h.store, &task.task_id);
    assert!(stored.error_message.unwrap().contains("timed out"));
    assert!(stored.completed_at.is_some());
    assert_eq!(h.engine.supervisor().active_count(), 0);
    assert!(h.audit.lock().actions_for(&task.task_id).contains(&AuditAction::TimedOut));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_claim_is_exclusive() {
    let h = harness();
    let task = h.engine.submit(submission("alice", "hold"), now()).unwrap();

    let engine = Arc::clone(&h.engine);
    let id = task.task_id.clone();
    let running = tokio::spawn(async move { engine.supervisor().dispatch(&id, now()).await });
    wait_for_status(&h.store, &task.task_id, TaskStatus::Processing).await;

    let second = h.engine.supervisor().dispatch(&task.task_id, now()).await;
    assert!(matches!(second, Err(EngineError::ConcurrencyConflict(_))));

    h.backend.release();
    assert_eq!(running.await.unwrap().unwrap(), TaskStatus::Completed);
    assert_eq!(h.backend.calls(), 1);

    let again = h.engine.supervisor().dispatch(&task.task_id, now()).await;
    assert!(matches!(again, Err(EngineError::ConcurrencyConflict(_))));
    assert_eq!(h.ledger.charges_for(&task.task_id), 1);
}
