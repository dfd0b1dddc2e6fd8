//! Worker and maintenance loops.
//!
//! Every loop selects on the engine's shutdown token so
//! [`TaskEngine::shutdown`] stops them all.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;

use crate::core::{EngineResult, Spawn, SweepReport, TaskEngine};
use crate::util::clock;

/// Run startup recovery, then spawn the worker pool and the recompute and
/// sweep loops. Returns the recovery report.
pub fn start_engine<S: Spawn>(engine: &Arc<TaskEngine>, spawner: &S) -> EngineResult<SweepReport> {
    let report = engine.recover_on_startup(clock::now())?;

    let cfg = engine.config();
    for worker_id in 0..cfg.worker.worker_count {
        spawner.spawn(run_worker(Arc::clone(engine), worker_id));
    }
    spawner.spawn(run_periodic(
        Arc::clone(engine),
        "position_recompute",
        Duration::from_secs(cfg.queue.recompute_interval_secs),
        |engine, now| engine.recompute_positions(now).map(|_| ()),
    ));
    spawner.spawn(run_periodic(
        Arc::clone(engine),
        "recent_sweep",
        Duration::from_secs(cfg.reconciler.recent_sweep_interval_secs),
        |engine, now| engine.sweep_recent(now).map(|_| ()),
    ));
    spawner.spawn(run_periodic(
        Arc::clone(engine),
        "full_sweep",
        Duration::from_secs(cfg.reconciler.full_sweep_interval_secs),
        |engine, now| engine.sweep_full(now).map(|_| ()),
    ));

    tracing::info!(workers = cfg.worker.worker_count, "engine started");
    Ok(report)
}

/// Worker loop: drain the pending queue, then sleep until new work is
/// signalled, the idle period passes, or the engine shuts down.
pub async fn run_worker(engine: Arc<TaskEngine>, worker_id: usize) {
    let cancel = engine.shutdown_token();
    let idle = Duration::from_millis(engine.config().worker.idle_poll_ms);
    tracing::debug!(worker_id, "worker started");

    loop {
        loop {
            match engine.run_next().await {
                Ok(Some((task_id, status))) => {
                    tracing::debug!(worker_id, task_id = %task_id, status = %status, "execution finished");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "dispatch failed");
                    break;
                }
            }
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = engine.work_ready() => {}
            () = tokio::time::sleep(idle) => {}
        }
    }
    tracing::debug!(worker_id, "worker exiting");
}

async fn run_periodic<F>(engine: Arc<TaskEngine>, name: &'static str, every: Duration, tick: F)
where
    F: Fn(&TaskEngine, DateTime<Utc>) -> EngineResult<()> + Send + 'static,
{
    let cancel = engine.shutdown_token();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(task = name, "background loop stopping");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = tick(&engine, clock::now()) {
                    tracing::warn!(task = name, error = %e, "background pass failed");
                }
            }
        }
    }
}
