use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::scheduler::Scheduler;

/// Liveness sweeper: Suspect after `heartbeat_timeout`, Dead after
/// `dead_timeout`. Dead workers' attempts time out inside the sweep; any
/// forced cancels are pushed best-effort here.
pub async fn run_sweep_loop(scheduler: Arc<Scheduler>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(scheduler.config().sweep_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let effects = scheduler.state().write().await.sweep(Instant::now());
        scheduler.clients().spawn_cancels(effects.cancels);
    }
    tracing::debug!("Sweep loop stopped");
}

/// Straggler monitor: per active job, compare in-flight attempts against
/// the committed-duration median and queue backup attempts; attempts past
/// the hard deadline are timed out and cancelled.
pub async fn run_straggler_loop(scheduler: Arc<Scheduler>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(scheduler.config().check_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let effects = scheduler.state().write().await.straggler_scan(Instant::now());
        for task_id in &effects.backups_requested {
            tracing::info!(task_id = %task_id, "Backup attempt queued");
        }
        scheduler.clients().spawn_cancels(effects.cancels);
    }
    tracing::debug!("Straggler monitor stopped");
}

/// Garbage-collect temporaries that outlived `tmp_gc_age` (losing attempts
/// that never got their discard, crashed workers, failed jobs).
pub async fn run_gc_loop(scheduler: Arc<Scheduler>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(scheduler.config().tmp_gc_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match scheduler
            .store()
            .gc_tmp("/data", scheduler.config().tmp_gc_age)
            .await
        {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Collected stale temporaries"),
            Err(e) => tracing::warn!(error = %e, "Temporary GC pass failed"),
        }
    }
    tracing::debug!("Tmp GC loop stopped");
}
