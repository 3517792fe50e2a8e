//! Read-only HTTP inspection endpoint.
//!
//! Serves the scheduler's view of jobs and workers as JSON, for operators
//! and tests. Strictly a window: nothing here mutates state.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::state::JobStatus;
use crate::scheduler::Scheduler;

#[derive(Debug, Serialize)]
struct WorkerView {
    worker_id: String,
    endpoint: String,
    capacity: u32,
    in_flight: usize,
    liveness: String,
}

pub fn router(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:job_id", get(get_job))
        .route("/workers", get(list_workers))
        .with_state(scheduler)
}

async fn list_jobs(State(scheduler): State<Arc<Scheduler>>) -> Json<Vec<JobStatus>> {
    let state = scheduler.state();
    let state = state.read().await;
    let mut jobs: Vec<JobStatus> = state
        .jobs()
        .filter_map(|job| state.job_status(&job.job_id).ok())
        .collect();
    jobs.sort_by_key(|status| status.job_id);
    Json(jobs)
}

async fn get_job(
    State(scheduler): State<Arc<Scheduler>>,
    Path(job_id): Path<Uuid>,
) -> std::result::Result<Json<JobStatus>, StatusCode> {
    scheduler
        .job_status(&job_id)
        .await
        .map(Json)
        .map_err(|_| StatusCode::NOT_FOUND)
}

async fn list_workers(State(scheduler): State<Arc<Scheduler>>) -> Json<Vec<WorkerView>> {
    let state = scheduler.state();
    let state = state.read().await;
    let mut workers: Vec<WorkerView> = state
        .workers()
        .map(|w| WorkerView {
            worker_id: w.worker_id.clone(),
            endpoint: w.endpoint.clone(),
            capacity: w.capacity,
            in_flight: w.in_flight.len(),
            liveness: w.liveness.to_string(),
        })
        .collect();
    workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    Json(workers)
}

/// Serve the inspection endpoint until shutdown.
pub async fn run_inspect_server(
    scheduler: Arc<Scheduler>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Starting inspection endpoint");
    axum::serve(listener, router(scheduler))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
