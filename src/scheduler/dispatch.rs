use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::proto::worker_service_client::WorkerServiceClient;
use crate::proto::{CancelTaskRequest, ExecuteMapTaskRequest, ExecuteReduceTaskRequest};
use crate::scheduler::state::{Assignment, CancelRequest, TaskSpec};
use crate::scheduler::Scheduler;

/// Why an Execute push did not land.
#[derive(Debug)]
pub enum DispatchError {
    /// The worker is healthy but its slots are busy; try again later.
    Busy,
    /// The worker is unreachable or rejected the call outright.
    Failed(String),
}

/// Cached gRPC channels to worker endpoints. Channels are cheap to clone;
/// one per endpoint is plenty.
#[derive(Debug, Clone, Default)]
pub struct WorkerClients {
    inner: Arc<RwLock<HashMap<String, WorkerServiceClient<Channel>>>>,
}

impl WorkerClients {
    async fn client(&self, endpoint: &str) -> Result<WorkerServiceClient<Channel>, tonic::transport::Error> {
        if let Some(client) = self.inner.read().await.get(endpoint) {
            return Ok(client.clone());
        }
        let client = WorkerServiceClient::connect(endpoint.to_string()).await?;
        self.inner
            .write()
            .await
            .insert(endpoint.to_string(), client.clone());
        Ok(client)
    }

    /// Drop a cached channel after a failed call so the next dispatch
    /// re-dials instead of reusing a broken connection.
    async fn evict(&self, endpoint: &str) {
        self.inner.write().await.remove(endpoint);
    }

    /// Push one assignment to its worker. Errors bubble up so the caller
    /// can roll the attempt back or defer it.
    pub async fn execute(&self, assignment: &Assignment) -> Result<(), DispatchError> {
        let mut client = self
            .client(&assignment.endpoint)
            .await
            .map_err(|e| DispatchError::Failed(e.to_string()))?;
        let result = match &assignment.spec {
            TaskSpec::Map {
                input_path,
                split,
                mapper_ref,
                num_reduces,
            } => client
                .execute_map_task(ExecuteMapTaskRequest {
                    job_id: assignment.task_id.job_id.to_string(),
                    task_index: assignment.task_id.index,
                    attempt_id: assignment.attempt_id.to_string(),
                    input_path: input_path.clone(),
                    split_start: split.0,
                    split_end: split.1,
                    mapper_ref: mapper_ref.clone(),
                    num_reduces: *num_reduces,
                })
                .await
                .map(|_| ()),
            TaskSpec::Reduce {
                num_maps,
                reducer_ref,
                output_path,
            } => client
                .execute_reduce_task(ExecuteReduceTaskRequest {
                    job_id: assignment.task_id.job_id.to_string(),
                    task_index: assignment.task_id.index,
                    attempt_id: assignment.attempt_id.to_string(),
                    num_maps: *num_maps,
                    reducer_ref: reducer_ref.clone(),
                    output_path: output_path.clone(),
                })
                .await
                .map(|_| ()),
        };
        match result {
            Ok(()) => Ok(()),
            Err(status) if status.code() == tonic::Code::ResourceExhausted => {
                Err(DispatchError::Busy)
            }
            Err(status) => {
                self.evict(&assignment.endpoint).await;
                Err(DispatchError::Failed(status.to_string()))
            }
        }
    }

    /// Fire-and-forget a batch of cancels. Connecting to a dead endpoint
    /// can hang, so none of this runs on an RPC reply path or a loop tick.
    pub fn spawn_cancels(&self, requests: Vec<CancelRequest>) {
        if requests.is_empty() {
            return;
        }
        let clients = self.clone();
        tokio::spawn(async move {
            for request in requests {
                clients.cancel_attempt(request).await;
            }
        });
    }

    /// Best-effort immediate cancel; heartbeat reconciliation is the
    /// reliable path, so failures are only logged.
    pub async fn cancel_attempt(&self, request: CancelRequest) {
        let Ok(mut client) = self.client(&request.endpoint).await else {
            tracing::debug!(
                worker_id = request.worker_id,
                attempt_id = %request.attempt_id,
                "Cancel skipped; worker unreachable"
            );
            return;
        };
        if let Err(status) = client
            .cancel_task(CancelTaskRequest {
                attempt_id: request.attempt_id.to_string(),
            })
            .await
        {
            tracing::debug!(
                worker_id = request.worker_id,
                attempt_id = %request.attempt_id,
                status = %status,
                "Immediate cancel failed; heartbeat will deliver it"
            );
            self.evict(&request.endpoint).await;
        }
    }
}

/// Dispatch loop: every tick, take the next batch of assignments under the
/// state lock, then push the Execute RPCs outside it. A failed push rolls
/// the attempt back so the task is retried elsewhere.
pub async fn run_dispatch_loop(scheduler: Arc<Scheduler>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(scheduler.config().dispatch_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let assignments = scheduler.state().write().await.next_assignments();
        for assignment in assignments {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                match scheduler.clients().execute(&assignment).await {
                    Ok(()) => {}
                    Err(DispatchError::Busy) => {
                        scheduler
                            .state()
                            .write()
                            .await
                            .dispatch_deferred(assignment.attempt_id);
                    }
                    Err(DispatchError::Failed(error)) => {
                        tracing::warn!(
                            task_id = %assignment.task_id,
                            worker_id = assignment.worker_id,
                            error,
                            "Dispatch failed; rolling attempt back"
                        );
                        scheduler
                            .state()
                            .write()
                            .await
                            .dispatch_failed(assignment.attempt_id);
                    }
                }
            });
        }
    }
    tracing::debug!("Dispatch loop stopped");
}
