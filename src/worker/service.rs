use std::sync::Arc;

use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::proto::worker_service_server::WorkerService;
use crate::proto::{
    CancelTaskRequest, CancelTaskResponse, ExecuteMapTaskRequest, ExecuteReduceTaskRequest,
    ExecuteTaskAck,
};
use crate::worker::executor::{MapTaskSpec, ReduceTaskSpec};
use crate::worker::{Admission, WorkerRuntime};

/// Inbound task API. Execute RPCs admit the attempt into a slot and ack;
/// the attempt itself runs on a spawned task and reports back to the
/// scheduler when it settles.
pub struct WorkerServiceImpl {
    runtime: Arc<WorkerRuntime>,
}

impl WorkerServiceImpl {
    pub fn new(runtime: Arc<WorkerRuntime>) -> Self {
        Self { runtime }
    }
}

fn parse_uuid(value: &str, what: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(value).map_err(|_| Status::invalid_argument(format!("invalid {what}")))
}

#[tonic::async_trait]
impl WorkerService for WorkerServiceImpl {
    async fn execute_map_task(
        &self,
        request: Request<ExecuteMapTaskRequest>,
    ) -> Result<Response<ExecuteTaskAck>, Status> {
        let req = request.into_inner();
        let job_id = parse_uuid(&req.job_id, "job ID")?;
        let attempt_id = parse_uuid(&req.attempt_id, "attempt ID")?;

        let cancel = match self.runtime.admit(attempt_id).await {
            Admission::Admitted(token) => token,
            Admission::Duplicate => {
                return Ok(Response::new(ExecuteTaskAck {
                    attempt_id: req.attempt_id,
                }))
            }
            Admission::Busy => {
                return Err(Status::resource_exhausted("all task slots are busy"))
            }
        };

        let spec = MapTaskSpec {
            job_id,
            task_index: req.task_index,
            attempt_id,
            input_path: req.input_path,
            split: (req.split_start, req.split_end),
            mapper_ref: req.mapper_ref,
            num_reduces: req.num_reduces,
        };
        tracing::info!(
            job_id = %job_id,
            task_index = spec.task_index,
            attempt_id = %attempt_id,
            "Map task accepted"
        );

        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let result = runtime.executor().execute_map(spec, cancel).await;
            runtime.finish_attempt(result).await;
        });

        Ok(Response::new(ExecuteTaskAck {
            attempt_id: req.attempt_id,
        }))
    }

    async fn execute_reduce_task(
        &self,
        request: Request<ExecuteReduceTaskRequest>,
    ) -> Result<Response<ExecuteTaskAck>, Status> {
        let req = request.into_inner();
        let job_id = parse_uuid(&req.job_id, "job ID")?;
        let attempt_id = parse_uuid(&req.attempt_id, "attempt ID")?;

        let cancel = match self.runtime.admit(attempt_id).await {
            Admission::Admitted(token) => token,
            Admission::Duplicate => {
                return Ok(Response::new(ExecuteTaskAck {
                    attempt_id: req.attempt_id,
                }))
            }
            Admission::Busy => {
                return Err(Status::resource_exhausted("all task slots are busy"))
            }
        };

        let spec = ReduceTaskSpec {
            job_id,
            task_index: req.task_index,
            attempt_id,
            num_maps: req.num_maps,
            reducer_ref: req.reducer_ref,
            output_path: req.output_path,
        };
        tracing::info!(
            job_id = %job_id,
            task_index = spec.task_index,
            attempt_id = %attempt_id,
            "Reduce task accepted"
        );

        let runtime = self.runtime.clone();
        tokio::spawn(async move {
            let result = runtime.executor().execute_reduce(spec, cancel).await;
            runtime.finish_attempt(result).await;
        });

        Ok(Response::new(ExecuteTaskAck {
            attempt_id: req.attempt_id,
        }))
    }

    async fn cancel_task(
        &self,
        request: Request<CancelTaskRequest>,
    ) -> Result<Response<CancelTaskResponse>, Status> {
        let req = request.into_inner();
        let attempt_id = parse_uuid(&req.attempt_id, "attempt ID")?;
        let outcome = self.runtime.cancel(attempt_id).await;
        tracing::info!(attempt_id = %attempt_id, ?outcome, "Cancel requested");
        Ok(Response::new(CancelTaskResponse {
            attempt_id: req.attempt_id,
            outcome: crate::grpc::outcome_to_proto(outcome) as i32,
        }))
    }
}
