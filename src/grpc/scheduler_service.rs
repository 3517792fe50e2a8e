use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::grpc::{outcome_from_proto, phase_to_proto};
use crate::proto::scheduler_service_server::SchedulerService;
use crate::proto::{
    GetJobStatusRequest, GetJobStatusResponse, GetResultsRequest, HeartbeatRequest,
    HeartbeatResponse, RegisterWorkerRequest, RegisterWorkerResponse, ResultLine,
    SubmitJobRequest, SubmitJobResponse, TaskCompletedRequest, TaskCompletedResponse, TaskCounts,
    TmpDisposition, UploadBlobRequest, UploadBlobResponse,
};
use crate::scheduler::{Disposition, Scheduler};

/// gRPC surface of the scheduler: the client API (submit/status/results/
/// upload) and the worker API (register/heartbeat/completed).
pub struct SchedulerServiceImpl {
    scheduler: Arc<Scheduler>,
}

impl SchedulerServiceImpl {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

fn parse_uuid(value: &str, what: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(value).map_err(|_| Status::invalid_argument(format!("invalid {what}")))
}

fn counts_to_proto(counts: crate::scheduler::state::TaskCounts) -> TaskCounts {
    TaskCounts {
        pending: counts.pending,
        running: counts.running,
        committed: counts.committed,
    }
}

#[tonic::async_trait]
impl SchedulerService for SchedulerServiceImpl {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let req = request.into_inner();
        let job_id = self
            .scheduler
            .submit_job(
                req.input_path,
                req.output_path,
                req.mapper_ref,
                req.reducer_ref,
                req.num_maps,
                req.num_reduces,
            )
            .await
            .map_err(|e| e.into_status())?;
        Ok(Response::new(SubmitJobResponse {
            job_id: job_id.to_string(),
        }))
    }

    async fn get_job_status(
        &self,
        request: Request<GetJobStatusRequest>,
    ) -> Result<Response<GetJobStatusResponse>, Status> {
        let job_id = parse_uuid(&request.into_inner().job_id, "job ID")?;
        let status = self
            .scheduler
            .job_status(&job_id)
            .await
            .map_err(|e| e.into_status())?;
        Ok(Response::new(GetJobStatusResponse {
            job_id: status.job_id.to_string(),
            phase: phase_to_proto(status.phase) as i32,
            num_maps: status.num_maps,
            num_reduces: status.num_reduces,
            map_counts: Some(counts_to_proto(status.map_counts)),
            reduce_counts: Some(counts_to_proto(status.reduce_counts)),
            failed_attempts: status.failed_attempts,
            error_message: status.error_message,
        }))
    }

    type GetResultsStream = ReceiverStream<Result<ResultLine, Status>>;

    async fn get_results(
        &self,
        request: Request<GetResultsRequest>,
    ) -> Result<Response<Self::GetResultsStream>, Status> {
        let req = request.into_inner();
        let store = self.scheduler.store().clone();
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let limit = if req.limit == 0 {
                usize::MAX
            } else {
                req.limit as usize
            };
            let mut sent = 0usize;
            let files = match store.list(&req.output_path).await {
                Ok(files) => files,
                Err(e) => {
                    let _ = tx.send(Err(e.into_status())).await;
                    return;
                }
            };
            for file in files {
                // Only committed output partitions; temporaries stay hidden.
                let name = file.rsplit('/').next().unwrap_or(&file);
                if !name.starts_with("reduce-") || !name.ends_with(".txt") {
                    continue;
                }
                let contents = match store.read_to_string(&file).await {
                    Ok(contents) => contents,
                    Err(e) => {
                        let _ = tx.send(Err(e.into_status())).await;
                        return;
                    }
                };
                for line in contents.lines() {
                    if sent >= limit {
                        return;
                    }
                    if tx
                        .send(Ok(ResultLine {
                            line: line.to_string(),
                        }))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    sent += 1;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn upload_blob(
        &self,
        request: Request<UploadBlobRequest>,
    ) -> Result<Response<UploadBlobResponse>, Status> {
        let req = request.into_inner();
        if req.remote_path.trim().is_empty() {
            return Err(Status::invalid_argument("remote path must be non-empty"));
        }
        self.scheduler
            .store()
            .write(&req.remote_path, &req.contents)
            .await
            .map_err(|e| e.into_status())?;
        tracing::info!(
            remote_path = req.remote_path,
            bytes = req.contents.len(),
            "Blob uploaded"
        );
        Ok(Response::new(UploadBlobResponse {}))
    }

    async fn register_worker(
        &self,
        request: Request<RegisterWorkerRequest>,
    ) -> Result<Response<RegisterWorkerResponse>, Status> {
        let req = request.into_inner();
        if req.worker_id.trim().is_empty() || req.endpoint.trim().is_empty() {
            return Err(Status::invalid_argument(
                "worker_id and endpoint must be non-empty",
            ));
        }
        self.scheduler
            .register_worker(req.worker_id, req.endpoint, req.capacity)
            .await;
        Ok(Response::new(RegisterWorkerResponse {}))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let in_flight: Vec<Uuid> = req
            .in_flight_ids
            .iter()
            .map(|id| parse_uuid(id, "attempt ID"))
            .collect::<Result<_, _>>()?;
        let cancellations = self
            .scheduler
            .heartbeat(&req.worker_id, &req.endpoint, req.capacity, &in_flight)
            .await;
        Ok(Response::new(HeartbeatResponse {
            cancellations: cancellations.iter().map(Uuid::to_string).collect(),
        }))
    }

    async fn task_completed(
        &self,
        request: Request<TaskCompletedRequest>,
    ) -> Result<Response<TaskCompletedResponse>, Status> {
        let req = request.into_inner();
        let attempt_id = parse_uuid(&req.attempt_id, "attempt ID")?;
        let outcome = outcome_from_proto(req.outcome());
        let stats = req
            .stats
            .map(|s| crate::scheduler::job::JobStats {
                bytes_in: s.bytes_in,
                bytes_out: s.bytes_out,
                records_out: s.records_out,
            })
            .unwrap_or_default();
        let error_message = if req.error_message.is_empty() {
            None
        } else {
            Some(req.error_message)
        };

        let disposition = self
            .scheduler
            .task_completed(attempt_id, outcome, stats, error_message)
            .await
            .map_err(|e| e.into_status())?;
        let disposition = match disposition {
            Disposition::Commit => TmpDisposition::Commit,
            Disposition::Discard => TmpDisposition::Discard,
        };
        Ok(Response::new(TaskCompletedResponse {
            disposition: disposition as i32,
        }))
    }
}
