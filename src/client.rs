//! Client-side helpers behind the CLI: submit, status, upload, results.

use std::path::Path;
use std::time::Duration;

use tonic::transport::Channel;
use uuid::Uuid;

use crate::error::{MapredError, Result};
use crate::proto::scheduler_service_client::SchedulerServiceClient;
use crate::proto::{
    GetJobStatusRequest, GetJobStatusResponse, GetResultsRequest, JobPhase, SubmitJobRequest,
    UploadBlobRequest,
};

pub struct SchedulerClient {
    inner: SchedulerServiceClient<Channel>,
}

impl SchedulerClient {
    pub async fn connect(endpoint: String) -> Result<Self> {
        let inner = SchedulerServiceClient::connect(endpoint).await?;
        Ok(Self { inner })
    }

    pub async fn submit(
        &mut self,
        input: String,
        output: String,
        mapper: String,
        reducer: String,
        num_maps: u32,
        num_reduces: u32,
    ) -> Result<Uuid> {
        let response = self
            .inner
            .submit_job(SubmitJobRequest {
                input_path: input,
                output_path: output,
                mapper_ref: mapper,
                reducer_ref: reducer,
                num_maps,
                num_reduces,
            })
            .await?
            .into_inner();
        Uuid::parse_str(&response.job_id)
            .map_err(|_| MapredError::Internal("scheduler returned a malformed job id".to_string()))
    }

    pub async fn status(&mut self, job_id: Uuid) -> Result<GetJobStatusResponse> {
        Ok(self
            .inner
            .get_job_status(GetJobStatusRequest {
                job_id: job_id.to_string(),
            })
            .await?
            .into_inner())
    }

    /// Poll the job until it reaches a terminal phase, reporting progress
    /// through `on_status`. Returns the final status.
    pub async fn follow(
        &mut self,
        job_id: Uuid,
        poll_interval: Duration,
        mut on_status: impl FnMut(&GetJobStatusResponse),
    ) -> Result<GetJobStatusResponse> {
        loop {
            let status = self.status(job_id).await?;
            on_status(&status);
            if matches!(status.phase(), JobPhase::Completed | JobPhase::Failed) {
                return Ok(status);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub async fn upload(&mut self, local: &Path, remote: String) -> Result<()> {
        let contents = tokio::fs::read(local).await?;
        self.upload_bytes(contents, remote).await
    }

    pub async fn upload_bytes(&mut self, contents: Vec<u8>, remote: String) -> Result<()> {
        self.inner
            .upload_blob(UploadBlobRequest {
                remote_path: remote,
                contents,
            })
            .await?;
        Ok(())
    }

    /// Fetch committed output lines, up to `limit` (0 = all).
    pub async fn results(&mut self, output_path: String, limit: u32) -> Result<Vec<String>> {
        let mut stream = self
            .inner
            .get_results(GetResultsRequest { output_path, limit })
            .await?
            .into_inner();
        let mut lines = Vec::new();
        while let Some(result) = stream.message().await? {
            lines.push(result.line);
        }
        Ok(lines)
    }
}
