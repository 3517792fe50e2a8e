//! Worker process: executes map and reduce attempts pushed by the
//! scheduler.
//!
//! - [`executor::TaskExecutor`] runs user code against the blob store
//! - [`service`] is the inbound gRPC surface (Execute*/CancelTask)
//! - [`heartbeat`] keeps the worker registered and delivers cancellations
//!
//! Each attempt runs on a spawned task holding a `CancellationToken`;
//! cancellation is cooperative and idempotent. Completion is reported via
//! the scheduler's `TaskCompleted` RPC, whose reply tells the worker to
//! promote or discard its temporary output.

pub mod executor;
pub mod heartbeat;
pub mod service;
pub mod udf;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use uuid::Uuid;

use crate::blobstore::BlobStore;
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::proto::scheduler_service_client::SchedulerServiceClient;
use crate::proto::{RegisterWorkerRequest, TaskCompletedRequest, TmpDisposition};
use crate::scheduler::job::AttemptOutcome;
use crate::worker::executor::{ExecutionResult, TaskExecutor};

pub use executor::{AttemptStats, MapTaskSpec, ReduceTaskSpec};

/// Result of asking for a task slot.
pub(crate) enum Admission {
    /// Slot taken; run the attempt with this token.
    Admitted(CancellationToken),
    /// The same attempt is already running here.
    Duplicate,
    /// Every slot is busy.
    Busy,
}

/// Shared worker-process state: slot accounting, cancellation tokens and
/// the scheduler client.
pub struct WorkerRuntime {
    config: WorkerConfig,
    executor: TaskExecutor,
    scheduler: RwLock<Option<SchedulerServiceClient<Channel>>>,
    in_flight: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Terminal outcomes, so a late `CancelTask` can answer idempotently.
    finished: Mutex<HashMap<Uuid, AttemptOutcome>>,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig) -> Self {
        let store = BlobStore::new(config.store_root.clone());
        let executor = TaskExecutor::new(
            store,
            config.simulate_straggler,
            config.straggler_delay,
        );
        Self {
            config,
            executor,
            scheduler: RwLock::new(None),
            in_flight: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub(crate) async fn scheduler_client(&self) -> Result<SchedulerServiceClient<Channel>> {
        if let Some(client) = self.scheduler.read().await.as_ref() {
            return Ok(client.clone());
        }
        let client =
            SchedulerServiceClient::connect(self.config.scheduler_endpoint.clone()).await?;
        *self.scheduler.write().await = Some(client.clone());
        Ok(client)
    }

    async fn drop_scheduler_client(&self) {
        *self.scheduler.write().await = None;
    }

    /// Register with the scheduler, retrying until it answers. The worker
    /// is useless until the scheduler knows its endpoint.
    pub async fn register(&self) {
        loop {
            match self.try_register().await {
                Ok(()) => {
                    tracing::info!(
                        worker_id = self.config.worker_id,
                        endpoint = self.config.advertise_endpoint,
                        "Registered with scheduler"
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Registration failed; retrying");
                    self.drop_scheduler_client().await;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn try_register(&self) -> Result<()> {
        let mut client = self.scheduler_client().await?;
        client
            .register_worker(RegisterWorkerRequest {
                worker_id: self.config.worker_id.clone(),
                endpoint: self.config.advertise_endpoint.clone(),
                capacity: self.config.capacity,
            })
            .await?;
        Ok(())
    }

    pub(crate) async fn in_flight_ids(&self) -> Vec<Uuid> {
        self.in_flight.lock().await.keys().copied().collect()
    }

    /// Admit an attempt into a slot.
    pub(crate) async fn admit(&self, attempt_id: Uuid) -> Admission {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains_key(&attempt_id) {
            // Duplicate dispatch of a running attempt; ack it but do not
            // run it twice.
            return Admission::Duplicate;
        }
        if in_flight.len() as u32 >= self.config.capacity {
            return Admission::Busy;
        }
        let token = CancellationToken::new();
        in_flight.insert(attempt_id, token.clone());
        Admission::Admitted(token)
    }

    /// Cancel an attempt. Idempotent: running attempts get their token
    /// cancelled, settled ones answer with their terminal outcome.
    pub(crate) async fn cancel(&self, attempt_id: Uuid) -> AttemptOutcome {
        if let Some(token) = self.in_flight.lock().await.get(&attempt_id) {
            token.cancel();
            return AttemptOutcome::Cancelled;
        }
        self.finished
            .lock()
            .await
            .get(&attempt_id)
            .copied()
            .unwrap_or(AttemptOutcome::Cancelled)
    }

    pub(crate) async fn cancel_many(&self, attempt_ids: &[Uuid]) {
        for attempt_id in attempt_ids {
            self.cancel(*attempt_id).await;
        }
    }

    /// Report a finished attempt and apply the scheduler's disposition to
    /// its temporaries. The slot is released only after the report settles,
    /// so heartbeats never under-report the in-flight set.
    pub(crate) async fn finish_attempt(&self, result: ExecutionResult) {
        let attempt_id = result.attempt_id;
        match self.report_completion(&result).await {
            Ok(TmpDisposition::Commit) => {
                self.executor.commit_outputs(&result.tmp_outputs).await;
            }
            Ok(_) => {
                self.executor.cleanup(&result.tmp_outputs).await;
            }
            Err(e) => {
                // The scheduler will reconcile via heartbeat or timeout;
                // leave the temporaries for the GC.
                tracing::warn!(
                    attempt_id = %attempt_id,
                    error = %e,
                    "Completion report failed"
                );
                self.drop_scheduler_client().await;
            }
        }
        self.finished.lock().await.insert(attempt_id, result.outcome);
        self.in_flight.lock().await.remove(&attempt_id);
    }

    async fn report_completion(&self, result: &ExecutionResult) -> Result<TmpDisposition> {
        let mut client = self.scheduler_client().await?;
        let response = client
            .task_completed(TaskCompletedRequest {
                worker_id: self.config.worker_id.clone(),
                attempt_id: result.attempt_id.to_string(),
                outcome: crate::grpc::outcome_to_proto(result.outcome) as i32,
                stats: Some(crate::proto::AttemptStats {
                    bytes_in: result.stats.bytes_in,
                    bytes_out: result.stats.bytes_out,
                    records_out: result.stats.records_out,
                }),
                error_message: result.error.clone().unwrap_or_default(),
            })
            .await?;
        Ok(response.into_inner().disposition())
    }

    pub(crate) fn executor(&self) -> &TaskExecutor {
        &self.executor
    }
}

/// Run a worker to completion: register, heartbeat, serve the task API.
pub async fn run(config: WorkerConfig, shutdown: CancellationToken) -> Result<()> {
    let runtime = Arc::new(WorkerRuntime::new(config));
    runtime.register().await;

    let heartbeat_runtime = runtime.clone();
    let heartbeat_shutdown = shutdown.clone();
    tokio::spawn(async move {
        heartbeat::run_heartbeat_loop(heartbeat_runtime, heartbeat_shutdown).await;
    });

    let listener = tokio::net::TcpListener::bind(runtime.config().listen_addr).await?;
    crate::grpc::server::run_worker_server(runtime, listener, shutdown).await
}
