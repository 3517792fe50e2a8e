//! The scheduling core: job/task/attempt state, dispatch, liveness,
//! straggler detection and the commit protocol.
//!
//! All authoritative state lives in [`state::SchedulerState`] behind one
//! `RwLock`; the async methods here take the lock, apply a synchronous
//! transition, and perform any RPC or blob-store I/O outside it.

pub mod dispatch;
pub mod job;
pub mod monitor;
pub mod state;

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::blobstore::BlobStore;
use crate::config::SchedulerConfig;
use crate::error::{MapredError, Result};
use crate::scheduler::dispatch::WorkerClients;
use crate::scheduler::job::{AttemptOutcome, JobStats};
use crate::scheduler::state::{CommitClaim, JobStatus, SchedulerState};

/// What the reporting worker should do with its temporary output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Commit,
    Discard,
}

/// The scheduler singleton: owns the state machine, the blob store handle
/// and the worker client pool shared by every loop and RPC handler.
pub struct Scheduler {
    state: Arc<RwLock<SchedulerState>>,
    store: BlobStore,
    clients: WorkerClients,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(SchedulerState::new(config.clone()))),
            store: BlobStore::new(config.store_root.clone()),
            clients: WorkerClients::default(),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Shared state handle, for the inspection endpoint and tests.
    pub fn state(&self) -> Arc<RwLock<SchedulerState>> {
        self.state.clone()
    }

    /// Validate a submission against the blob store and decompose it into
    /// tasks. The input must exist so the line count (and with it every map
    /// split) is fixed at submission time.
    pub async fn submit_job(
        &self,
        input_path: String,
        output_path: String,
        mapper_ref: String,
        reducer_ref: String,
        num_maps: u32,
        num_reduces: u32,
    ) -> Result<Uuid> {
        if !self.store.exists(&input_path).await {
            return Err(MapredError::BadRequest(format!(
                "input path '{input_path}' does not exist"
            )));
        }
        let line_count = self.store.line_count(&input_path).await?;
        self.state.write().await.submit_job(
            input_path,
            output_path,
            mapper_ref,
            reducer_ref,
            num_maps,
            num_reduces,
            line_count,
        )
    }

    pub async fn job_status(&self, job_id: &Uuid) -> Result<JobStatus> {
        self.state.read().await.job_status(job_id)
    }

    pub async fn register_worker(&self, worker_id: String, endpoint: String, capacity: u32) {
        self.state
            .write()
            .await
            .register_worker(worker_id, endpoint, capacity);
    }

    pub async fn heartbeat(
        &self,
        worker_id: &str,
        endpoint: &str,
        capacity: u32,
        in_flight: &[Uuid],
    ) -> Vec<Uuid> {
        self.state
            .write()
            .await
            .heartbeat(worker_id, endpoint, capacity, in_flight)
    }

    /// Handle a worker's completion report. For the winning Success report
    /// this runs the two-phase commit: claim under the lock, promote the
    /// temporaries against the store, then finish under the lock. The
    /// returned disposition goes back in the RPC reply.
    pub async fn task_completed(
        &self,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        stats: JobStats,
        error_message: Option<String>,
    ) -> Result<Disposition> {
        match outcome {
            AttemptOutcome::Success => {
                let claim = match self.state.write().await.try_claim_commit(attempt_id) {
                    Ok(claim) => claim,
                    Err(MapredError::AttemptNotFound(_)) => {
                        // A report from a past life (scheduler restarted or
                        // the attempt was erased); the temporaries are junk.
                        return Ok(Disposition::Discard);
                    }
                    Err(e) => return Err(e),
                };
                match claim {
                    CommitClaim::Claimed { task_id, paths } => {
                        let mut promoted = true;
                        for (tmp, canonical) in &paths.renames {
                            if let Err(e) = self.store.promote(tmp, canonical).await {
                                tracing::error!(
                                    task_id = %task_id,
                                    tmp,
                                    canonical,
                                    error = %e,
                                    "Failed to promote attempt output"
                                );
                                promoted = false;
                                break;
                            }
                        }
                        let effects = self
                            .state
                            .write()
                            .await
                            .finish_commit(attempt_id, promoted, stats);
                        // Best-effort immediate cancels for the losing
                        // attempts, off the reply path; heartbeat
                        // reconciliation is the backstop.
                        self.clients.spawn_cancels(effects.cancels);
                        if promoted {
                            Ok(Disposition::Commit)
                        } else {
                            Ok(Disposition::Discard)
                        }
                    }
                    CommitClaim::Redundant | CommitClaim::Obsolete => Ok(Disposition::Discard),
                }
            }
            AttemptOutcome::InFlight => Err(MapredError::BadRequest(
                "a completion report must carry a terminal outcome".to_string(),
            )),
            other => {
                self.state
                    .write()
                    .await
                    .conclude_attempt(attempt_id, other, error_message);
                Ok(Disposition::Discard)
            }
        }
    }

    /// Spawn the background loops: dispatch, liveness sweep, straggler
    /// monitor and tmp GC. They all drain when `shutdown` fires.
    pub fn spawn_loops(self: &Arc<Self>, shutdown: CancellationToken) {
        tokio::spawn(dispatch::run_dispatch_loop(self.clone(), shutdown.clone()));
        tokio::spawn(monitor::run_sweep_loop(self.clone(), shutdown.clone()));
        tokio::spawn(monitor::run_straggler_loop(self.clone(), shutdown.clone()));
        tokio::spawn(monitor::run_gc_loop(self.clone(), shutdown));
    }

    pub(crate) fn clients(&self) -> &WorkerClients {
        &self.clients
    }
}
