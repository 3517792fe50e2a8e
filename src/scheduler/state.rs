use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{MapredError, Result};
use crate::scheduler::job::{
    Attempt, AttemptOutcome, Job, JobPhase, JobStats, Liveness, Task, TaskId, TaskKind, TaskState,
    WorkerInfo,
};

/// Everything a dispatcher needs to push one attempt to a worker.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub attempt_id: Uuid,
    pub task_id: TaskId,
    pub worker_id: String,
    pub endpoint: String,
    pub is_backup: bool,
    pub spec: TaskSpec,
}

#[derive(Debug, Clone)]
pub enum TaskSpec {
    Map {
        input_path: String,
        split: (u64, u64),
        mapper_ref: String,
        num_reduces: u32,
    },
    Reduce {
        num_maps: u32,
        reducer_ref: String,
        output_path: String,
    },
}

/// Best-effort immediate cancellation the caller should push to a worker.
#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub attempt_id: Uuid,
    pub worker_id: String,
    pub endpoint: String,
}

/// Outcome of the first phase of the commit protocol.
#[derive(Debug, Clone)]
pub enum CommitClaim {
    /// This attempt won the race; promote its temporaries, then call
    /// `finish_commit`.
    Claimed { task_id: TaskId, paths: CommitPaths },
    /// Another attempt already committed the task; the report is recorded
    /// as redundant and the temporaries must be discarded.
    Redundant,
    /// The task or its job is no longer interested (failed, cancelled).
    Obsolete,
}

/// Tmp -> canonical pairs the winner's output moves through.
#[derive(Debug, Clone)]
pub struct CommitPaths {
    pub renames: Vec<(String, String)>,
}

/// What `finish_commit` asks the caller to do next.
#[derive(Debug, Default)]
pub struct CommitEffects {
    /// Losing in-flight attempts to cancel right away.
    pub cancels: Vec<CancelRequest>,
    /// Set when the commit advanced its job into the reduce phase.
    pub phase_advanced: Option<Uuid>,
    /// Set when the commit completed its job.
    pub job_completed: Option<Uuid>,
}

#[derive(Debug, Default)]
pub struct SweepEffects {
    pub cancels: Vec<CancelRequest>,
}

#[derive(Debug, Default)]
pub struct MonitorEffects {
    /// Tasks for which a backup attempt was requested this tick.
    pub backups_requested: Vec<TaskId>,
    /// Attempts forced to TimedOut by their deadline; cancel them.
    pub cancels: Vec<CancelRequest>,
}

/// Counts surfaced by `GetJobStatus`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskCounts {
    pub pending: u32,
    pub running: u32,
    pub committed: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub phase: JobPhase,
    pub num_maps: u32,
    pub num_reduces: u32,
    pub map_counts: TaskCounts,
    pub reduce_counts: TaskCounts,
    pub failed_attempts: u32,
    pub error_message: Option<String>,
    pub completion_stats: JobStats,
}

/// Authoritative scheduler state. Owns every job, task, attempt and worker
/// record, all keyed by id. Methods are synchronous and never block on I/O;
/// the caller serialises them behind one lock, which also serialises the
/// per-task transitions the commit protocol depends on.
#[derive(Debug)]
pub struct SchedulerState {
    config: SchedulerConfig,
    jobs: HashMap<Uuid, Job>,
    tasks: HashMap<TaskId, Task>,
    attempts: HashMap<Uuid, Attempt>,
    workers: HashMap<String, WorkerInfo>,
    /// Per-job FIFO of pending tasks awaiting dispatch.
    ready: HashMap<Uuid, VecDeque<TaskId>>,
    /// Jobs in submission order; dispatch round-robins over this.
    job_order: Vec<Uuid>,
    rr_cursor: usize,
    /// Tasks awaiting a backup attempt, drained ahead of the ready queues.
    backup_queue: VecDeque<TaskId>,
    backup_requested: HashSet<TaskId>,
}

impl SchedulerState {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            jobs: HashMap::new(),
            tasks: HashMap::new(),
            attempts: HashMap::new(),
            workers: HashMap::new(),
            ready: HashMap::new(),
            job_order: Vec::new(),
            rr_cursor: 0,
            backup_queue: VecDeque::new(),
            backup_requested: HashSet::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Decompose a validated submission into tasks and enqueue the map
    /// phase. `line_count` was discovered from the input blob by the caller.
    pub fn submit_job(
        &mut self,
        input_path: String,
        output_path: String,
        mapper_ref: String,
        reducer_ref: String,
        num_maps: u32,
        num_reduces: u32,
        line_count: u64,
    ) -> Result<Uuid> {
        if num_maps < 1 || num_reduces < 1 {
            return Err(MapredError::BadRequest(
                "num_maps and num_reduces must both be at least 1".to_string(),
            ));
        }
        if mapper_ref.trim().is_empty() || reducer_ref.trim().is_empty() {
            return Err(MapredError::BadRequest(
                "mapper_ref and reducer_ref must be non-empty".to_string(),
            ));
        }

        let job = Job::new(
            input_path,
            output_path,
            mapper_ref,
            reducer_ref,
            num_maps,
            num_reduces,
        );
        let job_id = job.job_id;

        let m = u64::from(num_maps);
        let mut queue = VecDeque::with_capacity(num_maps as usize);
        for i in 0..num_maps {
            let start = u64::from(i) * line_count / m;
            let end = u64::from(i + 1) * line_count / m;
            let task = Task::new_map(job_id, i, (start, end));
            queue.push_back(task.task_id);
            self.tasks.insert(task.task_id, task);
        }
        // Reduce tasks exist from submission but are enqueued only once the
        // map phase fully commits.
        for i in 0..num_reduces {
            let task = Task::new_reduce(job_id, i);
            self.tasks.insert(task.task_id, task);
        }

        self.ready.insert(job_id, queue);
        self.job_order.push(job_id);
        self.jobs.insert(job_id, job);

        tracing::info!(
            job_id = %job_id,
            num_maps,
            num_reduces,
            line_count,
            "Job submitted"
        );
        Ok(job_id)
    }

    // ------------------------------------------------------------------
    // Status & inspection
    // ------------------------------------------------------------------

    pub fn job_status(&self, job_id: &Uuid) -> Result<JobStatus> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| MapredError::JobNotFound(job_id.to_string()))?;
        Ok(JobStatus {
            job_id: *job_id,
            phase: job.phase,
            num_maps: job.num_maps,
            num_reduces: job.num_reduces,
            map_counts: self.count_tasks(job, TaskKind::Map),
            reduce_counts: self.count_tasks(job, TaskKind::Reduce),
            failed_attempts: job.failed_attempts,
            error_message: job.error_message.clone(),
            completion_stats: job.completion_stats,
        })
    }

    fn count_tasks(&self, job: &Job, kind: TaskKind) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for i in 0..job.phase_width(kind) {
            let task_id = TaskId { job_id: job.job_id, kind, index: i };
            match self.tasks.get(&task_id).map(|t| t.state) {
                Some(TaskState::Pending) => counts.pending += 1,
                Some(TaskState::Running) => counts.running += 1,
                Some(TaskState::Committed) => counts.committed += 1,
                _ => {}
            }
        }
        counts
    }

    pub fn job(&self, job_id: &Uuid) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn attempt(&self, attempt_id: &Uuid) -> Option<&Attempt> {
        self.attempts.get(attempt_id)
    }

    pub fn attempts_of(&self, task_id: &TaskId) -> Vec<&Attempt> {
        self.tasks
            .get(task_id)
            .map(|t| {
                t.attempts
                    .iter()
                    .filter_map(|id| self.attempts.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn worker(&self, worker_id: &str) -> Option<&WorkerInfo> {
        self.workers.get(worker_id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerInfo> {
        self.workers.values()
    }

    // ------------------------------------------------------------------
    // Worker registration & heartbeat
    // ------------------------------------------------------------------

    pub fn register_worker(&mut self, worker_id: String, endpoint: String, capacity: u32) {
        match self.workers.get_mut(&worker_id) {
            Some(worker) => {
                // Re-registration after a restart or a Dead episode. Any
                // attempts the old incarnation held were already timed out
                // when it was declared Dead, or will reconcile away on the
                // next heartbeat.
                worker.endpoint = endpoint;
                worker.capacity = capacity.max(1);
                worker.last_heartbeat = Instant::now();
                worker.liveness = Liveness::Alive;
                tracing::info!(worker_id, "Worker re-registered");
            }
            None => {
                tracing::info!(worker_id, endpoint, capacity, "Worker registered");
                self.workers.insert(
                    worker_id.clone(),
                    WorkerInfo::new(worker_id, endpoint, capacity),
                );
            }
        }
    }

    /// Process one heartbeat: refresh liveness and reconcile the worker's
    /// reported in-flight set against the scheduler's accounting. Returns
    /// the attempt ids the worker must cancel.
    pub fn heartbeat(
        &mut self,
        worker_id: &str,
        endpoint: &str,
        capacity: u32,
        reported: &[Uuid],
    ) -> Vec<Uuid> {
        if !self.workers.contains_key(worker_id) {
            // First contact registers implicitly.
            self.register_worker(worker_id.to_string(), endpoint.to_string(), capacity);
        }

        let worker = self.workers.get_mut(worker_id).expect("just registered");
        worker.last_heartbeat = Instant::now();
        if worker.liveness != Liveness::Alive {
            tracing::info!(worker_id, liveness = %worker.liveness, "Worker back from the dead");
            worker.liveness = Liveness::Alive;
        }

        let reported_set: HashSet<Uuid> = reported.iter().copied().collect();
        let ours: Vec<Uuid> = worker.in_flight.iter().copied().collect();

        // Attempts we track but the worker no longer runs: the worker has
        // forgotten them (crash/restart). Cancel and re-dispatch.
        let forgotten: Vec<Uuid> = ours
            .iter()
            .filter(|id| !reported_set.contains(id))
            .copied()
            .collect();
        for attempt_id in forgotten {
            tracing::warn!(worker_id, attempt_id = %attempt_id, "Worker dropped an attempt; re-dispatching");
            self.conclude_attempt(attempt_id, AttemptOutcome::Cancelled, None);
        }

        // Attempts the worker runs but we no longer want (another attempt
        // committed, or the job died): tell the worker to kill them.
        let worker = self.workers.get_mut(worker_id).expect("still registered");
        let mut cancellations: Vec<Uuid> = reported_set
            .iter()
            .filter(|id| !worker.in_flight.contains(id))
            .copied()
            .collect();
        for id in worker.pending_cancellations.drain(..) {
            if !cancellations.contains(&id) {
                cancellations.push(id);
            }
        }
        cancellations
    }

    /// Liveness sweep: Suspect after `heartbeat_timeout` of silence, Dead
    /// after `dead_timeout`. A Dead worker's in-flight attempts time out and
    /// their tasks are re-enqueued (or their jobs failed, past
    /// `max_attempts`).
    pub fn sweep(&mut self, now: Instant) -> SweepEffects {
        let mut effects = SweepEffects::default();
        let worker_ids: Vec<String> = self.workers.keys().cloned().collect();
        for worker_id in worker_ids {
            let worker = self.workers.get_mut(&worker_id).expect("listed");
            let silence = now.saturating_duration_since(worker.last_heartbeat);
            if silence > self.config.dead_timeout && worker.liveness != Liveness::Dead {
                tracing::warn!(worker_id, ?silence, "Worker declared dead");
                worker.liveness = Liveness::Dead;
                let orphans: Vec<Uuid> = worker.in_flight.drain().collect();
                worker.pending_cancellations.clear();
                for attempt_id in orphans {
                    self.conclude_attempt(attempt_id, AttemptOutcome::TimedOut, None);
                }
            } else if silence > self.config.heartbeat_timeout
                && worker.liveness == Liveness::Alive
            {
                tracing::warn!(worker_id, ?silence, "Worker suspect; pausing dispatch to it");
                worker.liveness = Liveness::Suspect;
            }
        }

        // Cancelled attempts that never acknowledged within the grace
        // period: force them out and treat the worker as suspect.
        let overdue: Vec<Uuid> = self
            .attempts
            .values()
            .filter(|a| {
                a.is_in_flight()
                    && a.cancel_requested_at
                        .is_some_and(|at| now.saturating_duration_since(at) > self.config.cancel_grace)
            })
            .map(|a| a.attempt_id)
            .collect();
        for attempt_id in overdue {
            if let Some(attempt) = self.attempts.get(&attempt_id) {
                let worker_id = attempt.worker_id.clone();
                tracing::warn!(
                    attempt_id = %attempt_id,
                    worker_id,
                    "Cancellation unacknowledged past grace; marking worker suspect"
                );
                if let Some(worker) = self.workers.get_mut(&worker_id) {
                    if worker.liveness == Liveness::Alive {
                        worker.liveness = Liveness::Suspect;
                    }
                }
                if let Some(request) = self.cancel_request_for(attempt_id) {
                    effects.cancels.push(request);
                }
                self.conclude_attempt(attempt_id, AttemptOutcome::TimedOut, None);
            }
        }
        effects
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Decide the next batch of assignments. Backup attempts drain first
    /// (they unblock nearly-complete jobs); fresh tasks are served FIFO per
    /// job, round-robin across jobs. Attempts are recorded here; the caller
    /// pushes the Execute RPCs outside the state lock.
    pub fn next_assignments(&mut self) -> Vec<Assignment> {
        let mut assignments = Vec::new();

        // Backups first, each constrained to a worker no other attempt of
        // the task is running on. A backup with no eligible worker stays
        // queued; the original keeps running either way.
        let candidates: Vec<TaskId> = self.backup_queue.drain(..).collect();
        for task_id in candidates {
            self.backup_requested.remove(&task_id);
            if !self.backup_still_wanted(&task_id) {
                continue;
            }
            let exclude = self.in_flight_workers(&task_id);
            match self.pick_worker(&exclude) {
                Some(worker_id) => {
                    if let Some(assignment) = self.dispatch_to(task_id, &worker_id, true) {
                        assignments.push(assignment);
                    }
                }
                None => {
                    self.backup_queue.push_back(task_id);
                    self.backup_requested.insert(task_id);
                }
            }
        }

        // Fresh tasks, round-robin over jobs so a late job is not starved
        // behind an early wide one.
        let no_exclusions = HashSet::new();
        loop {
            let Some(worker_id) = self.pick_worker(&no_exclusions) else {
                break;
            };
            let Some(task_id) = self.pop_ready_task() else {
                break;
            };
            if let Some(assignment) = self.dispatch_to(task_id, &worker_id, false) {
                assignments.push(assignment);
            }
        }

        assignments
    }

    fn backup_still_wanted(&self, task_id: &TaskId) -> bool {
        let Some(task) = self.tasks.get(task_id) else {
            return false;
        };
        if task.state != TaskState::Running {
            return false;
        }
        let Some(job) = self.jobs.get(&task_id.job_id) else {
            return false;
        };
        if !job.is_active() {
            return false;
        }
        // At most two in-flight attempts, at most one of them a backup.
        let in_flight: Vec<&Attempt> = task
            .attempts
            .iter()
            .filter_map(|id| self.attempts.get(id))
            .filter(|a| a.is_in_flight())
            .collect();
        in_flight.len() == 1 && !in_flight.iter().any(|a| a.is_backup)
    }

    fn in_flight_workers(&self, task_id: &TaskId) -> HashSet<String> {
        self.tasks
            .get(task_id)
            .map(|t| {
                t.attempts
                    .iter()
                    .filter_map(|id| self.attempts.get(id))
                    .filter(|a| a.is_in_flight())
                    .map(|a| a.worker_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Least-loaded Alive worker with spare capacity, excluding `exclude`.
    fn pick_worker(&self, exclude: &HashSet<String>) -> Option<String> {
        self.workers
            .values()
            .filter(|w| w.liveness == Liveness::Alive)
            .filter(|w| w.has_spare_capacity())
            .filter(|w| !exclude.contains(&w.worker_id))
            .min_by_key(|w| w.in_flight.len())
            .map(|w| w.worker_id.clone())
    }

    /// Pop the next pending task, round-robin across jobs.
    fn pop_ready_task(&mut self) -> Option<TaskId> {
        let now = Instant::now();
        if self.job_order.is_empty() {
            return None;
        }
        for step in 0..self.job_order.len() {
            let slot = (self.rr_cursor + step) % self.job_order.len();
            let job_id = self.job_order[slot];
            let Some(queue) = self.ready.get_mut(&job_id) else {
                continue;
            };
            // Skip entries that became stale (task failed with its job) and
            // tasks not yet schedulable.
            while let Some(&front) = queue.front() {
                let schedulable = self
                    .tasks
                    .get(&front)
                    .map(|t| t.state == TaskState::Pending && t.earliest_schedulable_at <= now)
                    .unwrap_or(false);
                if schedulable {
                    let task_id = queue.pop_front().expect("front checked");
                    self.rr_cursor = (slot + 1) % self.job_order.len();
                    return Some(task_id);
                }
                let stale = self
                    .tasks
                    .get(&front)
                    .map(|t| t.state != TaskState::Pending)
                    .unwrap_or(true);
                if stale {
                    queue.pop_front();
                } else {
                    break; // pending but deferred; try the next job
                }
            }
        }
        None
    }

    fn dispatch_to(&mut self, task_id: TaskId, worker_id: &str, is_backup: bool) -> Option<Assignment> {
        let job = self.jobs.get(&task_id.job_id)?;
        let spec = match task_id.kind {
            TaskKind::Map => TaskSpec::Map {
                input_path: job.input_path.clone(),
                split: self.tasks.get(&task_id)?.split.unwrap_or((0, 0)),
                mapper_ref: job.mapper_ref.clone(),
                num_reduces: job.num_reduces,
            },
            TaskKind::Reduce => TaskSpec::Reduce {
                num_maps: job.num_maps,
                reducer_ref: job.reducer_ref.clone(),
                output_path: job.output_path.clone(),
            },
        };

        let endpoint = self.workers.get(worker_id)?.endpoint.clone();
        let attempt = Attempt::new(task_id, worker_id.to_string(), is_backup);
        let attempt_id = attempt.attempt_id;

        let task = self.tasks.get_mut(&task_id)?;
        task.state = TaskState::Running;
        task.attempts.push(attempt_id);
        self.attempts.insert(attempt_id, attempt);
        self.workers
            .get_mut(worker_id)
            .expect("endpoint read above")
            .in_flight
            .insert(attempt_id);

        tracing::info!(
            task_id = %task_id,
            attempt_id = %attempt_id,
            worker_id,
            is_backup,
            "Attempt dispatched"
        );
        Some(Assignment {
            attempt_id,
            task_id,
            worker_id: worker_id.to_string(),
            endpoint,
            is_backup,
            spec,
        })
    }

    /// The worker declined the assignment because its slots were busy (the
    /// window between an attempt settling scheduler-side and worker-side).
    /// Erase the attempt as if it was never dispatched; nothing counts
    /// against `max_attempts` and the worker stays in good standing.
    pub fn dispatch_deferred(&mut self, attempt_id: Uuid) {
        let Some(attempt) = self.attempts.remove(&attempt_id) else {
            return;
        };
        let task_id = attempt.task_id;
        if let Some(worker) = self.workers.get_mut(&attempt.worker_id) {
            worker.in_flight.remove(&attempt_id);
        }
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return;
        };
        task.attempts.retain(|id| *id != attempt_id);
        tracing::debug!(task_id = %task_id, "Dispatch deferred; worker slots busy");

        if attempt.is_backup {
            // The original is still running; the monitor will re-flag the
            // task if it keeps straggling.
            return;
        }
        let others_in_flight = task
            .attempts
            .iter()
            .any(|id| self.attempts.get(id).map(|a| a.is_in_flight()).unwrap_or(false));
        if task.state == TaskState::Running && !others_in_flight {
            let task = self.tasks.get_mut(&task_id).expect("fetched above");
            task.state = TaskState::Pending;
            task.earliest_schedulable_at = Instant::now();
            self.ready.entry(task_id.job_id).or_default().push_back(task_id);
        }
    }

    /// The Execute RPC for a freshly recorded assignment never reached the
    /// worker. Roll the attempt back and re-enqueue the task.
    pub fn dispatch_failed(&mut self, attempt_id: Uuid) {
        if let Some(attempt) = self.attempts.get(&attempt_id) {
            let worker_id = attempt.worker_id.clone();
            tracing::warn!(attempt_id = %attempt_id, worker_id, "Dispatch RPC failed");
            if let Some(worker) = self.workers.get_mut(&worker_id) {
                if worker.liveness == Liveness::Alive {
                    worker.liveness = Liveness::Suspect;
                }
            }
        }
        self.conclude_attempt(attempt_id, AttemptOutcome::TimedOut, None);
    }

    // ------------------------------------------------------------------
    // Commit protocol
    // ------------------------------------------------------------------

    /// Phase one: decide whether `attempt_id`'s Success report wins its
    /// task. The winner's temporaries are promoted by the caller (outside
    /// the lock), then `finish_commit` completes the transition. Losing and
    /// stale reports are settled here in full.
    pub fn try_claim_commit(&mut self, attempt_id: Uuid) -> Result<CommitClaim> {
        let attempt = self
            .attempts
            .get(&attempt_id)
            .ok_or_else(|| MapredError::AttemptNotFound(attempt_id.to_string()))?;
        if !attempt.is_in_flight() {
            // Already concluded (timed out, cancelled, or settled). A late
            // Success from a zombie attempt is no longer trusted.
            return Ok(CommitClaim::Obsolete);
        }
        let task_id = attempt.task_id;
        let task = self
            .tasks
            .get(&task_id)
            .ok_or_else(|| MapredError::Internal(format!("attempt {attempt_id} has no task")))?;

        match task.state {
            TaskState::Committed => {
                // Second Success of a race: record it, discard its output.
                self.settle_redundant(attempt_id, task_id);
                Ok(CommitClaim::Redundant)
            }
            TaskState::Failed => {
                self.conclude_attempt(attempt_id, AttemptOutcome::Cancelled, None);
                Ok(CommitClaim::Obsolete)
            }
            TaskState::Pending | TaskState::Running => {
                if let Some(current) = task.committing_attempt {
                    if current != attempt_id {
                        // The race partner claimed first, mid-promotion.
                        self.settle_redundant(attempt_id, task_id);
                    }
                    return Ok(CommitClaim::Redundant);
                }
                let job = self
                    .jobs
                    .get(&task_id.job_id)
                    .ok_or_else(|| MapredError::Internal(format!("task {task_id} has no job")))?;
                if !job.is_active() {
                    self.conclude_attempt(attempt_id, AttemptOutcome::Cancelled, None);
                    return Ok(CommitClaim::Obsolete);
                }
                let paths = self.commit_paths(&task_id, attempt_id, job);
                let task = self.tasks.get_mut(&task_id).expect("fetched above");
                task.committing_attempt = Some(attempt_id);
                Ok(CommitClaim::Claimed { task_id, paths })
            }
        }
    }

    fn settle_redundant(&mut self, attempt_id: Uuid, task_id: TaskId) {
        let settled = {
            let Some(attempt) = self.attempts.get_mut(&attempt_id) else {
                return;
            };
            if attempt.is_in_flight() {
                attempt.outcome = AttemptOutcome::Success;
                attempt.redundant = true;
                attempt.finished_at = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if settled {
            self.detach_from_worker(attempt_id);
            tracing::info!(
                task_id = %task_id,
                attempt_id = %attempt_id,
                "Redundant success; task already committed"
            );
        }
    }

    fn commit_paths(&self, task_id: &TaskId, attempt_id: Uuid, job: &Job) -> CommitPaths {
        let renames = match task_id.kind {
            TaskKind::Map => (0..job.num_reduces)
                .map(|r| {
                    let canonical =
                        crate::blobstore::intermediate_partition(job.job_id, task_id.index, r);
                    (crate::blobstore::tmp_path(&canonical, attempt_id), canonical)
                })
                .collect(),
            TaskKind::Reduce => {
                let canonical = crate::blobstore::output_partition(&job.output_path, task_id.index);
                vec![(crate::blobstore::tmp_path(&canonical, attempt_id), canonical)]
            }
        };
        CommitPaths { renames }
    }

    /// Phase two: the winner's output is canonical (or promotion failed).
    /// On success the task commits, the winner's stats fold into the job,
    /// losers are cancelled and the job phase advances when the commit was
    /// the last of its phase.
    pub fn finish_commit(
        &mut self,
        attempt_id: Uuid,
        promoted: bool,
        stats: JobStats,
    ) -> CommitEffects {
        let mut effects = CommitEffects::default();
        let Some(attempt) = self.attempts.get(&attempt_id) else {
            return effects;
        };
        let task_id = attempt.task_id;

        if !promoted {
            tracing::error!(task_id = %task_id, attempt_id = %attempt_id, "Promotion failed");
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.committing_attempt = None;
            }
            self.conclude_attempt(
                attempt_id,
                AttemptOutcome::Error,
                Some("blob store promotion failed".to_string()),
            );
            return effects;
        }

        // The job may have died while the promotion ran; a failed job never
        // gains committed tasks.
        let job_active = self
            .jobs
            .get(&task_id.job_id)
            .map(|j| j.is_active())
            .unwrap_or(false);
        if !job_active || self.tasks.get(&task_id).map(|t| t.state) == Some(TaskState::Failed) {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.committing_attempt = None;
            }
            self.conclude_attempt(attempt_id, AttemptOutcome::Cancelled, None);
            return effects;
        }

        let now = Instant::now();
        {
            let attempt = self.attempts.get_mut(&attempt_id).expect("checked above");
            attempt.outcome = AttemptOutcome::Success;
            attempt.finished_at = Some(now);
        }
        self.detach_from_worker(attempt_id);

        let commit_seq = {
            let job = self.jobs.get_mut(&task_id.job_id).expect("job outlives tasks");
            job.completion_stats.accumulate(stats);
            let seq = job.next_commit_seq;
            job.next_commit_seq += 1;
            seq
        };
        let losers: Vec<Uuid> = {
            let task = self.tasks.get_mut(&task_id).expect("task outlives attempts");
            task.state = TaskState::Committed;
            task.commit_seq = Some(commit_seq);
            task.attempts
                .iter()
                .filter(|id| **id != attempt_id)
                .copied()
                .collect()
        };
        tracing::info!(task_id = %task_id, attempt_id = %attempt_id, commit_seq, "Task committed");

        // Losing in-flight attempts: queue for the next heartbeat and hand
        // back best-effort immediate cancels.
        for loser in losers {
            let Some(loser_attempt) = self.attempts.get_mut(&loser) else {
                continue;
            };
            if !loser_attempt.is_in_flight() {
                continue;
            }
            loser_attempt.cancel_requested_at = Some(now);
            let worker_id = loser_attempt.worker_id.clone();
            if let Some(worker) = self.workers.get_mut(&worker_id) {
                worker.pending_cancellations.push(loser);
                effects.cancels.push(CancelRequest {
                    attempt_id: loser,
                    worker_id: worker_id.clone(),
                    endpoint: worker.endpoint.clone(),
                });
            }
        }

        self.advance_phase(task_id.job_id, &mut effects);
        effects
    }

    /// Advance the owning job when the committed task closed out its phase.
    fn advance_phase(&mut self, job_id: Uuid, effects: &mut CommitEffects) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        match job.phase {
            JobPhase::Map => {
                if self.all_committed(job_id, TaskKind::Map, job.num_maps) {
                    let job = self.jobs.get_mut(&job_id).expect("fetched above");
                    job.phase = JobPhase::Reduce;
                    let num_reduces = job.num_reduces;
                    tracing::info!(job_id = %job_id, "Map phase complete; entering reduce phase");
                    let queue = self.ready.entry(job_id).or_default();
                    for i in 0..num_reduces {
                        queue.push_back(TaskId::reduce(job_id, i));
                    }
                    effects.phase_advanced = Some(job_id);
                }
            }
            JobPhase::Reduce => {
                if self.all_committed(job_id, TaskKind::Reduce, job.num_reduces) {
                    let job = self.jobs.get_mut(&job_id).expect("fetched above");
                    job.phase = JobPhase::Completed;
                    job.completed_at = Some(Utc::now());
                    tracing::info!(job_id = %job_id, "Job completed");
                    self.retire_job(job_id);
                    effects.job_completed = Some(job_id);
                }
            }
            JobPhase::Completed | JobPhase::Failed => {}
        }
    }

    fn all_committed(&self, job_id: Uuid, kind: TaskKind, width: u32) -> bool {
        (0..width).all(|i| {
            self.tasks
                .get(&TaskId { job_id, kind, index: i })
                .map(|t| t.state == TaskState::Committed)
                .unwrap_or(false)
        })
    }

    // ------------------------------------------------------------------
    // Failure paths
    // ------------------------------------------------------------------

    /// Record a non-success completion (worker report, liveness sweep, or
    /// deadline enforcement all funnel here). Re-enqueues the task when no
    /// other attempt remains in flight, failing the job past `max_attempts`.
    pub fn conclude_attempt(
        &mut self,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        error_message: Option<String>,
    ) {
        let Some(attempt) = self.attempts.get_mut(&attempt_id) else {
            return;
        };
        if !attempt.is_in_flight() {
            // Cancellation and completion reports are idempotent.
            return;
        }
        attempt.outcome = outcome;
        attempt.finished_at = Some(Instant::now());
        attempt.error_message = error_message.clone();
        let task_id = attempt.task_id;
        self.detach_from_worker(attempt_id);

        if matches!(outcome, AttemptOutcome::Error | AttemptOutcome::TimedOut) {
            if let Some(job) = self.jobs.get_mut(&task_id.job_id) {
                job.failed_attempts += 1;
                if let Some(message) = &error_message {
                    job.error_message = Some(message.clone());
                }
            }
        }
        tracing::info!(task_id = %task_id, attempt_id = %attempt_id, ?outcome, "Attempt concluded");

        let Some(task) = self.tasks.get(&task_id) else {
            return;
        };
        if task.state != TaskState::Running {
            return;
        }
        // A surviving attempt (the race partner) keeps the task Running.
        let still_running = task
            .attempts
            .iter()
            .filter_map(|id| self.attempts.get(id))
            .any(|a| a.is_in_flight());
        if still_running {
            return;
        }

        let dispatches = task.attempts.len() as u32;
        if dispatches >= self.config.max_attempts {
            let message = error_message.unwrap_or_else(|| format!("task {task_id}: {outcome:?}"));
            self.fail_job(
                task_id.job_id,
                format!("task {task_id} failed after {dispatches} attempts: {message}"),
            );
            return;
        }

        let task = self.tasks.get_mut(&task_id).expect("fetched above");
        task.state = TaskState::Pending;
        task.earliest_schedulable_at = Instant::now();
        self.ready.entry(task_id.job_id).or_default().push_back(task_id);
        tracing::info!(task_id = %task_id, dispatches, "Task re-enqueued");
    }

    /// Fail a job and everything still pending or running under it. Other
    /// jobs are untouched.
    pub fn fail_job(&mut self, job_id: Uuid, message: String) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if !job.is_active() {
            return;
        }
        tracing::error!(job_id = %job_id, message, "Job failed");
        job.phase = JobPhase::Failed;
        job.completed_at = Some(Utc::now());
        if job.error_message.is_none() {
            job.error_message = Some(message);
        }

        let doomed: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| {
                t.task_id.job_id == job_id
                    && matches!(t.state, TaskState::Pending | TaskState::Running)
            })
            .map(|t| t.task_id)
            .collect();
        let now = Instant::now();
        for task_id in doomed {
            let task = self.tasks.get_mut(&task_id).expect("listed");
            task.state = TaskState::Failed;
            // In-flight attempts of the failed job get cancelled via the
            // next heartbeat.
            let in_flight: Vec<Uuid> = task
                .attempts
                .iter()
                .filter(|id| self.attempts.get(id).map(|a| a.is_in_flight()).unwrap_or(false))
                .copied()
                .collect();
            for attempt_id in in_flight {
                let attempt = self.attempts.get_mut(&attempt_id).expect("listed");
                attempt.cancel_requested_at = Some(now);
                let worker_id = attempt.worker_id.clone();
                if let Some(worker) = self.workers.get_mut(&worker_id) {
                    worker.pending_cancellations.push(attempt_id);
                }
            }
        }
        self.ready.remove(&job_id);
        self.retire_job(job_id);
    }

    fn retire_job(&mut self, job_id: Uuid) {
        self.job_order.retain(|id| *id != job_id);
        if self.job_order.is_empty() {
            self.rr_cursor = 0;
        } else {
            self.rr_cursor %= self.job_order.len();
        }
        self.backup_queue.retain(|t| t.job_id != job_id);
        self.backup_requested.retain(|t| t.job_id != job_id);
    }

    fn detach_from_worker(&mut self, attempt_id: Uuid) {
        let Some(attempt) = self.attempts.get(&attempt_id) else {
            return;
        };
        if let Some(worker) = self.workers.get_mut(&attempt.worker_id) {
            worker.in_flight.remove(&attempt_id);
            worker.pending_cancellations.retain(|id| *id != attempt_id);
        }
    }

    fn cancel_request_for(&self, attempt_id: Uuid) -> Option<CancelRequest> {
        let attempt = self.attempts.get(&attempt_id)?;
        let worker = self.workers.get(&attempt.worker_id)?;
        Some(CancelRequest {
            attempt_id,
            worker_id: worker.worker_id.clone(),
            endpoint: worker.endpoint.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Straggler monitor & deadlines
    // ------------------------------------------------------------------

    /// One monitor tick: per active job, establish the committed-duration
    /// baseline for the current phase, request backups for stragglers, and
    /// time out attempts past the hard deadline.
    pub fn straggler_scan(&mut self, now: Instant) -> MonitorEffects {
        let mut effects = MonitorEffects::default();
        let job_ids: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|j| j.is_active())
            .map(|j| j.job_id)
            .collect();

        for job_id in job_ids {
            let Some(job) = self.jobs.get(&job_id) else {
                continue;
            };
            let kind = match job.phase {
                JobPhase::Map => TaskKind::Map,
                JobPhase::Reduce => TaskKind::Reduce,
                _ => continue,
            };
            let width = job.phase_width(kind);

            let mut durations: Vec<f64> = (0..width)
                .filter_map(|i| self.tasks.get(&TaskId { job_id, kind, index: i }))
                .filter(|t| t.state == TaskState::Committed)
                .filter_map(|t| t.committing_attempt)
                .filter_map(|id| self.attempts.get(&id))
                .filter_map(|a| {
                    a.finished_at
                        .map(|end| end.saturating_duration_since(a.started_at).as_secs_f64())
                })
                .collect();

            // The median is only trusted once a quarter of the phase has
            // committed; tiny baselines would flag everything.
            if (durations.len() as f64) < f64::from(width) * self.config.min_baseline_ratio
                || durations.is_empty()
            {
                continue;
            }
            durations.sort_by(|a, b| a.partial_cmp(b).expect("durations are finite"));
            let median = durations[durations.len() / 2];
            let straggler_after = median * self.config.straggler_threshold;
            let deadline = median * self.config.task_deadline_factor;

            for i in 0..width {
                let task_id = TaskId { job_id, kind, index: i };
                let Some(task) = self.tasks.get(&task_id) else {
                    continue;
                };
                if task.state != TaskState::Running {
                    continue;
                }
                let in_flight: Vec<(Uuid, f64, bool)> = task
                    .attempts
                    .iter()
                    .filter_map(|id| self.attempts.get(id))
                    .filter(|a| a.is_in_flight())
                    .map(|a| {
                        (
                            a.attempt_id,
                            now.saturating_duration_since(a.started_at).as_secs_f64(),
                            a.is_backup,
                        )
                    })
                    .collect();

                // Hard deadline: treat like a straggler whose backup won,
                // then force the cancel.
                let mut timed_out = Vec::new();
                for (attempt_id, elapsed, _) in &in_flight {
                    if *elapsed > deadline {
                        timed_out.push(*attempt_id);
                    }
                }
                for attempt_id in timed_out {
                    tracing::warn!(task_id = %task_id, attempt_id = %attempt_id, "Attempt past deadline");
                    if let Some(request) = self.cancel_request_for(attempt_id) {
                        effects.cancels.push(request);
                    }
                    self.conclude_attempt(
                        attempt_id,
                        AttemptOutcome::TimedOut,
                        Some(format!("attempt exceeded deadline of {deadline:.1}s")),
                    );
                }

                // Backup request: a single straggling original, no backup
                // running, none already queued.
                let survivors: Vec<&(Uuid, f64, bool)> = in_flight
                    .iter()
                    .filter(|(id, _, _)| {
                        self.attempts.get(id).map(|a| a.is_in_flight()).unwrap_or(false)
                    })
                    .collect();
                let has_backup = survivors.iter().any(|(_, _, is_backup)| *is_backup);
                if has_backup || survivors.len() != 1 || self.backup_requested.contains(&task_id) {
                    continue;
                }
                let (_, elapsed, _) = survivors[0];
                if *elapsed > straggler_after {
                    tracing::warn!(
                        task_id = %task_id,
                        elapsed,
                        median,
                        "Straggler detected; requesting backup attempt"
                    );
                    self.backup_queue.push_back(task_id);
                    self.backup_requested.insert(task_id);
                    effects.backups_requested.push(task_id);
                }
            }
        }
        effects
    }
}
