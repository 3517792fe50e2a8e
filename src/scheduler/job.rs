use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobPhase {
    Map,
    Reduce,
    Completed,
    Failed,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Map => write!(f, "map"),
            JobPhase::Reduce => write!(f, "reduce"),
            JobPhase::Completed => write!(f, "completed"),
            JobPhase::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TaskKind {
    Map,
    Reduce,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Map => write!(f, "map"),
            TaskKind::Reduce => write!(f, "reduce"),
        }
    }
}

/// Task identity: (job, kind, index). Tasks and attempts live in owning
/// collections keyed by id; parents are referenced by id, never by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId {
    pub job_id: Uuid,
    pub kind: TaskKind,
    pub index: u32,
}

impl TaskId {
    pub fn map(job_id: Uuid, index: u32) -> Self {
        Self { job_id, kind: TaskKind::Map, index }
    }

    pub fn reduce(job_id: Uuid, index: u32) -> Self {
        Self { job_id, kind: TaskKind::Reduce, index }
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.job_id, self.kind, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Pending,
    Running,
    Committed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
    InFlight,
    Success,
    Error,
    Cancelled,
    TimedOut,
}

/// One dispatch of a task to a worker.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub attempt_id: Uuid,
    pub task_id: TaskId,
    pub worker_id: String,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
    pub outcome: AttemptOutcome,
    pub is_backup: bool,
    /// Set on the losing Success report of a commit race.
    pub redundant: bool,
    /// When the scheduler asked the worker to cancel this attempt; the
    /// sweeper escalates if no acknowledgement lands within the grace.
    pub cancel_requested_at: Option<Instant>,
    pub error_message: Option<String>,
}

impl Attempt {
    pub fn new(task_id: TaskId, worker_id: String, is_backup: bool) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            task_id,
            worker_id,
            started_at: Instant::now(),
            finished_at: None,
            outcome: AttemptOutcome::InFlight,
            is_backup,
            redundant: false,
            cancel_requested_at: None,
            error_message: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.outcome == AttemptOutcome::InFlight
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Attempt ids in dispatch order; the attempts themselves live in the
    /// scheduler's owning map.
    pub attempts: Vec<Uuid>,
    /// The single Success attempt once the task commits.
    pub committing_attempt: Option<Uuid>,
    /// Half-open input line range, map tasks only.
    pub split: Option<(u64, u64)>,
    /// Commit order within the job, assigned when the task commits.
    pub commit_seq: Option<u64>,
    /// Dispatch holds off until this instant (reset on re-enqueue).
    pub earliest_schedulable_at: Instant,
}

impl Task {
    pub fn new_map(job_id: Uuid, index: u32, split: (u64, u64)) -> Self {
        Self {
            task_id: TaskId::map(job_id, index),
            state: TaskState::Pending,
            attempts: Vec::new(),
            committing_attempt: None,
            split: Some(split),
            commit_seq: None,
            earliest_schedulable_at: Instant::now(),
        }
    }

    pub fn new_reduce(job_id: Uuid, index: u32) -> Self {
        Self {
            task_id: TaskId::reduce(job_id, index),
            state: TaskState::Pending,
            attempts: Vec::new(),
            committing_attempt: None,
            split: None,
            commit_seq: None,
            earliest_schedulable_at: Instant::now(),
        }
    }
}

/// Byte and record totals accumulated from committing attempts.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JobStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub records_out: u64,
}

impl JobStats {
    pub fn accumulate(&mut self, other: JobStats) {
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.records_out += other.records_out;
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    pub input_path: String,
    pub output_path: String,
    pub mapper_ref: String,
    pub reducer_ref: String,
    pub num_maps: u32,
    pub num_reduces: u32,
    pub phase: JobPhase,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// First failure surfaced to the client once the job fails.
    pub error_message: Option<String>,
    /// Monotone counter ordering commits within this job.
    pub next_commit_seq: u64,
    /// Total attempts that finished with Error or TimedOut.
    pub failed_attempts: u32,
    /// Totals from committing attempts only.
    pub completion_stats: JobStats,
}

impl Job {
    pub fn new(
        input_path: String,
        output_path: String,
        mapper_ref: String,
        reducer_ref: String,
        num_maps: u32,
        num_reduces: u32,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            input_path,
            output_path,
            mapper_ref,
            reducer_ref,
            num_maps,
            num_reduces,
            phase: JobPhase::Map,
            submitted_at: Utc::now(),
            completed_at: None,
            error_message: None,
            next_commit_seq: 0,
            failed_attempts: 0,
            completion_stats: JobStats::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, JobPhase::Map | JobPhase::Reduce)
    }

    /// Number of tasks in the given phase.
    pub fn phase_width(&self, kind: TaskKind) -> u32 {
        match kind {
            TaskKind::Map => self.num_maps,
            TaskKind::Reduce => self.num_reduces,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Liveness {
    Alive,
    Suspect,
    Dead,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Liveness::Alive => write!(f, "alive"),
            Liveness::Suspect => write!(f, "suspect"),
            Liveness::Dead => write!(f, "dead"),
        }
    }
}

/// Scheduler-side view of one worker process.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub endpoint: String,
    pub capacity: u32,
    pub in_flight: HashSet<Uuid>,
    pub last_heartbeat: Instant,
    pub liveness: Liveness,
    /// Attempt ids to hand back in the next heartbeat reply.
    pub pending_cancellations: Vec<Uuid>,
}

impl WorkerInfo {
    pub fn new(worker_id: String, endpoint: String, capacity: u32) -> Self {
        Self {
            worker_id,
            endpoint,
            capacity: capacity.max(1),
            in_flight: HashSet::new(),
            last_heartbeat: Instant::now(),
            liveness: Liveness::Alive,
            pending_cancellations: Vec::new(),
        }
    }

    pub fn has_spare_capacity(&self) -> bool {
        (self.in_flight.len() as u32) < self.capacity
    }
}
