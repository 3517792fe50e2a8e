use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Scheduler process configuration. Every tuneable is named here so tests
/// can shrink the timing knobs without touching the state machine.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub listen_addr: SocketAddr,
    /// Optional read-only HTTP inspection endpoint.
    pub inspect_addr: Option<SocketAddr>,
    /// Root of the shared blob store.
    pub store_root: PathBuf,
    /// Dispatch loop tick.
    pub dispatch_interval: Duration,
    /// Liveness sweeper tick.
    pub sweep_interval: Duration,
    /// Silence after which a worker turns Suspect.
    pub heartbeat_timeout: Duration,
    /// Silence after which a worker turns Dead and its attempts time out.
    pub dead_timeout: Duration,
    /// Straggler monitor tick.
    pub check_interval: Duration,
    /// Backup launched once elapsed > threshold x median of committed durations.
    pub straggler_threshold: f64,
    /// Fraction of the phase that must be committed before the median is trusted.
    pub min_baseline_ratio: f64,
    /// Attempts per task before the task (and its job) fail.
    pub max_attempts: u32,
    /// A cancelled attempt must acknowledge within this grace period.
    pub cancel_grace: Duration,
    /// Per-attempt deadline = factor x median, once a baseline exists.
    pub task_deadline_factor: f64,
    /// Temporaries older than this are garbage-collected.
    pub tmp_gc_age: Duration,
    /// Tmp GC loop tick.
    pub tmp_gc_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:50051".parse().unwrap(),
            inspect_addr: None,
            store_root: PathBuf::from("/data"),
            dispatch_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(10),
            dead_timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(5),
            straggler_threshold: 1.5,
            min_baseline_ratio: 0.25,
            max_attempts: 3,
            cancel_grace: Duration::from_secs(10),
            task_deadline_factor: 5.0,
            tmp_gc_age: Duration::from_secs(3600),
            tmp_gc_interval: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn new(listen_addr: SocketAddr, store_root: PathBuf) -> Self {
        Self {
            listen_addr,
            store_root,
            ..Default::default()
        }
    }
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub listen_addr: SocketAddr,
    /// Endpoint the scheduler dials back for task dispatch.
    pub advertise_endpoint: String,
    pub scheduler_endpoint: String,
    pub store_root: PathBuf,
    /// Concurrent task slots.
    pub capacity: u32,
    pub heartbeat_interval: Duration,
    /// Inject a fixed delay before each task, to exercise backup execution.
    pub simulate_straggler: bool,
    pub straggler_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            listen_addr: "127.0.0.1:50052".parse().unwrap(),
            advertise_endpoint: "http://127.0.0.1:50052".to_string(),
            scheduler_endpoint: "http://127.0.0.1:50051".to_string(),
            store_root: PathBuf::from("/data"),
            capacity: 1,
            heartbeat_interval: Duration::from_secs(2),
            simulate_straggler: false,
            straggler_delay: Duration::from_secs(10),
        }
    }
}
