//! Test harness for scheduler + worker integration tests.
//!
//! Spawns a real scheduler gRPC server and N worker processes in-process,
//! all sharing a tempdir blob store and ephemeral localhost ports, with
//! timing knobs shrunk so liveness and straggler machinery fire in
//! milliseconds instead of seconds.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mapred_lite::blobstore::BlobStore;
use mapred_lite::client::SchedulerClient;
use mapred_lite::config::{SchedulerConfig, WorkerConfig};
use mapred_lite::grpc::server::{run_scheduler_server, run_worker_server};
use mapred_lite::proto::JobPhase as ProtoJobPhase;
use mapred_lite::scheduler::Scheduler;
use mapred_lite::worker::{heartbeat, WorkerRuntime};

/// Scheduler configuration with timing shrunk for tests. The task deadline
/// is effectively disabled: with sub-millisecond medians the production
/// factor would reap perfectly healthy attempts.
pub fn test_scheduler_config(store_root: &std::path::Path) -> SchedulerConfig {
    SchedulerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        inspect_addr: None,
        store_root: store_root.to_path_buf(),
        dispatch_interval: Duration::from_millis(20),
        sweep_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(500),
        dead_timeout: Duration::from_millis(1200),
        check_interval: Duration::from_millis(100),
        straggler_threshold: 1.5,
        min_baseline_ratio: 0.25,
        max_attempts: 3,
        cancel_grace: Duration::from_secs(2),
        task_deadline_factor: 1_000_000.0,
        tmp_gc_age: Duration::from_secs(3600),
        tmp_gc_interval: Duration::from_secs(3600),
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub capacity: u32,
    pub simulate_straggler: bool,
    pub straggler_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            capacity: 1,
            simulate_straggler: false,
            straggler_delay: Duration::from_secs(3),
        }
    }
}

/// Handle to one running in-process worker.
pub struct TestWorker {
    #[allow(dead_code)]
    pub worker_id: String,
    server_handle: JoinHandle<()>,
    heartbeat_handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl TestWorker {
    /// Stop the worker abruptly: its server and heartbeat die mid-flight,
    /// exactly like a crashed process as seen from the scheduler.
    pub fn kill(&self) {
        self.shutdown.cancel();
        self.server_handle.abort();
        self.heartbeat_handle.abort();
    }
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        self.kill();
    }
}

pub struct TestCluster {
    pub scheduler: Arc<Scheduler>,
    pub scheduler_endpoint: String,
    pub store: BlobStore,
    pub workers: HashMap<String, TestWorker>,
    shutdown: CancellationToken,
    next_worker: usize,
    store_dir: TempDir,
}

impl TestCluster {
    /// Start a scheduler and `num_workers` default workers.
    pub async fn start(num_workers: usize) -> Self {
        Self::start_custom(num_workers, |_| WorkerOptions::default(), |c| c).await
    }

    /// Start with per-worker options and a scheduler config override.
    pub async fn start_custom(
        num_workers: usize,
        worker_options: impl Fn(usize) -> WorkerOptions,
        configure: impl FnOnce(SchedulerConfig) -> SchedulerConfig,
    ) -> Self {
        let store_dir = TempDir::new().expect("tempdir");
        let config = configure(test_scheduler_config(store_dir.path()));
        let store = BlobStore::new(store_dir.path());
        let shutdown = CancellationToken::new();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind scheduler port");
        let addr = listener.local_addr().expect("local addr");
        let scheduler_endpoint = format!("http://{addr}");

        let scheduler = Arc::new(Scheduler::new(config));
        scheduler.spawn_loops(shutdown.clone());
        let server_scheduler = scheduler.clone();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_scheduler_server(server_scheduler, listener, server_shutdown).await
            {
                eprintln!("scheduler server error: {e}");
            }
        });

        // Give the server a moment to accept before workers register.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut cluster = Self {
            scheduler,
            scheduler_endpoint,
            store,
            workers: HashMap::new(),
            shutdown,
            next_worker: 0,
            store_dir,
        };
        for i in 0..num_workers {
            cluster.spawn_worker(worker_options(i)).await;
        }
        cluster
    }

    /// Spawn one more worker; returns its id.
    pub async fn spawn_worker(&mut self, options: WorkerOptions) -> String {
        self.next_worker += 1;
        let worker_id = format!("worker-{}", self.next_worker);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind worker port");
        let addr = listener.local_addr().expect("local addr");

        let config = WorkerConfig {
            worker_id: worker_id.clone(),
            listen_addr: addr,
            advertise_endpoint: format!("http://{addr}"),
            scheduler_endpoint: self.scheduler_endpoint.clone(),
            store_root: self.store_dir.path().to_path_buf(),
            capacity: options.capacity,
            heartbeat_interval: Duration::from_millis(100),
            simulate_straggler: options.simulate_straggler,
            straggler_delay: options.straggler_delay,
        };

        let runtime = Arc::new(WorkerRuntime::new(config));
        runtime.register().await;

        let worker_shutdown = self.shutdown.child_token();
        let heartbeat_runtime = runtime.clone();
        let heartbeat_shutdown = worker_shutdown.clone();
        let heartbeat_handle = tokio::spawn(async move {
            heartbeat::run_heartbeat_loop(heartbeat_runtime, heartbeat_shutdown).await;
        });
        let server_shutdown = worker_shutdown.clone();
        let server_handle = tokio::spawn(async move {
            if let Err(e) = run_worker_server(runtime, listener, server_shutdown).await {
                eprintln!("worker server error: {e}");
            }
        });

        self.workers.insert(
            worker_id.clone(),
            TestWorker {
                worker_id: worker_id.clone(),
                server_handle,
                heartbeat_handle,
                shutdown: worker_shutdown,
            },
        );
        worker_id
    }

    /// Crash a worker. The scheduler only finds out through silence.
    pub fn kill_worker(&mut self, worker_id: &str) {
        if let Some(worker) = self.workers.remove(worker_id) {
            worker.kill();
        }
    }

    pub async fn client(&self) -> SchedulerClient {
        SchedulerClient::connect(self.scheduler_endpoint.clone())
            .await
            .expect("connect client")
    }

    pub async fn upload(&self, remote_path: &str, contents: &[u8]) {
        self.store
            .write(remote_path, contents)
            .await
            .expect("upload blob");
    }

    pub async fn submit(
        &self,
        input: &str,
        output: &str,
        mapper: &str,
        reducer: &str,
        num_maps: u32,
        num_reduces: u32,
    ) -> Uuid {
        self.client()
            .await
            .submit(
                input.to_string(),
                output.to_string(),
                mapper.to_string(),
                reducer.to_string(),
                num_maps,
                num_reduces,
            )
            .await
            .expect("submit job")
    }

    /// Wait until the job reaches `phase`, polling over gRPC.
    pub async fn wait_for_phase(
        &self,
        job_id: Uuid,
        phase: ProtoJobPhase,
        timeout: Duration,
    ) -> bool {
        let mut client = self.client().await;
        let start = tokio::time::Instant::now();
        loop {
            let reached = client
                .status(job_id)
                .await
                .map(|s| s.phase() == phase)
                .unwrap_or(false);
            if reached {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Read all committed output partitions, parse `key\tvalue` lines, and
    /// return them sorted by key.
    pub async fn read_output(&self, output_path: &str, num_reduces: u32) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for r in 0..num_reduces {
            let path = mapred_lite::blobstore::output_partition(output_path, r);
            let contents = self
                .store
                .read_to_string(&path)
                .await
                .unwrap_or_else(|e| panic!("missing output partition {path}: {e}"));
            for line in contents.lines() {
                let (key, value) = line.split_once('\t').expect("tab-separated output line");
                pairs.push((key.to_string(), value.to_string()));
            }
        }
        pairs.sort();
        pairs
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(
    mut condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if condition().await {
            return true;
        }
        if start.elapsed() >= timeout_duration {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Assert a condition eventually becomes true.
#[allow(dead_code)]
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
