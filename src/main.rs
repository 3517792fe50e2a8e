use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mapred_lite::client::SchedulerClient;
use mapred_lite::config::{SchedulerConfig, WorkerConfig};
use mapred_lite::grpc::server::run_scheduler_server;
use mapred_lite::inspect::run_inspect_server;
use mapred_lite::proto::{GetJobStatusResponse, JobPhase};
use mapred_lite::scheduler::Scheduler;
use mapred_lite::shutdown::install_shutdown_handler;
use mapred_lite::worker;

#[derive(Parser, Debug)]
#[command(name = "mapred-lite")]
#[command(about = "A MapReduce job scheduler with speculative backup execution")]
struct Cli {
    /// Scheduler endpoint used by the client commands
    #[arg(long, global = true, default_value = "http://127.0.0.1:50051")]
    scheduler: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler process
    Scheduler {
        /// gRPC listen address
        #[arg(long, default_value = "0.0.0.0:50051")]
        listen: SocketAddr,

        /// Optional read-only HTTP inspection address
        #[arg(long)]
        inspect: Option<SocketAddr>,

        /// Root directory of the shared blob store
        #[arg(long, default_value = "/data")]
        store_root: PathBuf,
    },

    /// Run a worker process
    Worker {
        /// Unique worker id, e.g. "worker-1"
        #[arg(long)]
        id: String,

        /// gRPC listen address for task dispatch
        #[arg(long, default_value = "0.0.0.0:50052")]
        listen: SocketAddr,

        /// Endpoint the scheduler should dial back (defaults to the listen
        /// address)
        #[arg(long)]
        advertise: Option<String>,

        /// Root directory of the shared blob store
        #[arg(long, default_value = "/data")]
        store_root: PathBuf,

        /// Concurrent task slots
        #[arg(long, default_value = "1")]
        capacity: u32,

        /// Inject a fixed delay before each task (straggler testing)
        #[arg(long)]
        simulate_straggler: bool,

        /// Injected delay in seconds
        #[arg(long, default_value = "10")]
        straggler_delay_secs: u64,
    },

    /// Submit a MapReduce job
    Submit {
        #[arg(long)]
        input: String,
        #[arg(long)]
        output: String,
        #[arg(long)]
        mapper: String,
        #[arg(long)]
        reducer: String,
        #[arg(long, default_value = "4")]
        num_maps: u32,
        #[arg(long, default_value = "2")]
        num_reduces: u32,
        /// Follow the job until it completes or fails
        #[arg(long)]
        follow: bool,
    },

    /// Check job status
    Status {
        job_id: String,
        #[arg(long)]
        follow: bool,
    },

    /// Upload a local file into the shared blob store
    Upload { local: PathBuf, remote: String },

    /// Print committed job results
    Results {
        output_path: String,
        #[arg(long)]
        limit: Option<u32>,
    },
}

fn print_status(status: &GetJobStatusResponse) {
    let map = status.map_counts.clone().unwrap_or_default();
    let reduce = status.reduce_counts.clone().unwrap_or_default();
    println!(
        "Job {}: {:?} (map {}/{}, reduce {}/{}, failed attempts {})",
        status.job_id,
        status.phase(),
        map.committed,
        status.num_maps,
        reduce.committed,
        status.num_reduces,
        status.failed_attempts,
    );
    if let Some(error) = &status.error_message {
        println!("  error: {error}");
    }
}

/// Follow a job to its terminal phase; exit code 0 only on Completed.
async fn follow_job(client: &mut SchedulerClient, job_id: Uuid) -> Result<(), Box<dyn std::error::Error>> {
    let finished = client
        .follow(job_id, Duration::from_secs(2), print_status)
        .await?;
    if finished.phase() != JobPhase::Completed {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_scheduler(
    listen: SocketAddr,
    inspect: Option<SocketAddr>,
    store_root: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = SchedulerConfig {
        listen_addr: listen,
        inspect_addr: inspect,
        store_root,
        ..Default::default()
    };
    tracing::info!(listen = %config.listen_addr, store_root = %config.store_root.display(), "Starting scheduler");

    let scheduler = Arc::new(Scheduler::new(config.clone()));
    let shutdown = install_shutdown_handler();
    scheduler.spawn_loops(shutdown.clone());

    if let Some(inspect_addr) = config.inspect_addr {
        let inspect_listener = tokio::net::TcpListener::bind(inspect_addr).await?;
        let inspect_scheduler = scheduler.clone();
        let inspect_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) =
                run_inspect_server(inspect_scheduler, inspect_listener, inspect_shutdown).await
            {
                tracing::error!(error = %e, "Inspection endpoint failed");
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    run_scheduler_server(scheduler, listener, shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Scheduler {
            listen,
            inspect,
            store_root,
        } => run_scheduler(listen, inspect, store_root).await?,

        Command::Worker {
            id,
            listen,
            advertise,
            store_root,
            capacity,
            simulate_straggler,
            straggler_delay_secs,
        } => {
            let config = WorkerConfig {
                worker_id: id,
                listen_addr: listen,
                advertise_endpoint: advertise.unwrap_or_else(|| format!("http://{listen}")),
                scheduler_endpoint: cli.scheduler,
                store_root,
                capacity,
                heartbeat_interval: Duration::from_secs(2),
                simulate_straggler,
                straggler_delay: Duration::from_secs(straggler_delay_secs),
            };
            tracing::info!(
                worker_id = config.worker_id,
                listen = %config.listen_addr,
                simulate_straggler = config.simulate_straggler,
                "Starting worker"
            );
            let shutdown = install_shutdown_handler();
            worker::run(config, shutdown).await?;
        }

        Command::Submit {
            input,
            output,
            mapper,
            reducer,
            num_maps,
            num_reduces,
            follow,
        } => {
            let mut client = SchedulerClient::connect(cli.scheduler).await?;
            let job_id = client
                .submit(input, output, mapper, reducer, num_maps, num_reduces)
                .await?;
            println!("Submitted job {job_id}");
            if follow {
                follow_job(&mut client, job_id).await?;
            }
        }

        Command::Status { job_id, follow } => {
            let job_id: Uuid = job_id.parse()?;
            let mut client = SchedulerClient::connect(cli.scheduler).await?;
            if follow {
                follow_job(&mut client, job_id).await?;
            } else {
                print_status(&client.status(job_id).await?);
            }
        }

        Command::Upload { local, remote } => {
            let mut client = SchedulerClient::connect(cli.scheduler).await?;
            client.upload(&local, remote.clone()).await?;
            println!("Uploaded {} to {remote}", local.display());
        }

        Command::Results { output_path, limit } => {
            let mut client = SchedulerClient::connect(cli.scheduler).await?;
            let lines = client.results(output_path, limit.unwrap_or(0)).await?;
            for line in &lines {
                println!("{line}");
            }
            println!("{} total results", lines.len());
        }
    }

    Ok(())
}
