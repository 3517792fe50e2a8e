use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::error::Result;
use crate::grpc::scheduler_service::SchedulerServiceImpl;
use crate::proto::scheduler_service_server::SchedulerServiceServer;
use crate::proto::worker_service_server::WorkerServiceServer;
use crate::scheduler::Scheduler;
use crate::worker::service::WorkerServiceImpl;
use crate::worker::WorkerRuntime;

/// Serve the scheduler's gRPC API on an already-bound listener (binding
/// first lets tests use an ephemeral port). Blocks until shutdown.
pub async fn run_scheduler_server(
    scheduler: Arc<Scheduler>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Starting scheduler gRPC server");
    Server::builder()
        .add_service(SchedulerServiceServer::new(SchedulerServiceImpl::new(
            scheduler,
        )))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Serve a worker's task API. Blocks until shutdown.
pub async fn run_worker_server(
    runtime: Arc<WorkerRuntime>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(
        worker_id = runtime.config().worker_id,
        addr = %listener.local_addr()?,
        "Starting worker gRPC server"
    );
    Server::builder()
        .add_service(WorkerServiceServer::new(WorkerServiceImpl::new(runtime)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
        .await?;
    Ok(())
}
