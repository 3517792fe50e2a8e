use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::proto::HeartbeatRequest;
use crate::worker::WorkerRuntime;

/// Heartbeat loop: report the in-flight attempt set every interval and
/// apply whatever cancellations come back. Registration data rides along
/// so a worker the scheduler declared dead re-registers seamlessly.
pub async fn run_heartbeat_loop(runtime: Arc<WorkerRuntime>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(runtime.config().heartbeat_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let in_flight = runtime.in_flight_ids().await;
        let request = HeartbeatRequest {
            worker_id: runtime.config().worker_id.clone(),
            endpoint: runtime.config().advertise_endpoint.clone(),
            capacity: runtime.config().capacity,
            in_flight_ids: in_flight.iter().map(Uuid::to_string).collect(),
        };

        let mut client = match runtime.scheduler_client().await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "Heartbeat skipped; scheduler unreachable");
                continue;
            }
        };
        match client.heartbeat(request).await {
            Ok(response) => {
                let cancellations: Vec<Uuid> = response
                    .into_inner()
                    .cancellations
                    .iter()
                    .filter_map(|id| Uuid::parse_str(id).ok())
                    .collect();
                if !cancellations.is_empty() {
                    tracing::info!(count = cancellations.len(), "Heartbeat carried cancellations");
                    runtime.cancel_many(&cancellations).await;
                }
            }
            Err(status) => {
                tracing::warn!(status = %status, "Heartbeat failed");
            }
        }
    }
    tracing::debug!("Heartbeat loop stopped");
}
