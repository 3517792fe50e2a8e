use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// The first signal cancels the returned token; the dispatch, sweep,
/// straggler-monitor and GC loops and the gRPC servers all watch it and
/// drain. A second signal skips the drain and exits immediately, since a
/// worker sitting in a long task (or a simulated straggler nap) can
/// otherwise hold the process open.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        let name = wait_for_signal(&mut sigterm, &mut sigint).await;
        tracing::info!(signal = name, "Shutdown requested; draining loops and servers");
        token_clone.cancel();

        let name = wait_for_signal(&mut sigterm, &mut sigint).await;
        tracing::warn!(signal = name, "Second signal; exiting without draining");
        std::process::exit(130);
    });

    token
}

async fn wait_for_signal(sigterm: &mut Signal, sigint: &mut Signal) -> &'static str {
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}
