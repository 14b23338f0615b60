use tokio::signal::unix::{SignalKind, signal};

/// Wait for SIGTERM or SIGINT and return the name of the signal received.
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    tracing::info!(signal = received, "received shutdown signal, stopping workers");
    Ok(received)
}
