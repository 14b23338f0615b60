use anyhow::Context;

use mailledger_infra::config::Settings;
use mailledger_worker::roster::{Collaborators, build_manager, session_factory};
use mailledger_worker::shutdown::wait_for_signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("MAILLEDGER_LOG_FORMAT").is_ok_and(|f| f == "pretty") {
        mailledger_observability::init_pretty();
    } else {
        mailledger_observability::init();
    }

    let settings = Settings::from_env();

    let sessions = {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || session_factory(&settings)).await??
    };

    tracing::warn!("domain collaborators not configured; claimed jobs will fail and back off");
    let manager = build_manager(&settings, sessions, &Collaborators::unconfigured());

    manager.start_all();
    manager.spawn_monitor().context("failed to start worker monitor")?;
    tracing::info!(
        workers = manager.status().total_workers,
        persistent = settings.use_persistent_stores,
        "worker system running"
    );

    wait_for_signal().await.context("failed to install signal handlers")?;

    let stopping = manager.clone();
    tokio::task::spawn_blocking(move || stopping.stop_all()).await?;

    let status = serde_json::to_string(&manager.status())?;
    tracing::info!(status = %status, "worker system stopped");
    Ok(())
}
