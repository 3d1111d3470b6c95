//! Host termination signals for process-level runtimes.
//!
//! Only [`crate::runtime::ProcessRuntime`] and the remote daemon wait on
//! these. A thread-backed unit shares its host process and must leave signal
//! disposition to the host.

/// Completes on SIGINT, SIGTERM or SIGQUIT (Ctrl-C elsewhere).
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => tracing::debug!("Received SIGINT"),
        _ = sigterm.recv() => tracing::debug!("Received SIGTERM"),
        _ = sigquit.recv() => tracing::debug!("Received SIGQUIT"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
