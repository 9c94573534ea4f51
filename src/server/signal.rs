// Signal handling module
//
// Supervisor:
// - SIGHUP:  Rolling restart of every worker
// - SIGTERM: Graceful shutdown
// - SIGINT:  Graceful shutdown (Ctrl+C)
// - SIGQUIT: Immediate shutdown
//
// Worker:
// - SIGTERM, SIGINT: Stop accepting and drain

use std::io;
use std::time::Duration;

use tokio::sync::watch;

use crate::supervisor::PoolHandle;

/// Install the supervisor's signal handlers.
///
/// Handlers are registered before returning, so a signal arriving right
/// after startup is not lost. `graceful` is the drain time for SIGTERM/SIGINT.
#[cfg(unix)]
pub fn spawn_supervisor_signals(handle: PoolHandle, graceful: Duration) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    tracing::debug!(
        "signal handlers registered (pid {}): HUP reload, TERM/INT graceful stop, QUIT immediate stop",
        std::process::id()
    );

    tokio::spawn(async move {
        loop {
            let grace = tokio::select! {
                _ = sighup.recv() => {
                    tracing::info!("SIGHUP received, restarting workers");
                    handle.reload();
                    continue;
                }
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, shutting down gracefully");
                    graceful
                }
                _ = sigint.recv() => {
                    tracing::info!("SIGINT received, shutting down gracefully");
                    graceful
                }
                _ = sigquit.recv() => {
                    tracing::info!("SIGQUIT received, shutting down immediately");
                    Duration::ZERO
                }
            };
            handle.shutdown(grace).await;
            break;
        }
    });
    Ok(())
}

/// Windows fallback - only handles Ctrl+C
#[cfg(not(unix))]
pub fn spawn_supervisor_signals(handle: PoolHandle, graceful: Duration) -> io::Result<()> {
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            tracing::info!("Ctrl+C received, shutting down gracefully");
            handle.shutdown(graceful).await;
        }
    });
    Ok(())
}

/// Install a worker's signal handlers; either signal flips `stop`.
#[cfg(unix)]
pub fn spawn_worker_signals(stop: watch::Sender<bool>) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received, draining"),
            _ = sigint.recv() => tracing::info!("SIGINT received, draining"),
        }
        stop.send_replace(true);
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn spawn_worker_signals(stop: watch::Sender<bool>) -> io::Result<()> {
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            stop.send_replace(true);
        }
    });
    Ok(())
}
