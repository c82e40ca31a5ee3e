//! Interrupt handling for the two cancellation modes.

use box_core::cancel::CancellationCoordinator;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Cancel everything and wait for every released runner to finish.
///
/// Returns once each runner's operation has dropped its guard, i.e. after
/// the engine adapters have had a chance to remove their containers.
pub async fn cancel_and_wait(coordinator: &CancellationCoordinator) {
    let runners = coordinator.trigger();
    tracing::debug!(runners = runners.len(), "Waiting for builds to stop");
    futures::future::join_all(runners.iter().map(|r| r.finished())).await;
}

/// Terminate mode: on Ctrl-C cancel all builds, wait for cleanup and exit 1.
///
/// A second Ctrl-C while waiting exits at once.
pub fn terminate_on_interrupt(coordinator: CancellationCoordinator) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for interrupts");
            return;
        }
        eprintln!("Interrupted, stopping builds...");

        tokio::select! {
            _ = cancel_and_wait(&coordinator) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        std::process::exit(1);
    })
}

/// Interactive mode: forward every Ctrl-C to the session.
pub fn forward_interrupts() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for interrupts");
                return;
            }
            if tx.send(()).is_err() {
                return;
            }
        }
    });
    rx
}
