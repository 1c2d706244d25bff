//! Background pruning of the temp directory.
//!
//! The first sweep runs immediately, then once per interval until shutdown.

use facematch_core::{SweepReport, TempSweeper};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct CleanupDaemon {
    sweeper: TempSweeper,
    interval: Duration,
}

/// Running daemon; dropping it without calling [`CleanupHandle::shutdown`]
/// also stops the loop at the next wakeup.
pub struct CleanupHandle {
    handle: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

impl CleanupDaemon {
    pub fn new(sweeper: TempSweeper, interval: Duration) -> Self {
        Self { sweeper, interval }
    }

    pub fn spawn(self) -> CleanupHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = self.interval.as_secs(), "temp cleanup started");
            loop {
                run_once(&self.sweeper).await;

                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
            tracing::info!("temp cleanup stopped");
        });

        CleanupHandle {
            handle,
            shutdown: shutdown_tx,
        }
    }
}

impl CleanupHandle {
    /// Signal the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "temp cleanup task failed");
        }
    }
}

async fn run_once(sweeper: &TempSweeper) {
    let sweeper = sweeper.clone();
    match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
        Ok(Ok(SweepReport {
            scanned,
            deleted,
            failed,
        })) => {
            tracing::debug!(scanned, deleted, failed, "temp sweep finished");
        }
        Ok(Err(e)) => tracing::warn!(error = %e, "temp sweep could not list directory"),
        Err(e) => tracing::error!(error = %e, "temp sweep task panicked"),
    }
}
