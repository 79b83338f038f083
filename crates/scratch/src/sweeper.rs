use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::manager::WorkspaceManager;

/// Run [`WorkspaceManager::reclaim_if_needed`] every `interval` until cancelled.
///
/// Sweeps run on the blocking pool; a sweep that overruns its interval skips
/// the missed ticks instead of bunching them up.
pub fn spawn_sweeper(
    manager: Arc<WorkspaceManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Workspace sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let manager = Arc::clone(&manager);
                    match tokio::task::spawn_blocking(move || manager.reclaim_if_needed()).await {
                        Ok(report) => tracing::debug!(
                            removed = report.removed(),
                            usage = report.usage_after,
                            "sweep complete"
                        ),
                        Err(e) => tracing::warn!(error = %e, "sweep task failed"),
                    }
                }
            }
        }
    })
}
