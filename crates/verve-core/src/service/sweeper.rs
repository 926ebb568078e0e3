//! Background sweeper that fails stalled tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::TaskService;

/// How often the sweeper scans for stalled tasks.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Run the stall sweeper until cancelled.
///
/// Every `interval`, tasks running without a heartbeat for `stale_after`
/// are failed with a worker-timeout close reason. Sweep errors are logged
/// and the loop continues.
pub async fn run_sweeper(
    service: Arc<TaskService>,
    interval: Duration,
    stale_after: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("stall sweeper shutting down");
                return;
            }
            _ = ticker.tick() => {
                match service.sweep_stale(stale_after).await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "failed stalled tasks"),
                    Err(e) => warn!(error = %e, "stall sweep failed"),
                }
            }
        }
    }
}
