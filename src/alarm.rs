//! Daily reset alarm aligned to local midnight.
//!
//! The next fire time is recomputed from the clock on every cycle, so DST
//! changes and timezone moves are picked up without rescheduling.
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::decision::BlockingService;

/// Run the alarm until `shutdown` flips to true or its sender goes away
pub async fn run_daily_alarm(service: Arc<BlockingService>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let now = service.clock().now();
        let next = service.clock().next_midnight(now);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!("Next daily reset at {} (in {}s)", next, wait.as_secs());

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                let fired_at = service.clock().now();
                if let Err(e) = service.daily_reset(fired_at).await {
                    error!("Daily reset failed: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Daily alarm stopped");
                    break;
                }
            }
        }
    }
}

pub fn spawn_daily_alarm(service: Arc<BlockingService>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(run_daily_alarm(service, shutdown))
}
