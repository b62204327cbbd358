use buildsync_core::VersionStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Periodically finalizes pending builds that have been idle for longer than
/// the configured window. Stops when `cancel` fires.
pub fn spawn_sweeper(
    store: Arc<Mutex<VersionStore>>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("finalization sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let store = store.lock().unwrap_or_else(|e| e.into_inner());
                    if let Err(e) = store.finalize_idle() {
                        error!("finalization sweep failed: {}", e);
                    }
                }
            }
        }
    })
}
