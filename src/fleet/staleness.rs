use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::fleet::store::FleetStore;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(10);

/// Periodically demotes robots that stopped reporting.
///
/// The sweep runs on its own timer, independent of inbound traffic, and
/// takes the same store lock as event application. Dropping the monitor
/// cancels the task.
pub struct StalenessMonitor {
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl StalenessMonitor {
    /// Spawn the sweep task. Must be called from within a tokio runtime.
    pub fn spawn(store: FleetStore, sweep_interval: Duration, window: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sweep_loop(store, sweep_interval, window, cancel.clone()));
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Cancel the sweep and wait for the task to finish. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for StalenessMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sweep_loop(
    store: FleetStore,
    sweep_interval: Duration,
    window: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // Skip the first immediate tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let demoted = store.sweep_stale(window);
                if !demoted.is_empty() {
                    tracing::info!(
                        count = demoted.len(),
                        robots = ?demoted,
                        "robots stopped reporting, marked unreachable"
                    );
                }
            }
        }
    }
    tracing::debug!("staleness monitor stopped");
}
