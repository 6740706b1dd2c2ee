use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::routing::BackendRouter;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Background task that periodically evicts idle sessions from every
/// adapter. Dropping the handle aborts the task.
#[derive(Debug)]
pub struct IdleReaper {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl IdleReaper {
    pub fn start(router: Arc<BackendRouter>, interval: Duration, idle_timeout: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            tracing::debug!(
                interval_secs = interval.as_secs(),
                idle_timeout_secs = idle_timeout.as_secs(),
                "idle reaper started"
            );
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let removed = router.sweep_idle(idle_timeout).await;
                        if removed > 0 {
                            tracing::info!(removed = removed, "reaped idle sessions");
                        }
                    }
                }
            }
            tracing::debug!("idle reaper stopped");
        });

        Self {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Stops the sweep loop and waits for an in-flight sweep to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
