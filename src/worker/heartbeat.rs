use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::queue::QueueClient;

/// Periodically writes the current UNIX time to this runner's heartbeat key.
pub struct HeartbeatSender {
    queue: QueueClient,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(queue: QueueClient, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Run until `shutdown` fires. A failed write is logged and retried on
    /// the next tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default();
            if let Err(e) = self.queue.heartbeat(now).await {
                tracing::warn!(error = %e, "Failed to write heartbeat");
            }
        }
        tracing::debug!("Heartbeat stopped");
    }
}
