//! Periodic deletion of old `done`/`failed` jobs.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::store::{JobStore, StoreResult};

pub struct RetentionCleaner {
    store: Arc<dyn JobStore>,
    retention: Duration,
    interval: Duration,
}

impl RetentionCleaner {
    /// A zero retention keeps terminal jobs forever, so no cleaner is built
    pub fn new(store: Arc<dyn JobStore>, retention: Duration, interval: Duration) -> Option<Self> {
        if retention.is_zero() {
            return None;
        }
        Some(Self {
            store,
            retention,
            interval,
        })
    }

    pub async fn sweep(&self) -> StoreResult<u64> {
        self.store.delete_terminal_older_than(self.retention).await
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            retention_hours = self.retention.as_secs() / 3600,
            "Retention cleaner started"
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.sweep().await {
                    Ok(0) => {}
                    Ok(deleted) => tracing::info!(deleted, "Deleted expired terminal jobs"),
                    Err(err) => tracing::error!(error = %err, "Retention sweep failed"),
                },
            }
        }
        tracing::info!("Retention cleaner stopped");
    }
}
