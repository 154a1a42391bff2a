use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use courier_core::config::QueueConfig;
use courier_core::store::QueueRepository;
use courier_core::Result;
use tokio::time::MissedTickBehavior;

use crate::processor::{ProcessOutcome, QueueProcessor};

/// Drives the processor on a fixed interval and recovers abandoned claims.
pub struct QueuePoller {
    processor: Arc<QueueProcessor>,
    queue: Arc<dyn QueueRepository>,
    config: QueueConfig,
}

impl QueuePoller {
    pub fn new(processor: Arc<QueueProcessor>, queue: Arc<dyn QueueRepository>, config: QueueConfig) -> Self {
        Self {
            processor,
            queue,
            config,
        }
    }

    /// One polling round: release stale claims, then process a batch.
    pub async fn tick(&self) -> Result<ProcessOutcome> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<ProcessOutcome> {
        let released = self.queue.release_stale_claims(self.stale_cutoff(now)).await?;
        if released > 0 {
            tracing::warn!("Released {} stale queue claims back to pending", released);
        }
        self.processor
            .process_queue_at(self.config.batch_size, now)
            .await
    }

    fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.config.stale_claim_after())
            .ok()
            .and_then(|after| now.checked_sub_signed(after))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Polls until `shutdown` resolves. A failed round is logged and the loop
    /// keeps going.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            "Starting queue poller (every {}s, batch size {})",
            self.config.poll_interval().as_secs(),
            self.config.batch_size
        );

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Queue poller stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!("Error in queue poller: {}", e);
                    }
                }
            }
        }
    }
}
