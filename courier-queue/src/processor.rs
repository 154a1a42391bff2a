use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use courier_core::config::QueueConfig;
use courier_core::store::{QueueRepository, QueueTransition, StatsRepository};
use courier_core::{QueuedNotification, Result, StatCounter};
use courier_delivery::{SendOutcome, SenderRegistry};

pub const RESULT_OK: &str = "ok";
pub const RESULT_SEND_FAILED: &str = "send_failed";
pub const RESULT_TIMEOUT: &str = "timeout";
pub const RESULT_UNKNOWN_CHANNEL: &str = "unknown_channel";
pub const RESULT_NO_SENDER: &str = "no_sender";

/// Fixed delay between a failed attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay: TimeDelta,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        let delay = i64::try_from(delay.as_secs())
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or_else(|| TimeDelta::days(365));
        Self { delay }
    }

    pub fn next_attempt(&self, failed_at: DateTime<Utc>) -> DateTime<Utc> {
        failed_at
            .checked_add_signed(self.delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub processed: usize,
    pub successful: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Claims due rows and pushes each one through its channel sender.
pub struct QueueProcessor {
    queue: Arc<dyn QueueRepository>,
    stats: Arc<dyn StatsRepository>,
    senders: SenderRegistry,
    retry: RetryPolicy,
    send_timeout: Duration,
}

/// How one attempt ended, before it is written back.
struct Attempt {
    outcome: SendOutcome,
    result_code: &'static str,
    retryable: bool,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<dyn QueueRepository>,
        stats: Arc<dyn StatsRepository>,
        senders: SenderRegistry,
        config: &QueueConfig,
    ) -> Self {
        Self {
            queue,
            stats,
            senders,
            retry: RetryPolicy::fixed(config.retry_delay()),
            send_timeout: config.send_timeout(),
        }
    }

    pub fn from_store<S>(store: Arc<S>, senders: SenderRegistry, config: &QueueConfig) -> Self
    where
        S: QueueRepository + StatsRepository + 'static,
    {
        Self::new(store.clone(), store, senders, config)
    }

    pub async fn process_queue(&self, batch_size: usize) -> Result<ProcessOutcome> {
        self.process_queue_at(batch_size, Utc::now()).await
    }

    /// Processes rows due at `now`. Only claiming can fail the call; per-row
    /// send and write-back failures are logged and the batch continues.
    pub async fn process_queue_at(&self, batch_size: usize, now: DateTime<Utc>) -> Result<ProcessOutcome> {
        let mut summary = ProcessOutcome::default();
        if batch_size == 0 {
            return Ok(summary);
        }

        let rows = self.queue.claim_due(batch_size, now).await?;
        if rows.is_empty() {
            return Ok(summary);
        }
        tracing::debug!("Claimed {} queued notifications", rows.len());

        for row in rows {
            summary.processed += 1;
            let attempt = self.attempt(&row).await;
            // never earlier than the claim time, so retries stay after `now`
            let finished_at = Utc::now().max(now);
            self.record(&row, attempt, finished_at, &mut summary).await;
        }

        tracing::info!(
            "Processed {} notifications: {} sent, {} retrying, {} failed",
            summary.processed,
            summary.successful,
            summary.retried,
            summary.failed
        );
        Ok(summary)
    }

    async fn attempt(&self, row: &QueuedNotification) -> Attempt {
        let channel = match row.parsed_channel() {
            Ok(channel) => channel,
            Err(_) => {
                return Attempt {
                    outcome: SendOutcome::failed(format!("unknown channel: {}", row.channel)),
                    result_code: RESULT_UNKNOWN_CHANNEL,
                    retryable: false,
                }
            }
        };

        let Some(sender) = self.senders.get(channel) else {
            return Attempt {
                outcome: SendOutcome::failed(format!("no sender registered for channel {}", channel)),
                result_code: RESULT_NO_SENDER,
                retryable: false,
            };
        };

        match tokio::time::timeout(self.send_timeout, sender.send(row)).await {
            Ok(outcome) if outcome.success => Attempt {
                outcome,
                result_code: RESULT_OK,
                retryable: false,
            },
            Ok(outcome) => Attempt {
                outcome,
                result_code: RESULT_SEND_FAILED,
                retryable: true,
            },
            Err(_) => Attempt {
                outcome: SendOutcome::failed(format!(
                    "send timed out after {}s",
                    self.send_timeout.as_secs()
                )),
                result_code: RESULT_TIMEOUT,
                retryable: true,
            },
        }
    }

    async fn record(&self, row: &QueuedNotification, attempt: Attempt, at: DateTime<Utc>, summary: &mut ProcessOutcome) {
        let Attempt {
            outcome,
            result_code,
            retryable,
        } = attempt;

        let (transition, counter) = if outcome.success {
            summary.successful += 1;
            let transition = QueueTransition::Sent {
                at,
                external_id: outcome.external_id,
                result_code: result_code.to_string(),
                result_message: outcome.message,
            };
            (transition, Some(StatCounter::Sent))
        } else {
            let retry_count = if retryable { row.retry_count + 1 } else { row.retry_count };
            let message = outcome.message.unwrap_or_else(|| "send failed".to_string());

            if retryable && retry_count < row.max_retries {
                summary.retried += 1;
                let next_attempt_at = self.retry.next_attempt(at);
                tracing::warn!(
                    "Notification {} ({}) attempt {} of {} failed, retrying at {}: {}",
                    row.id,
                    row.channel,
                    retry_count,
                    row.max_retries,
                    next_attempt_at,
                    message
                );
                let transition = QueueTransition::Retry {
                    retry_count,
                    next_attempt_at,
                    result_code: result_code.to_string(),
                    result_message: Some(message),
                };
                (transition, None)
            } else {
                summary.failed += 1;
                tracing::error!(
                    "Notification {} ({}) failed permanently after {} attempts: {}",
                    row.id,
                    row.channel,
                    retry_count,
                    message
                );
                let transition = QueueTransition::Failed {
                    retry_count,
                    result_code: result_code.to_string(),
                    result_message: Some(message),
                };
                (transition, Some(StatCounter::Failed))
            }
        };

        let Some(claimed_at) = row.claimed_at else {
            tracing::error!("Notification {} was handed out without a claim time, result dropped", row.id);
            return;
        };

        match self.queue.complete(row.id, claimed_at, transition).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("Notification {} is no longer held by this claim, result dropped", row.id);
                return;
            }
            Err(e) => {
                tracing::error!("Failed to record result of notification {}: {}", row.id, e);
                return;
            }
        }

        if let Some(counter) = counter {
            if let Err(e) = self
                .stats
                .increment(at.date_naive(), &row.template_key, &row.channel, counter)
                .await
            {
                tracing::warn!("Failed to update stats for notification {}: {}", row.id, e);
            }
        }
    }
}
