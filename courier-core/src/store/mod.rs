//! Persistence seams of the pipeline.
//!
//! Every stage talks to storage through the traits below so that the
//! Postgres implementation ([`PgStore`]) and the in-process one
//! ([`MemoryStore`]) are interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::Result;
use crate::types::{
    DeviceToken, EventBinding, InAppNotification, NewInAppNotification, NewQueuedNotification,
    NotificationTemplate, QueuedNotification, StatCounter, UserContact, UserId, UserPreference,
};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

/// Read-only view of the template store and event matrix.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Active bindings for the pair whose template is active too, in binding
    /// insertion order.
    async fn active_bindings(
        &self,
        event_type: &str,
        event_action: &str,
    ) -> Result<Vec<(EventBinding, NotificationTemplate)>>;
}

#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    /// Returns the stored preference, inserting `defaults` first when the user
    /// has none. The flag is `true` when this call created the row.
    async fn get_or_create(
        &self,
        user_id: UserId,
        defaults: &UserPreference,
    ) -> Result<(UserPreference, bool)>;
}

/// Post-send state change of a claimed queue row.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueTransition {
    Sent {
        at: DateTime<Utc>,
        external_id: Option<String>,
        result_code: String,
        result_message: Option<String>,
    },
    Retry {
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
        result_code: String,
        result_message: Option<String>,
    },
    Failed {
        retry_count: i32,
        result_code: String,
        result_message: Option<String>,
    },
}

#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Inserts all rows or none. Returns the number inserted.
    async fn enqueue(&self, rows: Vec<NewQueuedNotification>) -> Result<usize>;

    /// Atomically flips up to `limit` due rows from `pending` to `processing`
    /// and returns them in dispatch order. A row is due when
    /// `scheduled_at <= now` and `retry_count < max_retries`.
    async fn claim_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<QueuedNotification>>;

    /// Applies `transition` if the row is still `processing` under the claim
    /// taken at `claimed_at`. Returns whether the row changed; `false` means
    /// the claim was released or taken over by another worker.
    async fn complete(&self, id: i64, claimed_at: DateTime<Utc>, transition: QueueTransition) -> Result<bool>;

    /// Moves `processing` rows claimed before `claimed_before` back to
    /// `pending`, leaving `retry_count` alone.
    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<usize>;

    async fn get(&self, id: i64) -> Result<Option<QueuedNotification>>;
}

/// The in-app inbox.
#[async_trait]
pub trait InAppRepository: Send + Sync {
    /// Stores an inbox entry. When `queue_id` is set and an entry for that
    /// queue row already exists, the existing entry is returned unchanged.
    async fn insert(&self, notification: NewInAppNotification) -> Result<InAppNotification>;

    /// Newest first.
    async fn list_for_user(&self, user_id: UserId, limit: i64, offset: i64) -> Result<Vec<InAppNotification>>;

    /// Sets `read_at` if unset. Returns whether a row changed.
    async fn mark_read(&self, id: i64, user_id: UserId) -> Result<bool>;

    async fn unread_count(&self, user_id: UserId) -> Result<i64>;
}

#[async_trait]
pub trait StatsRepository: Send + Sync {
    async fn increment(
        &self,
        stat_date: NaiveDate,
        template_key: &str,
        channel: &str,
        counter: StatCounter,
    ) -> Result<()>;
}

#[async_trait]
pub trait DeviceTokenRepository: Send + Sync {
    async fn tokens_for_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>>;
}

/// External user/role directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn is_admin(&self, user_id: UserId) -> Result<bool>;

    async fn contact(&self, user_id: UserId) -> Result<Option<UserContact>>;
}
