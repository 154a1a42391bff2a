//! In-process implementation of the repository traits.
//!
//! All state sits behind one mutex, so `claim_due` is as atomic here as the
//! single-statement claim is in Postgres. Used by tests and local dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use super::{
    CatalogRepository, DeviceTokenRepository, InAppRepository, PreferenceRepository,
    QueueRepository, QueueTransition, StatsRepository, UserDirectory,
};
use crate::error::{CourierError, Result};
use crate::types::{
    DeviceToken, EventBinding, InAppNotification, NewInAppNotification, NewQueuedNotification,
    NotificationStat, NotificationTemplate, QueueStatus, QueuedNotification, StatCounter,
    UserContact, UserId, UserPreference,
};

#[derive(Default)]
struct State {
    templates: HashMap<String, NotificationTemplate>,
    bindings: Vec<EventBinding>,
    preferences: HashMap<UserId, UserPreference>,
    queue: Vec<QueuedNotification>,
    inapp: Vec<InAppNotification>,
    stats: BTreeMap<(NaiveDate, String, String), NotificationStat>,
    device_tokens: Vec<DeviceToken>,
    users: HashMap<UserId, (UserContact, bool)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent repository call fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CourierError::Pool("store unavailable".to_string()));
        }
        Ok(())
    }

    pub async fn add_template(&self, template: NotificationTemplate) {
        let mut state = self.state.lock().await;
        state.templates.insert(template.template_key.clone(), template);
    }

    /// Appends a binding, assigning the next id. Returns the id.
    pub async fn add_binding(&self, mut binding: EventBinding) -> i64 {
        let mut state = self.state.lock().await;
        binding.id = state.bindings.len() as i64 + 1;
        let id = binding.id;
        state.bindings.push(binding);
        id
    }

    pub async fn put_preference(&self, preference: UserPreference) {
        let mut state = self.state.lock().await;
        state.preferences.insert(preference.user_id, preference);
    }

    pub async fn preference(&self, user_id: UserId) -> Option<UserPreference> {
        self.state.lock().await.preferences.get(&user_id).cloned()
    }

    pub async fn add_device_token(&self, user_id: UserId, device_token: &str, platform: &str) {
        let mut state = self.state.lock().await;
        state.device_tokens.push(DeviceToken {
            user_id,
            device_token: device_token.to_string(),
            platform: platform.to_string(),
        });
    }

    pub async fn add_user(&self, user_id: UserId, contact: UserContact, is_admin: bool) {
        let mut state = self.state.lock().await;
        state.users.insert(user_id, (contact, is_admin));
    }

    /// Snapshot of the queue in insertion order.
    pub async fn queue_rows(&self) -> Vec<QueuedNotification> {
        self.state.lock().await.queue.clone()
    }

    /// Overwrites a queue row, for arranging fixtures such as corrupt channels.
    pub async fn replace_queue_row(&self, row: QueuedNotification) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.queue.iter_mut().find(|r| r.id == row.id) {
            *slot = row;
        }
    }

    pub async fn inapp_rows(&self) -> Vec<InAppNotification> {
        self.state.lock().await.inapp.clone()
    }

    pub async fn stats(&self) -> Vec<NotificationStat> {
        self.state.lock().await.stats.values().cloned().collect()
    }
}

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn active_bindings(
        &self,
        event_type: &str,
        event_action: &str,
    ) -> Result<Vec<(EventBinding, NotificationTemplate)>> {
        self.check_available()?;
        let state = self.state.lock().await;

        Ok(state
            .bindings
            .iter()
            .filter(|b| b.is_active && b.event_type == event_type && b.event_action == event_action)
            .filter_map(|b| {
                state
                    .templates
                    .get(&b.template_key)
                    .filter(|t| t.is_active)
                    .map(|t| (b.clone(), t.clone()))
            })
            .collect())
    }
}

#[async_trait]
impl PreferenceRepository for MemoryStore {
    async fn get_or_create(
        &self,
        user_id: UserId,
        defaults: &UserPreference,
    ) -> Result<(UserPreference, bool)> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        if let Some(existing) = state.preferences.get(&user_id) {
            return Ok((existing.clone(), false));
        }
        let created = UserPreference {
            user_id,
            ..defaults.clone()
        };
        state.preferences.insert(user_id, created.clone());
        Ok((created, true))
    }
}

#[async_trait]
impl QueueRepository for MemoryStore {
    async fn enqueue(&self, rows: Vec<NewQueuedNotification>) -> Result<usize> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        let now = Utc::now();
        let count = rows.len();
        for row in rows {
            let id = state.queue.len() as i64 + 1;
            state.queue.push(QueuedNotification {
                id,
                user_id: row.user_id,
                template_key: row.template_key,
                channel: row.channel.as_str().to_string(),
                title: row.title,
                body: row.body,
                priority: row.priority,
                status: QueueStatus::Pending,
                scheduled_at: row.scheduled_at,
                retry_count: 0,
                max_retries: row.max_retries,
                related_type: row.related_type,
                related_id: row.related_id,
                action_data: row.action_data,
                result_code: None,
                result_message: None,
                external_id: None,
                claimed_at: None,
                created_at: now,
                sent_at: None,
            });
        }
        Ok(count)
    }

    async fn claim_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<QueuedNotification>> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        let mut due: Vec<&mut QueuedNotification> = state
            .queue
            .iter_mut()
            .filter(|r| {
                r.status == QueueStatus::Pending && r.scheduled_at <= now && r.retry_count < r.max_retries
            })
            .collect();
        due.sort_by(|a, b| QueuedNotification::dispatch_order(a, b));

        Ok(due
            .into_iter()
            .take(limit)
            .map(|row| {
                row.status = QueueStatus::Processing;
                row.claimed_at = Some(now);
                row.clone()
            })
            .collect())
    }

    async fn complete(&self, id: i64, claimed_at: DateTime<Utc>, transition: QueueTransition) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        let Some(row) = state.queue.iter_mut().find(|r| {
            r.id == id && r.status == QueueStatus::Processing && r.claimed_at == Some(claimed_at)
        })
        else {
            return Ok(false);
        };

        match transition {
            QueueTransition::Sent {
                at,
                external_id,
                result_code,
                result_message,
            } => {
                row.status = QueueStatus::Sent;
                row.sent_at = Some(at);
                row.external_id = external_id;
                row.result_code = Some(result_code);
                row.result_message = result_message;
            }
            QueueTransition::Retry {
                retry_count,
                next_attempt_at,
                result_code,
                result_message,
            } => {
                row.status = QueueStatus::Pending;
                row.retry_count = retry_count;
                row.scheduled_at = next_attempt_at;
                row.claimed_at = None;
                row.result_code = Some(result_code);
                row.result_message = result_message;
            }
            QueueTransition::Failed {
                retry_count,
                result_code,
                result_message,
            } => {
                row.status = QueueStatus::Failed;
                row.retry_count = retry_count;
                row.result_code = Some(result_code);
                row.result_message = result_message;
            }
        }
        Ok(true)
    }

    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<usize> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        let mut released = 0;
        for row in state.queue.iter_mut() {
            let stale = row.status == QueueStatus::Processing
                && row.claimed_at.is_some_and(|at| at < claimed_before);
            if stale {
                row.status = QueueStatus::Pending;
                row.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn get(&self, id: i64) -> Result<Option<QueuedNotification>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.queue.iter().find(|r| r.id == id).cloned())
    }
}

#[async_trait]
impl InAppRepository for MemoryStore {
    async fn insert(&self, notification: NewInAppNotification) -> Result<InAppNotification> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        if let Some(queue_id) = notification.queue_id {
            if let Some(existing) = state.inapp.iter().find(|n| n.queue_id == Some(queue_id)) {
                return Ok(existing.clone());
            }
        }

        let stored = InAppNotification {
            id: state.inapp.len() as i64 + 1,
            queue_id: notification.queue_id,
            user_id: notification.user_id,
            title: notification.title,
            body: notification.body,
            related_type: notification.related_type,
            related_id: notification.related_id,
            template_key: notification.template_key,
            action_data: notification.action_data,
            created_at: Utc::now(),
            read_at: None,
        };
        state.inapp.push(stored.clone());
        Ok(stored)
    }

    async fn list_for_user(&self, user_id: UserId, limit: i64, offset: i64) -> Result<Vec<InAppNotification>> {
        self.check_available()?;
        let state = self.state.lock().await;

        let mut rows: Vec<InAppNotification> = state
            .inapp
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn mark_read(&self, id: i64, user_id: UserId) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        match state
            .inapp
            .iter_mut()
            .find(|n| n.id == id && n.user_id == user_id && n.read_at.is_none())
        {
            Some(n) => {
                n.read_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn unread_count(&self, user_id: UserId) -> Result<i64> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .inapp
            .iter()
            .filter(|n| n.user_id == user_id && n.read_at.is_none())
            .count() as i64)
    }
}

#[async_trait]
impl StatsRepository for MemoryStore {
    async fn increment(
        &self,
        stat_date: NaiveDate,
        template_key: &str,
        channel: &str,
        counter: StatCounter,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        state
            .stats
            .entry((stat_date, template_key.to_string(), channel.to_string()))
            .or_insert_with(|| NotificationStat {
                stat_date,
                template_key: template_key.to_string(),
                channel: channel.to_string(),
                ..Default::default()
            })
            .bump(counter);
        Ok(())
    }
}

#[async_trait]
impl DeviceTokenRepository for MemoryStore {
    async fn tokens_for_user(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .device_tokens
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn is_admin(&self, user_id: UserId) -> Result<bool> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.users.get(&user_id).is_some_and(|(_, admin)| *admin))
    }

    async fn contact(&self, user_id: UserId) -> Result<Option<UserContact>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.users.get(&user_id).map(|(contact, _)| contact.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Channel, Priority};
    use chrono::Duration;

    fn new_row(user_id: UserId, priority: Priority, scheduled_at: DateTime<Utc>) -> NewQueuedNotification {
        NewQueuedNotification {
            user_id,
            template_key: "task_completed".to_string(),
            channel: Channel::Push,
            title: "t".to_string(),
            body: "b".to_string(),
            priority,
            scheduled_at,
            max_retries: 3,
            related_type: None,
            related_id: None,
            action_data: None,
        }
    }

    #[tokio::test]
    async fn claim_skips_future_and_already_claimed_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .enqueue(vec![
                new_row(1, Priority::Normal, now - Duration::seconds(1)),
                new_row(2, Priority::Normal, now + Duration::minutes(10)),
                new_row(3, Priority::Urgent, now),
            ])
            .await
            .unwrap();

        let first = store.claim_due(10, now).await.unwrap();
        let ids: Vec<i64> = first.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 1]);
        assert!(first.iter().all(|r| r.status == QueueStatus::Processing));

        // a second worker finds nothing left to claim
        assert!(store.claim_due(10, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_requires_processing_status() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.enqueue(vec![new_row(1, Priority::Normal, now)]).await.unwrap();

        let sent = QueueTransition::Sent {
            at: now,
            external_id: Some("ext-1".to_string()),
            result_code: "ok".to_string(),
            result_message: None,
        };
        // still pending, not claimed
        assert!(!store.complete(1, now, sent.clone()).await.unwrap());

        store.claim_due(1, now).await.unwrap();
        assert!(store.complete(1, now, sent.clone()).await.unwrap());
        // terminal rows never transition again
        assert!(!store.complete(1, now, sent).await.unwrap());

        let row = store.get(1).await.unwrap().unwrap();
        assert_eq!(row.status, QueueStatus::Sent);
        assert_eq!(row.sent_at, Some(now));
        assert_eq!(row.external_id.as_deref(), Some("ext-1"));
    }

    #[tokio::test]
    async fn complete_ignores_a_claim_that_was_taken_over() {
        let store = MemoryStore::new();
        let first_claim = Utc::now();
        store.enqueue(vec![new_row(1, Priority::Normal, first_claim)]).await.unwrap();
        store.claim_due(1, first_claim).await.unwrap();

        // released as stale and claimed again by another worker
        let second_claim = first_claim + Duration::minutes(20);
        store.release_stale_claims(second_claim).await.unwrap();
        store.claim_due(1, second_claim).await.unwrap();

        let failed = QueueTransition::Failed {
            retry_count: 1,
            result_code: "send_failed".to_string(),
            result_message: Some("late".to_string()),
        };
        assert!(!store.complete(1, first_claim, failed).await.unwrap());
        let row = store.get(1).await.unwrap().unwrap();
        assert_eq!(row.status, QueueStatus::Processing);
        assert_eq!(row.claimed_at, Some(second_claim));

        let sent = QueueTransition::Sent {
            at: second_claim,
            external_id: None,
            result_code: "ok".to_string(),
            result_message: None,
        };
        assert!(store.complete(1, second_claim, sent).await.unwrap());
        assert_eq!(store.get(1).await.unwrap().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn stale_claims_are_released() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.enqueue(vec![new_row(1, Priority::Normal, now)]).await.unwrap();
        store.claim_due(1, now).await.unwrap();

        assert_eq!(store.release_stale_claims(now - Duration::minutes(1)).await.unwrap(), 0);
        assert_eq!(store.release_stale_claims(now + Duration::minutes(1)).await.unwrap(), 1);
        assert_eq!(store.get(1).await.unwrap().unwrap().status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn get_or_create_reports_creation_once() {
        let store = MemoryStore::new();
        let defaults = UserPreference {
            user_id: 0,
            push_enabled: true,
            in_app_enabled: true,
            email_enabled: true,
            sms_enabled: false,
            quiet_hours_start: None,
            quiet_hours_end: None,
            quiet_days: Default::default(),
            event_preferences: Default::default(),
        };

        let (pref, created) = store.get_or_create(42, &defaults).await.unwrap();
        assert!(created);
        assert_eq!(pref.user_id, 42);

        let (_, created) = store.get_or_create(42, &defaults).await.unwrap();
        assert!(!created);
    }

    #[tokio::test]
    async fn inbox_lists_newest_first_and_marks_read_once() {
        let store = MemoryStore::new();
        for title in ["first", "second"] {
            store
                .insert(NewInAppNotification {
                    queue_id: None,
                    user_id: 5,
                    title: title.to_string(),
                    body: String::new(),
                    related_type: None,
                    related_id: None,
                    template_key: "chat_message".to_string(),
                    action_data: None,
                })
                .await
                .unwrap();
        }

        let inbox = store.list_for_user(5, 10, 0).await.unwrap();
        assert_eq!(inbox[0].title, "second");
        assert_eq!(store.unread_count(5).await.unwrap(), 2);

        assert!(store.mark_read(1, 5).await.unwrap());
        assert!(!store.mark_read(1, 5).await.unwrap());
        assert!(!store.mark_read(2, 6).await.unwrap());
        assert_eq!(store.unread_count(5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn inbox_insert_is_idempotent_per_queue_row() {
        let store = MemoryStore::new();
        let entry = |title: &str| NewInAppNotification {
            queue_id: Some(9),
            user_id: 5,
            title: title.to_string(),
            body: String::new(),
            related_type: None,
            related_id: None,
            template_key: "task_completed".to_string(),
            action_data: None,
        };

        let first = store.insert(entry("done")).await.unwrap();
        let again = store.insert(entry("done, again")).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(store.inapp_rows().await.len(), 1);
        assert_eq!(store.unread_count(5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_fails_calls() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.enqueue(Vec::new()).await,
            Err(CourierError::Pool(_))
        ));
    }
}
