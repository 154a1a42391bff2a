use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use courier_core::config::QueueConfig;
use courier_core::store::{InAppRepository, MemoryStore, QueueRepository, QueueTransition};
use courier_core::{
    Channel, ChannelSupport, CourierError, EventBinding, NewQueuedNotification, NotificationTemplate, Priority,
    QueueStatus, QueuedNotification, TargetRoles,
};
use courier_delivery::inapp::InAppSender;
use courier_delivery::{ChannelSender, SendOutcome, SenderRegistry};
use courier_notify::NotificationProducer;
use courier_queue::{QueuePoller, QueueProcessor};
use serde_json::json;

/// Records every call; fails the first `failures` of them.
struct FlakySender {
    channel: Channel,
    failures: Mutex<VecDeque<&'static str>>,
    calls: Mutex<Vec<i64>>,
}

impl FlakySender {
    fn new(channel: Channel, failures: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            failures: Mutex::new(failures.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelSender for FlakySender {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, notification: &QueuedNotification) -> SendOutcome {
        self.calls.lock().unwrap().push(notification.id);
        // yield so concurrent workers interleave
        tokio::task::yield_now().await;
        match self.failures.lock().unwrap().pop_front() {
            Some(reason) => SendOutcome::failed(reason),
            None => SendOutcome::delivered(Some(format!("{}-{}", self.channel, notification.id))),
        }
    }
}

/// Queue store whose first write-back is lost, as when the database drops
/// the connection right after the send.
struct LosesFirstWriteBack {
    inner: Arc<MemoryStore>,
    lost: AtomicBool,
}

#[async_trait]
impl QueueRepository for LosesFirstWriteBack {
    async fn enqueue(&self, rows: Vec<NewQueuedNotification>) -> courier_core::Result<usize> {
        self.inner.enqueue(rows).await
    }

    async fn claim_due(&self, limit: usize, now: DateTime<Utc>) -> courier_core::Result<Vec<QueuedNotification>> {
        self.inner.claim_due(limit, now).await
    }

    async fn complete(
        &self,
        id: i64,
        claimed_at: DateTime<Utc>,
        transition: QueueTransition,
    ) -> courier_core::Result<bool> {
        if !self.lost.swap(true, Ordering::SeqCst) {
            return Err(CourierError::Pool("connection reset".to_string()));
        }
        self.inner.complete(id, claimed_at, transition).await
    }

    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> courier_core::Result<usize> {
        self.inner.release_stale_claims(claimed_before).await
    }

    async fn get(&self, id: i64) -> courier_core::Result<Option<QueuedNotification>> {
        self.inner.get(id).await
    }
}

/// Fails its send after another worker has released and re-claimed the row.
struct OvertakenSender {
    store: Arc<MemoryStore>,
    takeover_at: DateTime<Utc>,
}

#[async_trait]
impl ChannelSender for OvertakenSender {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, _notification: &QueuedNotification) -> SendOutcome {
        self.store.release_stale_claims(self.takeover_at).await.unwrap();
        let taken = self.store.claim_due(10, self.takeover_at).await.unwrap();
        assert_eq!(taken.len(), 1);
        SendOutcome::failed("gateway down")
    }
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        batch_size: 50,
        retry_delay_secs: 300,
        send_timeout_secs: 5,
        ..QueueConfig::default()
    }
}

async fn seed_task_completed(store: &MemoryStore, max_retries: i32) {
    store
        .add_template(NotificationTemplate {
            template_key: "task_completed".to_string(),
            channels: ChannelSupport {
                push: true,
                in_app: true,
                email: true,
                sms: false,
            },
            title_template: "Task completed: {{task_title}}".to_string(),
            body_template: "\"{{task_title}}\" has been marked complete.".to_string(),
            email_subject_template: None,
            email_body_template: None,
            priority: Priority::High,
            is_active: true,
        })
        .await;
    store
        .add_binding(EventBinding {
            id: 0,
            event_type: "task".to_string(),
            event_action: "completed".to_string(),
            template_key: "task_completed".to_string(),
            target_roles: TargetRoles::from_tags(&["poster", "acceptor"]),
            trigger_conditions: Default::default(),
            delay_minutes: 0,
            max_retries,
            is_active: true,
        })
        .await;
}

fn noon() -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 3)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

#[tokio::test]
async fn task_completed_flows_to_every_channel() {
    let store = Arc::new(MemoryStore::new());
    seed_task_completed(&store, 3).await;

    let producer = NotificationProducer::from_store(store.clone());
    let now = Utc::now();
    let outcome = producer
        .trigger_event_at(
            "task",
            "completed",
            &json!({"id": 42, "task_title": "Clean room", "poster_id": 1, "acceptor_id": 2}),
            &[1, 2],
            now,
            noon(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.queued, 6);

    let push = FlakySender::new(Channel::Push, vec![]);
    let email = FlakySender::new(Channel::Email, vec![]);
    let mut senders = SenderRegistry::new();
    senders
        .register(push.clone())
        .register(email.clone())
        .register(Arc::new(InAppSender::new(store.clone())));
    let processor = QueueProcessor::from_store(store.clone(), senders, &queue_config());

    let summary = processor.process_queue_at(50, now).await.unwrap();
    assert_eq!((summary.processed, summary.successful), (6, 6));
    assert_eq!(push.calls().len(), 2);
    assert_eq!(email.calls().len(), 2);

    let rows = store.queue_rows().await;
    assert!(rows.iter().all(|r| r.status == QueueStatus::Sent && r.sent_at.is_some()));
    assert!(rows.iter().all(|r| r.title == "Task completed: Clean room"));

    // one inbox entry per user, carrying the correlation and navigation data
    for user in [1, 2] {
        let inbox = store.list_for_user(user, 10, 0).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].related_type.as_deref(), Some("task"));
        assert_eq!(inbox[0].related_id, Some(42));
        assert_eq!(inbox[0].action_data.as_ref().unwrap()["event_action"], "completed");
        assert_eq!(store.unread_count(user).await.unwrap(), 1);
    }

    let stats = store.stats().await;
    assert_eq!(stats.iter().map(|s| s.sent_count).sum::<i32>(), 6);
    assert!(stats.iter().all(|s| s.failed_count == 0));

    // nothing left to claim
    assert_eq!(processor.process_queue_at(50, now).await.unwrap().processed, 0);
}

#[tokio::test]
async fn retries_are_exhausted_then_never_selected_again() {
    let store = Arc::new(MemoryStore::new());
    seed_task_completed(&store, 3).await;
    let producer = NotificationProducer::from_store(store.clone());
    let now = Utc::now();

    // only the poster, and only push survives: in-app and email are turned off
    let mut pref = courier_notify::preferences::default_preference(1);
    pref.in_app_enabled = false;
    pref.email_enabled = false;
    store.put_preference(pref).await;
    producer
        .trigger_event_at(
            "task",
            "completed",
            &json!({"task_title": "Clean room", "poster_id": 1}),
            &[1],
            now,
            noon(),
        )
        .await
        .unwrap();
    assert_eq!(store.queue_rows().await.len(), 1);

    let push = FlakySender::new(Channel::Push, vec!["gateway down"; 5]);
    let mut senders = SenderRegistry::new();
    senders.register(push.clone());
    let processor = QueueProcessor::from_store(store.clone(), senders, &queue_config());

    let step = TimeDelta::seconds(301);
    let mut statuses = Vec::new();
    for attempt in 0..3 {
        let at = now + step * attempt;
        let summary = processor.process_queue_at(50, at).await.unwrap();
        assert_eq!(summary.processed, 1);
        let row = store.get(1).await.unwrap().unwrap();
        statuses.push((row.status, row.retry_count));
    }
    assert_eq!(
        statuses,
        vec![
            (QueueStatus::Pending, 1),
            (QueueStatus::Pending, 2),
            (QueueStatus::Failed, 3),
        ]
    );

    let row = store.get(1).await.unwrap().unwrap();
    assert_eq!(row.result_message.as_deref(), Some("gateway down"));
    assert!(row.sent_at.is_none());

    let later = now + TimeDelta::days(1);
    assert_eq!(processor.process_queue_at(50, later).await.unwrap().processed, 0);
    assert_eq!(push.calls().len(), 3);
    assert_eq!(store.stats().await[0].failed_count, 1);
}

#[tokio::test]
async fn one_failure_then_success_ends_sent() {
    let store = Arc::new(MemoryStore::new());
    seed_task_completed(&store, 3).await;
    let producer = NotificationProducer::from_store(store.clone());
    let now = Utc::now();

    let mut pref = courier_notify::preferences::default_preference(2);
    pref.push_enabled = false;
    pref.email_enabled = false;
    store.put_preference(pref).await;
    producer
        .trigger_event_at("task", "completed", &json!({"acceptor_id": 2}), &[2], now, noon())
        .await
        .unwrap();

    let inbox_fails_once = FlakySender::new(Channel::InApp, vec!["inbox busy"]);
    let mut senders = SenderRegistry::new();
    senders.register(inbox_fails_once.clone());
    let processor = QueueProcessor::from_store(store.clone(), senders, &queue_config());

    let first = processor.process_queue_at(50, now).await.unwrap();
    assert_eq!((first.processed, first.successful, first.retried), (1, 0, 1));

    // the retry is not due before the fixed delay has passed
    let early = processor
        .process_queue_at(50, now + TimeDelta::seconds(120))
        .await
        .unwrap();
    assert_eq!(early.processed, 0);

    let second = processor
        .process_queue_at(50, now + TimeDelta::seconds(301))
        .await
        .unwrap();
    assert_eq!(second.successful, 1);

    let row = store.get(1).await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Sent);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.external_id.as_deref(), Some("in_app-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_share_a_row() {
    let store = Arc::new(MemoryStore::new());
    seed_task_completed(&store, 3).await;
    let producer = NotificationProducer::from_store(store.clone());
    let now = Utc::now();

    let targets: Vec<i64> = (1..=40).collect();
    let queued = producer
        .trigger_event_at(
            "task",
            "completed",
            &json!({"task_title": "Clean room"}),
            &targets,
            now,
            noon(),
        )
        .await
        .unwrap()
        .queued;
    // nobody is poster or acceptor here
    assert_eq!(queued, 0);

    // seed rows directly instead, every user getting a push row
    let rows = targets
        .iter()
        .map(|&user_id| courier_core::NewQueuedNotification {
            user_id,
            template_key: "task_completed".to_string(),
            channel: Channel::Push,
            title: "t".to_string(),
            body: "b".to_string(),
            priority: Priority::Normal,
            scheduled_at: now,
            max_retries: 3,
            related_type: None,
            related_id: None,
            action_data: None,
        })
        .collect();
    store.enqueue(rows).await.unwrap();

    let push = FlakySender::new(Channel::Push, vec![]);
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let mut senders = SenderRegistry::new();
            senders.register(push.clone());
            let processor = QueueProcessor::from_store(store.clone(), senders, &queue_config());
            tokio::spawn(async move {
                let mut total = 0;
                loop {
                    let summary = processor.process_queue_at(7, now).await.unwrap();
                    if summary.processed == 0 {
                        break total;
                    }
                    total += summary.processed;
                }
            })
        })
        .collect();

    let mut processed = 0;
    for worker in workers {
        processed += worker.await.unwrap();
    }
    assert_eq!(processed, 40);

    let mut calls = push.calls();
    calls.sort();
    calls.dedup();
    assert_eq!(calls.len(), 40);
    assert_eq!(push.calls().len(), 40);
    assert!(store
        .queue_rows()
        .await
        .iter()
        .all(|r| r.status == QueueStatus::Sent));
}

#[tokio::test]
async fn redelivered_in_app_row_keeps_a_single_inbox_entry() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    store
        .enqueue(vec![NewQueuedNotification {
            user_id: 2,
            template_key: "task_completed".to_string(),
            channel: Channel::InApp,
            title: "Task completed: Clean room".to_string(),
            body: "done".to_string(),
            priority: Priority::High,
            scheduled_at: now,
            max_retries: 3,
            related_type: Some("task".to_string()),
            related_id: Some(42),
            action_data: None,
        }])
        .await
        .unwrap();

    let config = QueueConfig {
        batch_size: 10,
        send_timeout_secs: 1,
        stale_claim_secs: 60,
        ..QueueConfig::default()
    };
    let queue = Arc::new(LosesFirstWriteBack {
        inner: store.clone(),
        lost: AtomicBool::new(false),
    });
    let mut senders = SenderRegistry::new();
    senders.register(Arc::new(InAppSender::new(store.clone())));
    let processor = Arc::new(QueueProcessor::new(queue.clone(), store.clone(), senders, &config));
    let poller = QueuePoller::new(processor, queue, config.clone());

    // the inbox write lands but marking the row sent does not
    poller.tick_at(now).await.unwrap();
    assert_eq!(store.get(1).await.unwrap().unwrap().status, QueueStatus::Processing);
    assert_eq!(store.inapp_rows().await.len(), 1);

    // the abandoned claim is recovered and the row delivered again
    let outcome = poller.tick_at(now + TimeDelta::seconds(61)).await.unwrap();
    assert_eq!(outcome.successful, 1);

    let row = store.get(1).await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Sent);
    assert_eq!(row.external_id.as_deref(), Some("1"));

    let inbox = store.list_for_user(2, 10, 0).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].queue_id, Some(1));
    assert_eq!(store.unread_count(2).await.unwrap(), 1);
}

#[tokio::test]
async fn late_result_does_not_overwrite_a_newer_claim() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    store
        .enqueue(vec![NewQueuedNotification {
            user_id: 1,
            template_key: "task_completed".to_string(),
            channel: Channel::Push,
            title: "t".to_string(),
            body: "b".to_string(),
            priority: Priority::Normal,
            scheduled_at: now,
            max_retries: 3,
            related_type: None,
            related_id: None,
            action_data: None,
        }])
        .await
        .unwrap();

    let takeover_at = now + TimeDelta::hours(1);
    let mut senders = SenderRegistry::new();
    senders.register(Arc::new(OvertakenSender {
        store: store.clone(),
        takeover_at,
    }));
    let processor = QueueProcessor::from_store(store.clone(), senders, &queue_config());
    processor.process_queue_at(10, now).await.unwrap();

    // the first worker's retry was dropped; the row belongs to the second claim
    let row = store.get(1).await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Processing);
    assert_eq!(row.claimed_at, Some(takeover_at));
    assert_eq!(row.retry_count, 0);
    assert!(row.result_code.is_none());
}
