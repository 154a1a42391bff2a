use chrono::Utc;
use courier_core::{Priority, QueueStatus, QueuedNotification, UserId};

/// A claimed queue row addressed to `user_id` on `channel`.
pub fn claimed_row(user_id: UserId, channel: &str) -> QueuedNotification {
    QueuedNotification {
        id: 1,
        user_id,
        template_key: "task_completed".to_string(),
        channel: channel.to_string(),
        title: "Task done".to_string(),
        body: "Clean room".to_string(),
        priority: Priority::Normal,
        status: QueueStatus::Processing,
        scheduled_at: Utc::now(),
        retry_count: 0,
        max_retries: 3,
        related_type: Some("task".to_string()),
        related_id: Some(42),
        action_data: None,
        result_code: None,
        result_message: None,
        external_id: None,
        claimed_at: Some(Utc::now()),
        created_at: Utc::now(),
        sent_at: None,
    }
}
