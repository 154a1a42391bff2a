use std::sync::Arc;

use async_trait::async_trait;
use courier_core::store::InAppRepository;
use courier_core::{Channel, NewInAppNotification, QueuedNotification};

use crate::sender::{ChannelSender, SendOutcome};

/// Delivers by writing the user's inbox. The inbox row id is the external id.
/// A queue row delivered twice maps to the same inbox entry.
pub struct InAppSender {
    inbox: Arc<dyn InAppRepository>,
}

impl InAppSender {
    pub fn new(inbox: Arc<dyn InAppRepository>) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl ChannelSender for InAppSender {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn send(&self, notification: &QueuedNotification) -> SendOutcome {
        let record = NewInAppNotification {
            queue_id: Some(notification.id),
            user_id: notification.user_id,
            title: notification.title.clone(),
            body: notification.body.clone(),
            related_type: notification.related_type.clone(),
            related_id: notification.related_id,
            template_key: notification.template_key.clone(),
            action_data: notification.action_data.clone(),
        };

        match self.inbox.insert(record).await {
            Ok(stored) => SendOutcome::delivered(Some(stored.id.to_string())),
            Err(e) => SendOutcome::failed(format!("inbox insert failed: {}", e)),
        }
    }
}
