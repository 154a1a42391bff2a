use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use courier_core::store::DeviceTokenRepository;
use courier_core::{Channel, QueuedNotification};
use serde_json::Value;

use crate::sender::{ChannelSender, SendOutcome};

/// A push gateway addressed by device token.
#[async_trait]
pub trait PushTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the gateway's message id when it assigns one.
    async fn send(&self, device_token: &str, title: &str, body: &str, data: Option<&Value>) -> Result<Option<String>>;
}

/// Fans a queue row out to every registered device of the user.
pub struct PushSender {
    tokens: Arc<dyn DeviceTokenRepository>,
    apns: Arc<dyn PushTransport>,
    fcm: Arc<dyn PushTransport>,
}

impl PushSender {
    pub fn new(
        tokens: Arc<dyn DeviceTokenRepository>,
        apns: Arc<dyn PushTransport>,
        fcm: Arc<dyn PushTransport>,
    ) -> Self {
        Self { tokens, apns, fcm }
    }

    fn transport_for(&self, platform: &str) -> Option<&Arc<dyn PushTransport>> {
        match platform {
            "ios" => Some(&self.apns),
            "android" => Some(&self.fcm),
            _ => None,
        }
    }
}

#[async_trait]
impl ChannelSender for PushSender {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, notification: &QueuedNotification) -> SendOutcome {
        let tokens = match self.tokens.tokens_for_user(notification.user_id).await {
            Ok(tokens) => tokens,
            Err(e) => return SendOutcome::failed(format!("device token lookup failed: {}", e)),
        };
        if tokens.is_empty() {
            return SendOutcome::failed("no registered device");
        }

        let mut first_id = None;
        let mut delivered = 0;
        let mut errors = Vec::new();

        for token in &tokens {
            let Some(transport) = self.transport_for(&token.platform) else {
                errors.push(format!("unsupported platform {}", token.platform));
                continue;
            };

            match transport
                .send(
                    &token.device_token,
                    &notification.title,
                    &notification.body,
                    notification.action_data.as_ref(),
                )
                .await
            {
                Ok(id) => {
                    delivered += 1;
                    if first_id.is_none() {
                        first_id = id;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "{} push to user {} failed: {}",
                        transport.name(),
                        notification.user_id,
                        e
                    );
                    errors.push(format!("{}: {}", transport.name(), e));
                }
            }
        }

        if delivered == 0 {
            return SendOutcome::failed(errors.join("; "));
        }
        SendOutcome::delivered(first_id).with_message(format!("delivered to {} of {} devices", delivered, tokens.len()))
    }
}
