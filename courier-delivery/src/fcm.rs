use anyhow::{anyhow, Result};
use async_trait::async_trait;
use courier_core::config::DeliveryConfig;
use serde_json::Value;

use crate::push::PushTransport;

pub struct FcmDelivery {
    client: Option<::fcm::Client>,
    server_key: Option<String>,
}

impl FcmDelivery {
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        let (client, server_key) = if let Some(key) = &config.fcm_server_key {
            tracing::info!("Initializing FCM client");
            (Some(::fcm::Client::new()), Some(key.clone()))
        } else {
            tracing::warn!("FCM delivery disabled (missing configuration)");
            (None, None)
        };

        Ok(Self { client, server_key })
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some() && self.server_key.is_some()
    }
}

#[async_trait]
impl PushTransport for FcmDelivery {
    fn name(&self) -> &'static str {
        "fcm"
    }

    async fn send(&self, device_token: &str, title: &str, body: &str, data: Option<&Value>) -> Result<Option<String>> {
        let (client, server_key) = match (&self.client, &self.server_key) {
            (Some(c), Some(k)) => (c, k),
            _ => return Err(anyhow!("FCM not configured")),
        };

        let mut notification = ::fcm::NotificationBuilder::new();
        notification.title(title);
        notification.body(body);

        let mut message = ::fcm::MessageBuilder::new(server_key, device_token);
        message.notification(notification.finalize());
        if let Some(data) = data {
            message
                .data(data)
                .map_err(|e| anyhow!("Failed to attach FCM data: {}", e))?;
        }

        let response = client
            .send(message.finalize())
            .await
            .map_err(|e| anyhow!("Failed to send FCM notification: {}", e))?;

        if let Some(error) = response.error {
            return Err(anyhow!("FCM rejected notification: {:?}", error));
        }

        let result = response
            .results
            .as_ref()
            .and_then(|results| results.first());
        if let Some(error) = result.and_then(|r| r.error.as_ref()) {
            return Err(anyhow!("FCM rejected device {}: {:?}", device_token, error));
        }

        tracing::debug!("FCM notification sent to device {}", device_token);
        Ok(result
            .and_then(|r| r.message_id.clone())
            .or_else(|| response.message_id.map(|id| id.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_key_enables_fcm() {
        let config = DeliveryConfig {
            fcm_server_key: Some("key".to_string()),
            ..DeliveryConfig::default()
        };
        assert!(FcmDelivery::new(&config).unwrap().is_configured());
        assert!(!FcmDelivery::new(&DeliveryConfig::default()).unwrap().is_configured());
    }

    #[tokio::test]
    async fn unconfigured_send_fails() {
        let fcm = FcmDelivery::new(&DeliveryConfig::default()).unwrap();
        let err = fcm.send("token", "t", "b", None).await.unwrap_err();
        assert_eq!(err.to_string(), "FCM not configured");
    }
}
