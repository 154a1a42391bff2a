use std::fs;

use a2::{Client, Endpoint, LocalizedNotificationBuilder, NotificationBuilder, NotificationOptions};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use courier_core::config::DeliveryConfig;
use serde_json::Value;

use crate::push::PushTransport;

pub struct ApnsDelivery {
    client: Option<Client>,
    bundle_id: String,
}

impl ApnsDelivery {
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        let bundle_id = config.apns_bundle_id.clone().unwrap_or_default();

        let client = if let (Some(key_id), Some(team_id)) = (&config.apns_key_id, &config.apns_team_id) {
            tracing::info!("Initializing APNs client");

            let key_content = if let Some(encoded) = &config.apns_key_content {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| anyhow!("Failed to decode base64 APNs key: {}", e))?;
                String::from_utf8(decoded).map_err(|e| anyhow!("Failed to convert APNs key to UTF-8: {}", e))?
            } else if let Some(key_path) = &config.apns_key_path {
                fs::read_to_string(key_path)
                    .map_err(|e| anyhow!("Failed to read APNs key file {}: {}", key_path, e))?
            } else {
                return Err(anyhow!("Either APNS_KEY_PATH or APNS_KEY_CONTENT must be provided"));
            };

            let endpoint = if bundle_id.contains("sandbox") || bundle_id.contains("dev") {
                Endpoint::Sandbox
            } else {
                Endpoint::Production
            };
            let client = Client::token(key_content.as_bytes(), key_id, team_id, endpoint)
                .map_err(|e| anyhow!("Failed to create APNs client: {}", e))?;

            tracing::info!("APNs client initialized successfully");
            Some(client)
        } else {
            tracing::warn!("APNs delivery disabled (missing configuration)");
            None
        };

        Ok(Self { client, bundle_id })
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }
}

#[async_trait]
impl PushTransport for ApnsDelivery {
    fn name(&self) -> &'static str {
        "apns"
    }

    async fn send(&self, device_token: &str, title: &str, body: &str, data: Option<&Value>) -> Result<Option<String>> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow!("APNs not configured"))?;

        let mut builder = LocalizedNotificationBuilder::new(title, body);
        builder.set_sound("default");

        let mut options = NotificationOptions::default();
        if !self.bundle_id.is_empty() {
            options.apns_topic = Some(&self.bundle_id);
        }

        let mut payload = builder.build(device_token, options);
        if let Some(data) = data {
            payload
                .add_custom_data("action_data", data)
                .map_err(|e| anyhow!("Failed to attach APNs custom data: {}", e))?;
        }

        let response = client
            .send(payload)
            .await
            .map_err(|e| anyhow!("Failed to send APNs notification: {}", e))?;

        tracing::debug!("APNs notification sent to device {}: {:?}", device_token, response);
        Ok(response.apns_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_disable_apns() {
        let apns = ApnsDelivery::new(&DeliveryConfig::default()).unwrap();
        assert!(!apns.is_configured());
    }

    #[test]
    fn key_id_without_key_material_is_an_error() {
        let config = DeliveryConfig {
            apns_key_id: Some("KEY".to_string()),
            apns_team_id: Some("TEAM".to_string()),
            ..DeliveryConfig::default()
        };
        assert!(ApnsDelivery::new(&config).is_err());
    }

    #[tokio::test]
    async fn unconfigured_send_fails() {
        let apns = ApnsDelivery::new(&DeliveryConfig::default()).unwrap();
        let err = apns.send("token", "t", "b", None).await.unwrap_err();
        assert_eq!(err.to_string(), "APNs not configured");
    }
}
