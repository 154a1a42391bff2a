use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use courier_core::config::DeliveryConfig;
use courier_core::store::UserDirectory;
use courier_core::{Channel, QueuedNotification};
use serde::Serialize;
use serde_json::Value;

use crate::sender::{ChannelSender, SendOutcome};

#[derive(Debug, Serialize)]
struct SmsRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<&'a str>,
    to: &'a str,
    text: String,
}

/// JSON-over-HTTP SMS gateway authenticated with a bearer token.
pub struct SmsDelivery {
    client: Option<reqwest::Client>,
    gateway_url: Option<String>,
    token: Option<String>,
    sender_id: Option<String>,
}

impl SmsDelivery {
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        let (client, gateway_url, token) =
            if let (Some(url), Some(token)) = (&config.sms_gateway_url, &config.sms_gateway_token) {
                tracing::info!("Initializing SMS gateway client");
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(30))
                    .build()
                    .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
                (Some(client), Some(url.clone()), Some(token.clone()))
            } else {
                tracing::warn!("SMS delivery disabled (missing gateway configuration)");
                (None, None, None)
            };

        Ok(Self {
            client,
            gateway_url,
            token,
            sender_id: config.sms_sender_id.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    /// Sends one message and returns the gateway's message id, if it reports one.
    pub async fn send(&self, to: &str, text: String) -> Result<Option<String>> {
        let (client, url, token) = match (&self.client, &self.gateway_url, &self.token) {
            (Some(c), Some(u), Some(t)) => (c, u, t),
            _ => return Err(anyhow!("sms transport not configured")),
        };

        let request = SmsRequest {
            from: self.sender_id.as_deref(),
            to,
            text,
        };

        let response = client
            .post(url)
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to send HTTP request to SMS gateway: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("SMS gateway returned error status {}: {}", status, error_text));
        }

        // gateways differ in their response body; an id is optional
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let id = ["id", "message_id", "sid"]
            .iter()
            .find_map(|key| body.get(*key))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        tracing::debug!("SMS sent to {} (message_id: {:?})", to, id);
        Ok(id)
    }
}

fn sms_text(title: &str, body: &str) -> String {
    match (title.trim().is_empty(), body.trim().is_empty()) {
        (true, _) => body.to_string(),
        (false, true) => title.to_string(),
        (false, false) => format!("{}: {}", title, body),
    }
}

pub struct SmsSender {
    directory: Arc<dyn UserDirectory>,
    delivery: SmsDelivery,
}

impl SmsSender {
    pub fn new(directory: Arc<dyn UserDirectory>, delivery: SmsDelivery) -> Self {
        Self { directory, delivery }
    }
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, notification: &QueuedNotification) -> SendOutcome {
        if !self.delivery.is_configured() {
            return SendOutcome::failed("sms transport not configured");
        }

        let phone = match self.directory.contact(notification.user_id).await {
            Ok(contact) => contact.and_then(|c| c.phone).filter(|p| !p.trim().is_empty()),
            Err(e) => return SendOutcome::failed(format!("contact lookup failed: {}", e)),
        };
        let Some(phone) = phone else {
            return SendOutcome::failed("user has no phone number");
        };

        match self
            .delivery
            .send(&phone, sms_text(&notification.title, &notification.body))
            .await
        {
            Ok(id) => SendOutcome::delivered(id),
            Err(e) => SendOutcome::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::claimed_row;
    use courier_core::store::MemoryStore;
    use courier_core::UserContact;

    fn configured() -> DeliveryConfig {
        DeliveryConfig {
            sms_gateway_url: Some("https://sms.example.com/send".to_string()),
            sms_gateway_token: Some("secret".to_string()),
            ..DeliveryConfig::default()
        }
    }

    #[test]
    fn text_joins_title_and_body() {
        assert_eq!(sms_text("Task done", "Clean room"), "Task done: Clean room");
        assert_eq!(sms_text("", "Clean room"), "Clean room");
        assert_eq!(sms_text("Task done", " "), "Task done");
    }

    #[test]
    fn url_and_token_are_both_required() {
        let url_only = DeliveryConfig {
            sms_gateway_url: Some("https://sms.example.com/send".to_string()),
            ..DeliveryConfig::default()
        };
        assert!(!SmsDelivery::new(&url_only).unwrap().is_configured());
        assert!(SmsDelivery::new(&configured()).unwrap().is_configured());
    }

    #[tokio::test]
    async fn missing_phone_fails() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_user(
                1,
                UserContact {
                    email: Some("a@example.com".to_string()),
                    phone: None,
                },
                false,
            )
            .await;
        let sender = SmsSender::new(store, SmsDelivery::new(&configured()).unwrap());

        let outcome = sender.send(&claimed_row(1, "sms")).await;
        assert_eq!(outcome, SendOutcome::failed("user has no phone number"));
    }

    #[tokio::test]
    async fn unconfigured_gateway_fails() {
        let sender = SmsSender::new(
            Arc::new(MemoryStore::new()),
            SmsDelivery::new(&DeliveryConfig::default()).unwrap(),
        );
        let outcome = sender.send(&claimed_row(1, "sms")).await;
        assert_eq!(outcome, SendOutcome::failed("sms transport not configured"));
    }
}
