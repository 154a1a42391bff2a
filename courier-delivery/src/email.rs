use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use courier_core::config::DeliveryConfig;
use courier_core::store::UserDirectory;
use courier_core::{Channel, QueuedNotification};
use serde::{Deserialize, Serialize};

use crate::sender::{ChannelSender, SendOutcome};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

fn html_escape(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '&' => "&amp;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&#x27;".to_string(),
            _ => c.to_string(),
        })
        .collect()
}

/// Wraps a message in the mail layout. `body` is the rendered email variant
/// and goes in as markup; `subject` is plain text.
fn html_body(subject: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
</head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Arial, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="margin: 0 0 16px 0; color: #212529;">{}</h2>
    <div style="margin: 0; white-space: pre-line;">{}</div>
</body>
</html>"#,
        html_escape(subject),
        body
    )
}

#[derive(Debug, Serialize)]
struct ResendEmailRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: &'a str,
    html: String,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    id: String,
}

/// Resend HTTP API transport.
pub struct EmailDelivery {
    client: Option<reqwest::Client>,
    api_key: Option<String>,
    from_email: Option<String>,
}

impl EmailDelivery {
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        let (client, api_key, from_email) =
            if let (Some(api_key), Some(from_email)) = (&config.resend_api_key, &config.resend_from_email) {
                tracing::info!("Initializing Resend email client");
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(30))
                    .build()
                    .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
                (Some(client), Some(api_key.clone()), Some(from_email.clone()))
            } else {
                tracing::warn!("Email delivery disabled (missing Resend configuration)");
                (None, None, None)
            };

        Ok(Self {
            client,
            api_key,
            from_email,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    /// Sends one message and returns the Resend email id.
    pub async fn send(&self, to: &str, subject: &str, body: &str) -> Result<String> {
        let (client, api_key, from_email) = match (&self.client, &self.api_key, &self.from_email) {
            (Some(c), Some(k), Some(f)) => (c, k, f),
            _ => return Err(anyhow!("email transport not configured")),
        };

        let request = ResendEmailRequest {
            from: from_email,
            to: vec![to],
            subject,
            html: html_body(subject, body),
            text: body,
        };

        let response = client
            .post(RESEND_API_URL)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to send HTTP request to Resend: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("Resend API returned error status {}: {}", status, error_text));
        }

        let parsed: ResendEmailResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse Resend API response: {}", e))?;

        tracing::debug!("Email sent via Resend to {} (email_id: {})", to, parsed.id);
        Ok(parsed.id)
    }
}

pub struct EmailSender {
    directory: Arc<dyn UserDirectory>,
    delivery: EmailDelivery,
}

impl EmailSender {
    pub fn new(directory: Arc<dyn UserDirectory>, delivery: EmailDelivery) -> Self {
        Self { directory, delivery }
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, notification: &QueuedNotification) -> SendOutcome {
        if !self.delivery.is_configured() {
            return SendOutcome::failed("email transport not configured");
        }

        let address = match self.directory.contact(notification.user_id).await {
            Ok(contact) => contact.and_then(|c| c.email).filter(|e| !e.trim().is_empty()),
            Err(e) => return SendOutcome::failed(format!("contact lookup failed: {}", e)),
        };
        let Some(address) = address else {
            return SendOutcome::failed("user has no email address");
        };

        match self
            .delivery
            .send(&address, &notification.title, &notification.body)
            .await
        {
            Ok(id) => SendOutcome::delivered(Some(id)),
            Err(e) => SendOutcome::failed(e.to_string()),
        }
    }
}
