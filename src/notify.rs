//! Alert delivery channels

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(8);

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()>;
}

/// JSON POST to a configured webhook
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String) -> Self {
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, webhook_url }
    }
}

#[async_trait]
impl NotificationChannel for WebhookNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        let payload = json!({
            "recipient": recipient,
            "subject": subject,
            "body": body,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("[Notify] Alert delivered to {}: {}", recipient, subject);
                    Ok(())
                } else {
                    error!("[Notify] Webhook failed: {}", response.status());
                    bail!("webhook responded with {}", response.status())
                }
            }
            Err(e) => {
                error!("[Notify] Failed to send webhook: {}", e);
                Err(e.into())
            }
        }
    }
}

/// Writes alerts to the log when no webhook is configured
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationChannel for LogNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        info!("[Notify] {} -> {}: {}", subject, recipient, body.replace('\n', " | "));
        Ok(())
    }
}
