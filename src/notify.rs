//! Webhook forwarding for accepted alerts
//!
//! Fire-and-forget: each accepted alert is POSTed as JSON to the
//! configured URL from its own task, so a slow or dead endpoint never
//! stalls the monitors.

use reqwest::Client;
use serde_json::json;
use tracing::{error, info};

use crate::alerts::Alert;
use crate::config::Webhook;

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    webhook: Webhook,
}

impl WebhookNotifier {
    pub fn new(webhook: Webhook) -> Self {
        Self {
            client: Client::new(),
            webhook,
        }
    }

    /// Spawn the delivery of one alert.
    pub fn forward(&self, alert: Alert) {
        let notifier = self.clone();
        tokio::spawn(async move {
            notifier.send(&alert).await;
        });
    }

    async fn send(&self, alert: &Alert) {
        let payload = json!({
            "id": alert.id,
            "type": alert.alert_type,
            "severity": alert.severity,
            "title": alert.title,
            "message": alert.message,
            "details": alert.details,
            "timestamp": alert.timestamp.to_rfc3339(),
        });

        match self
            .client
            .post(&self.webhook.url)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => {
                if response.status().is_success() {
                    info!("forwarded alert {} to webhook", alert.id);
                } else {
                    error!(
                        "webhook alert delivery failed with status: {}",
                        response.status()
                    );
                }
            }
            Err(e) => {
                error!("failed to deliver webhook alert: {}", e);
            }
        }
    }
}
