//! Alerting module for webhook notifications
//!
//! Delivers every alert as JSON to the configured generic webhooks.

use async_trait::async_trait;
use reqwest::Client;

use crate::config::WebhookConfig;
use crate::models::Alert;
use crate::sink::{AlertSink, DeliveryLedger, SinkError};

/// Sends alerts to generic HTTP webhooks
pub struct WebhookSink {
    webhooks: Vec<WebhookConfig>,
    client: Client,
    ledger: DeliveryLedger,
}

impl WebhookSink {
    pub fn new(webhooks: Vec<WebhookConfig>) -> Result<Self, SinkError> {
        let client = Client::builder().build()?;
        Ok(WebhookSink {
            webhooks,
            client,
            ledger: DeliveryLedger::new(),
        })
    }

    fn wants(config: &WebhookConfig, alert: &Alert) -> bool {
        config
            .min_severity
            .map_or(true, |min| alert.severity >= min)
    }

    /// Send an alert to a generic webhook
    async fn send_generic_webhook(&self, config: &WebhookConfig, alert: &Alert) -> Result<(), SinkError> {
        let method = config.method.as_deref().unwrap_or("POST");

        let mut request = match method.to_uppercase().as_str() {
            "PUT" => self.client.put(&config.url),
            _ => self.client.post(&config.url),
        }
        .timeout(config.timeout());

        // Add custom headers
        if let Some(ref headers) = config.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }

        let response = request.json(alert).send().await?;

        if !response.status().is_success() {
            log::warn!(
                "Webhook {} returned non-success status: {}",
                config.name,
                response.status()
            );
            return Err(SinkError::Rejected(format!(
                "webhook {} returned {}",
                config.name,
                response.status()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn put(&self, alert: &Alert) -> Result<(), SinkError> {
        let mut delivered = self.ledger.delivered(&alert.event_id);
        let mut first_error = None;

        let targets = self
            .webhooks
            .iter()
            .enumerate()
            .filter(|(_, w)| Self::wants(w, alert));
        for (index, webhook) in targets {
            if delivered.contains(&index) {
                continue;
            }
            log::debug!("Dispatching alert {} to webhook {}", alert.event_id, webhook.name);
            match self.send_generic_webhook(webhook, alert).await {
                Ok(()) => {
                    delivered.insert(index);
                }
                Err(e) => {
                    log::error!("Webhook {} failed: {}", webhook.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        self.ledger
            .settle(&alert.event_id, delivered, self.webhooks.len(), first_error)
    }

    fn abandon(&self, alert: &Alert) {
        self.ledger.forget(&alert.event_id);
    }
}
