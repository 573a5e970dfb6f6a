//! Outbound notifications. Delivery is fire-and-forget and only happens after commit.

use crate::{config::NotifyConfig, UserId};
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    fn notify_user(&self, user_id: UserId, message: &str);
    fn alert_operators(&self, message: &str);
}

/// Writes notifications to the log. Default sink when no webhook is configured.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify_user(&self, user_id: UserId, message: &str) {
        info!(target: "escrow_desk::notify", user_id, "{}", message);
    }

    fn alert_operators(&self, message: &str) {
        warn!(target: "escrow_desk::notify", "operator alert: {}", message);
    }
}

#[derive(Debug, Serialize)]
struct WebhookMessage {
    chat_id: String,
    text: String,
}

/// Posts each notification to a chat gateway webhook.
#[derive(Clone)]
pub struct WebhookNotifier {
    endpoint: String,
    operator_chat: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(endpoint: String, operator_chat: Option<String>) -> Self {
        Self {
            endpoint,
            operator_chat: operator_chat.unwrap_or_else(|| "operators".to_string()),
            client: Client::new(),
        }
    }

    pub fn from_config(config: &NotifyConfig) -> Option<Self> {
        config
            .webhook_url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.operator_chat.clone()))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn post(&self, chat_id: String, text: &str) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime, dropping notification for {}", chat_id);
                return;
            }
        };

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let body = WebhookMessage {
            chat_id,
            text: text.to_string(),
        };

        handle.spawn(async move {
            let result = client.post(&endpoint).json(&body).send().await;
            match result {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => warn!("Webhook {} answered {}", endpoint, response.status()),
                Err(e) => warn!("Webhook {} unreachable: {}", endpoint, e),
            }
        });
    }
}

impl Notifier for WebhookNotifier {
    fn notify_user(&self, user_id: UserId, message: &str) {
        self.post(user_id.to_string(), message);
    }

    fn alert_operators(&self, message: &str) {
        self.post(self.operator_chat.clone(), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_from_config() {
        let mut config = NotifyConfig::default();
        assert!(WebhookNotifier::from_config(&config).is_none());

        config.webhook_url = Some("http://127.0.0.1:9/hook".to_string());
        let notifier = WebhookNotifier::from_config(&config).unwrap();
        assert_eq!(notifier.endpoint(), "http://127.0.0.1:9/hook");
        assert_eq!(notifier.operator_chat, "operators");
    }

    #[test]
    fn test_post_without_runtime_is_dropped() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook".to_string(), None);
        notifier.notify_user(1, "hello");
    }
}
