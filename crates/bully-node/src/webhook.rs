//! Webhook notified when this node becomes leader

use crate::error::{NodeError, Result};
use async_trait::async_trait;
use bully_cluster::ElectionObserver;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Body posted to the webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectedMessage {
    /// Unix seconds at which the notification was sent
    pub time: i64,
}

/// Posts [`ElectedMessage`] to a configured URL. Best effort: failures are
/// logged and never reach the election.
pub struct WebhookObserver {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookObserver {
    /// `None`, an empty URL or `"none"` disable the hook.
    pub fn new(url: Option<&str>, timeout: Duration) -> Result<Self> {
        let url = url
            .map(str::trim)
            .filter(|url| !url.is_empty() && *url != "none")
            .map(str::to_string);

        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self { url, client })
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Post one notification. Returns `Ok(false)` when the hook is disabled.
    pub async fn notify(&self) -> Result<bool> {
        let Some(url) = &self.url else {
            return Ok(false);
        };

        let payload = ElectedMessage {
            time: chrono::Utc::now().timestamp(),
        };
        let response = self.client.post(url).json(&payload).send().await?;

        if !response.status().is_success() {
            return Err(NodeError::WebhookStatus(response.status().as_u16()));
        }
        Ok(true)
    }
}

#[async_trait]
impl ElectionObserver for WebhookObserver {
    async fn on_being_elected(&self) {
        match self.notify().await {
            Ok(true) => tracing::info!("Webhook notified of election"),
            Ok(false) => {}
            Err(e) => tracing::warn!("Webhook notification failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_posts_elected_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/elected"))
            .and(header("content-type", "application/json"))
            .and(body_string_contains("\"time\":"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/elected", server.uri());
        let hook = WebhookObserver::new(Some(&url), DEFAULT_TIMEOUT).unwrap();
        assert!(hook.notify().await.unwrap());
    }

    #[tokio::test]
    async fn test_error_status_is_reported_but_swallowed_by_observer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let hook = WebhookObserver::new(Some(&server.uri()), DEFAULT_TIMEOUT).unwrap();
        assert!(matches!(hook.notify().await, Err(NodeError::WebhookStatus(500))));
        hook.on_being_elected().await;
    }

    #[tokio::test]
    async fn test_slow_webhook_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let hook = WebhookObserver::new(Some(&server.uri()), Duration::from_millis(200)).unwrap();
        assert!(matches!(hook.notify().await, Err(NodeError::Webhook(_))));
    }

    #[tokio::test]
    async fn test_disabled_hook() {
        for url in [None, Some(""), Some("none")] {
            let hook = WebhookObserver::new(url, DEFAULT_TIMEOUT).unwrap();
            assert!(!hook.is_enabled());
            assert!(!hook.notify().await.unwrap());
        }
    }
}
