//! Generic webhook receiver

use std::time::Duration;

use async_trait::async_trait;
use piped_model::NotificationEvent;
use reqwest::Client;
use tracing::{error, warn};

use crate::config::piped::WebhookReceiver;
use crate::errors::AgentError;
use crate::notifier::{EventQueue, Sender};

const QUEUE_CAPACITY: usize = 1000;

/// Posts every event as JSON, signed with a shared header
pub struct WebhookSender {
    name: String,
    url: String,
    signature_key: String,
    signature_value: String,
    client: Client,
    queue: EventQueue,
}

impl WebhookSender {
    pub async fn new(name: &str, config: &WebhookReceiver) -> Result<Self, AgentError> {
        let signature_value = config.load_signature_value().await?;
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            name: name.to_string(),
            url: config.url.clone(),
            signature_key: config.signature_key.clone(),
            signature_value,
            client,
            queue: EventQueue::new(QUEUE_CAPACITY),
        })
    }
}

#[async_trait]
impl Sender for WebhookSender {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue(&self) -> &EventQueue {
        &self.queue
    }

    async fn send(&self, event: &NotificationEvent) {
        let response = self
            .client
            .post(&self.url)
            .header(self.signature_key.as_str(), self.signature_value.as_str())
            .json(event)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(
                    receiver = %self.name,
                    "webhook returned {} for {}", response.status(), event.event_type
                );
            }
            Err(e) => {
                error!(receiver = %self.name, "unable to send notification to webhook: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use piped_model::notification::PipedEventData;
    use piped_model::{NotificationEventMetadata, NotificationEventType};
    use std::io::Write;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> NotificationEvent {
        NotificationEvent::new(
            NotificationEventType::PipedStarted,
            NotificationEventMetadata::Piped(PipedEventData {
                id: "piped-1".to_string(),
                version: "v1".to_string(),
                project_id: "p".to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn test_send_with_signature_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(header("Pipecd-Signature", "s3cret"))
            .and(body_partial_json(serde_json::json!({"type": "PIPED_STARTED"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = WebhookReceiver {
            url: format!("{}/events", server.uri()),
            signature_key: "Pipecd-Signature".to_string(),
            signature_value: "s3cret".to_string(),
            signature_value_file: String::new(),
        };
        let sender = WebhookSender::new("hook", &config).await.unwrap();
        sender.send(&event()).await;
    }

    #[tokio::test]
    async fn test_signature_from_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-Sig", "from-file"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "from-file").unwrap();
        let config = WebhookReceiver {
            url: server.uri(),
            signature_key: "X-Sig".to_string(),
            signature_value: String::new(),
            signature_value_file: file.path().to_string_lossy().to_string(),
        };
        let sender = WebhookSender::new("hook", &config).await.unwrap();
        // A failing endpoint is logged, not surfaced.
        sender.send(&event()).await;
    }
}
