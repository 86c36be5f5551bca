use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use super::{DeliveryStatus, NotificationContent, Notifier, NotifierError};

#[derive(Serialize)]
struct Envelope<'a> {
    user_id: &'a str,
    channel: &'a str,
    content: &'a NotificationContent,
}

/// Posts every delivery as a JSON envelope to a relay service.
///
/// The client does not retry. A failed post is a failed attempt and the
/// relay owns redelivery.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    relay_url: Url,
    client: reqwest::Client,
}

impl HttpNotifier {
    /// Creates a notifier posting to `relay_url`.
    pub fn new(relay_url: Url, client: reqwest::Client) -> Self {
        Self { relay_url, client }
    }

    async fn post(&self, envelope: &Envelope<'_>) -> Result<(), NotifierError> {
        let response = self.client.post(self.relay_url.clone()).json(envelope).send().await?;
        if !response.status().is_success() {
            return Err(NotifierError::Status(response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn deliver(
        &self,
        user_id: &str,
        channel: &str,
        content: &NotificationContent,
    ) -> DeliveryStatus {
        let envelope = Envelope { user_id, channel, content };
        match self.post(&envelope).await {
            Ok(()) => DeliveryStatus::Sent,
            Err(e) => {
                tracing::warn!(user_id, channel, alert_group_id = content.alert_group_id, error = %e, "Relay rejected notification.");
                DeliveryStatus::Failed(e.to_string())
            }
        }
    }
}
