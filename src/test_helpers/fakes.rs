use std::{sync::Mutex, time::Duration};

use async_trait::async_trait;

use crate::{
    engine::queue::EscalationQueue,
    notifier::{
        DeliveryStatus, NotificationContent, Notifier, NotifierError, WebhookDispatcher,
        WebhookEvent,
    },
};

/// An escalation queue that only remembers what was requested.
#[derive(Debug, Default)]
pub struct RecordingQueue {
    requests: Mutex<Vec<i64>>,
}

impl RecordingQueue {
    /// Returns and clears the recorded requests.
    pub fn take(&self) -> Vec<i64> {
        std::mem::take(&mut *self.requests.lock().unwrap())
    }
}

#[async_trait]
impl EscalationQueue for RecordingQueue {
    async fn enqueue(&self, alert_group_id: i64) {
        self.requests.lock().unwrap().push(alert_group_id);
    }
}

/// One recorded delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Recipient.
    pub user_id: String,
    /// Channel used.
    pub channel: String,
    /// What was sent.
    pub content: NotificationContent,
}

/// A notifier that records deliveries and reports them as sent.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    deliveries: Mutex<Vec<Delivery>>,
    delay: Option<Duration>,
}

impl RecordingNotifier {
    /// A notifier that takes `delay` to answer.
    pub fn slow(delay: Duration) -> Self {
        Self { deliveries: Mutex::default(), delay: Some(delay) }
    }

    /// Everything delivered so far.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(
        &self,
        user_id: &str,
        channel: &str,
        content: &NotificationContent,
    ) -> DeliveryStatus {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.deliveries.lock().unwrap().push(Delivery {
            user_id: user_id.to_string(),
            channel: channel.to_string(),
            content: content.clone(),
        });
        DeliveryStatus::Sent
    }
}

/// A webhook dispatcher that records events.
#[derive(Debug, Default)]
pub struct RecordingWebhookDispatcher {
    events: Mutex<Vec<(String, WebhookEvent)>>,
}

impl RecordingWebhookDispatcher {
    /// Everything dispatched so far.
    pub fn events(&self) -> Vec<(String, WebhookEvent)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookDispatcher for RecordingWebhookDispatcher {
    async fn dispatch(&self, webhook_id: &str, event: WebhookEvent) -> Result<(), NotifierError> {
        self.events.lock().unwrap().push((webhook_id.to_string(), event));
        Ok(())
    }
}
