use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::task::TaskTracker;

use super::{NotifierError, WebhookDispatcher, WebhookEvent};
use crate::{http_client::HttpClientPool, models::webhook::WebhookConfig};

/// Sends webhook events over HTTP on background tasks.
///
/// Each target uses the retrying client of its own retry policy. Calls
/// still in flight at shutdown can be awaited through [`Self::wait`].
pub struct HttpWebhookDispatcher {
    targets: HashMap<String, WebhookConfig>,
    pool: Arc<HttpClientPool>,
    tasks: TaskTracker,
}

impl HttpWebhookDispatcher {
    /// Creates a dispatcher for the given targets.
    pub fn new(targets: Vec<WebhookConfig>, pool: Arc<HttpClientPool>) -> Self {
        Self {
            targets: targets.into_iter().map(|t| (t.id.clone(), t)).collect(),
            pool,
            tasks: TaskTracker::new(),
        }
    }

    /// Waits for every call dispatched so far.
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

fn build_headers(target: &WebhookConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &target.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!(webhook_id = %target.id, header = %name, "Skipping invalid webhook header."),
        }
    }
    headers
}

#[async_trait]
impl WebhookDispatcher for HttpWebhookDispatcher {
    async fn dispatch(&self, webhook_id: &str, event: WebhookEvent) -> Result<(), NotifierError> {
        let target = self
            .targets
            .get(webhook_id)
            .ok_or_else(|| NotifierError::UnknownWebhook(webhook_id.to_string()))?;
        let client = self.pool.get_or_create(&target.retry_policy).await?;
        let url = target.url.clone();
        let headers = build_headers(target);
        let webhook_id = webhook_id.to_string();

        self.tasks.spawn(async move {
            let result = client.post(url).headers(headers).json(&event).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(webhook_id, alert_group_id = event.alert_group_id, "Webhook delivered.");
                }
                Ok(response) => {
                    tracing::warn!(webhook_id, alert_group_id = event.alert_group_id, status = %response.status(), "Webhook target returned an error.");
                }
                Err(e) => {
                    tracing::warn!(webhook_id, alert_group_id = event.alert_group_id, error = %e, "Webhook call failed.");
                }
            }
        });
        Ok(())
    }
}
