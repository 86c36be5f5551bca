//! Outbound adapters: user notification, webhook dispatch and on-call
//! resolution.
//!
//! The engine decides that and when a delivery happens; transports behind
//! these traits do the rest.

mod error;
mod http;
mod log;
mod on_call;
mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use error::NotifierError;
pub use http::HttpNotifier;
pub use log::LogNotifier;
#[cfg(test)]
use mockall::automock;
pub use on_call::StaticOnCallResolver;
use serde::{Deserialize, Serialize};
use serde_json::Value;
pub use webhook::HttpWebhookDispatcher;

use crate::models::{MaintenanceMode, NotificationTier};

/// What a user is being notified about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationContent {
    /// Alert group being escalated.
    pub alert_group_id: i64,
    /// Source integration.
    pub integration_id: i64,
    /// Chain step that triggered the notification.
    pub step_index: usize,
    /// Policy tier used.
    pub tier: NotificationTier,
    /// First alert of the group.
    pub payload: Value,
}

/// Result of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Accepted by the transport.
    Sent,
    /// Refused or failed.
    Failed(String),
}

/// Payload handed to webhook targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookEvent {
    /// Alert group being escalated.
    pub alert_group_id: i64,
    /// Source integration.
    pub integration_id: i64,
    /// Chain step that fired the webhook.
    pub step_index: usize,
    /// First alert of the group.
    pub payload: Value,
    /// Set when the chain runs under maintenance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<MaintenanceMode>,
}

/// Delivers a notification to one user over one channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Attempts one delivery.
    async fn deliver(
        &self,
        user_id: &str,
        channel: &str,
        content: &NotificationContent,
    ) -> DeliveryStatus;
}

/// Hands webhook calls to a background transport.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebhookDispatcher: Send + Sync {
    /// Schedules a call to `webhook_id`. Returns once the call is queued;
    /// the outcome of the request itself is not reported back.
    async fn dispatch(&self, webhook_id: &str, event: WebhookEvent) -> Result<(), NotifierError>;
}

/// Resolves schedules and teams to user ids.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OnCallResolver: Send + Sync {
    /// Users on call for `schedule_id` at `at`.
    async fn current_on_call(
        &self,
        schedule_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, NotifierError>;

    /// Members of `team_id`.
    async fn team_members(&self, team_id: &str) -> Result<Vec<String>, NotifierError>;
}
