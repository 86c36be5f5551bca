use async_trait::async_trait;

use super::{DeliveryStatus, NotificationContent, Notifier};

/// Writes every delivery to the log and reports it as sent.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(
        &self,
        user_id: &str,
        channel: &str,
        content: &NotificationContent,
    ) -> DeliveryStatus {
        tracing::info!(
            user_id,
            channel,
            alert_group_id = content.alert_group_id,
            integration_id = content.integration_id,
            step_index = content.step_index,
            tier = ?content.tier,
            "Notification delivered."
        );
        DeliveryStatus::Sent
    }
}
