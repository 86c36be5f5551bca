//! The escalation queue: alert group ids waiting for an executor run.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

/// Accepts escalation run requests.
///
/// Requests are hints: the executor coalesces duplicates through the lease
/// and recomputes everything from persisted state, so a lost request only
/// delays a run until the next recovery or scheduler tick.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EscalationQueue: Send + Sync {
    /// Requests a run for `alert_group_id`.
    async fn enqueue(&self, alert_group_id: i64);
}

/// A bounded in-process queue.
#[derive(Debug, Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<i64>,
}

impl ChannelQueue {
    /// Creates the queue and the receiving end for the dispatcher.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<i64>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EscalationQueue for ChannelQueue {
    async fn enqueue(&self, alert_group_id: i64) {
        if self.tx.send(alert_group_id).await.is_err() {
            tracing::warn!(alert_group_id, "Escalation queue is closed; run request dropped.");
        }
    }
}
