use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;

/// Counters updated on the hot paths of the engine.
#[derive(Debug)]
pub struct Metrics {
    /// The time the application started.
    pub start_time: tokio::time::Instant,
    alerts_ingested: AtomicU64,
    alert_groups_created: AtomicU64,
    predicate_evaluation_errors: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_failed: AtomicU64,
    webhooks_dispatched: AtomicU64,
    escalation_runs: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
            alerts_ingested: AtomicU64::new(0),
            alert_groups_created: AtomicU64::new(0),
            predicate_evaluation_errors: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            notifications_failed: AtomicU64::new(0),
            webhooks_dispatched: AtomicU64::new(0),
            escalation_runs: AtomicU64::new(0),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Alerts accepted by the pipeline.
    pub alerts_ingested: u64,
    /// Alert groups created.
    pub alert_groups_created: u64,
    /// Routing or auto-action predicates that failed to evaluate.
    pub predicate_evaluation_errors: u64,
    /// Deliveries reported as sent.
    pub notifications_sent: u64,
    /// Deliveries that failed or timed out.
    pub notifications_failed: u64,
    /// Webhooks handed to the dispatcher.
    pub webhooks_dispatched: u64,
    /// Escalation runs that held the lease.
    pub escalation_runs: u64,
}

impl Metrics {
    /// Records an accepted alert.
    pub fn alert_ingested(&self) {
        self.alerts_ingested.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a new alert group.
    pub fn alert_group_created(&self) {
        self.alert_groups_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a predicate that failed to evaluate.
    pub fn predicate_evaluation_error(&self) {
        self.predicate_evaluation_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a delivery outcome.
    pub fn notification(&self, sent: bool) {
        let counter = if sent { &self.notifications_sent } else { &self.notifications_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dispatched webhook.
    pub fn webhook_dispatched(&self) {
        self.webhooks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an escalation run.
    pub fn escalation_run(&self) {
        self.escalation_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            alerts_ingested: self.alerts_ingested.load(Ordering::Relaxed),
            alert_groups_created: self.alert_groups_created.load(Ordering::Relaxed),
            predicate_evaluation_errors: self.predicate_evaluation_errors.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            webhooks_dispatched: self.webhooks_dispatched.load(Ordering::Relaxed),
            escalation_runs: self.escalation_runs.load(Ordering::Relaxed),
        }
    }
}

/// Shared application metrics.
#[derive(Debug, Clone, Default)]
pub struct AppMetrics {
    /// Shared metrics.
    pub metrics: Arc<Metrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_shared_between_clones() {
        let metrics = AppMetrics::default();
        let clone = metrics.clone();
        clone.metrics.alert_ingested();
        clone.metrics.notification(true);
        clone.metrics.notification(false);
        metrics.metrics.notification(false);

        let snapshot = metrics.metrics.snapshot();
        assert_eq!(snapshot.alerts_ingested, 1);
        assert_eq!(snapshot.notifications_sent, 1);
        assert_eq!(snapshot.notifications_failed, 2);
        assert_eq!(snapshot.webhooks_dispatched, 0);
    }
}
