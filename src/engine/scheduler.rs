//! Durable deadlines: parked chains, silence expiry and stale leases.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::{
    EngineServices,
    actions::{ActionError, AlertGroupService},
};
use crate::{
    config::SchedulerConfig,
    models::{Actor, GroupAction},
    persistence::error::PersistenceError,
};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Parked groups whose deadline passed.
    pub woken: Vec<i64>,
    /// Silenced groups whose silence ran out.
    pub unsilenced: Vec<i64>,
    /// Groups whose run lease expired.
    pub reclaimed: Vec<i64>,
}

/// Turns persisted deadlines back into escalation run requests.
pub struct EscalationScheduler {
    services: EngineServices,
    actions: Arc<AlertGroupService>,
    config: SchedulerConfig,
}

impl EscalationScheduler {
    /// Creates a new `EscalationScheduler`.
    pub fn new(services: EngineServices, actions: Arc<AlertGroupService>, config: SchedulerConfig) -> Self {
        Self { services, actions, config }
    }

    /// Processes every deadline at or before `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, PersistenceError> {
        let repo = &self.services.repo;

        let woken = repo.take_due_wakeups(now).await?;
        for &alert_group_id in &woken {
            self.services.queue.enqueue(alert_group_id).await;
        }

        let mut unsilenced = Vec::new();
        for alert_group_id in repo.expired_silences(now).await? {
            // Unsilence requests the run itself.
            match self.actions.apply(alert_group_id, GroupAction::Unsilence, Actor::System).await {
                Ok(result) if result.changed => unsilenced.push(alert_group_id),
                Ok(_) => {}
                Err(ActionError::Persistence(e)) => return Err(e),
                Err(e) => tracing::warn!(alert_group_id, error = %e, "Failed to end silence."),
            }
        }

        let reclaimed = repo.reclaim_expired_leases(now).await?;
        for &alert_group_id in &reclaimed {
            tracing::warn!(alert_group_id, "Escalation lease expired; re-queueing.");
            self.services.queue.enqueue(alert_group_id).await;
        }

        if !(woken.is_empty() && unsilenced.is_empty() && reclaimed.is_empty()) {
            tracing::debug!(woken = woken.len(), unsilenced = unsilenced.len(), reclaimed = reclaimed.len(), "Scheduler tick.");
        }
        Ok(TickReport { woken, unsilenced, reclaimed })
    }

    /// Re-queues every group that was escalating when the process stopped.
    /// Parked groups are left to [`Self::tick`].
    pub async fn recover(&self) -> Result<usize, PersistenceError> {
        let resumable = self.services.repo.resumable_alert_groups().await?;
        for &alert_group_id in &resumable {
            self.services.queue.enqueue(alert_group_id).await;
        }
        tracing::info!(count = resumable.len(), "Escalations recovered.");
        Ok(resumable.len())
    }

    /// Ticks until cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval_ms);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("Escalation scheduler started.");
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(self.services.clock.now()).await {
                        tracing::error!(error = %e, "Scheduler tick failed.");
                    }
                }
            }
        }
        tracing::info!("Escalation scheduler stopped.");
    }
}
