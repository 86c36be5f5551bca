//! Heartbeat monitoring: integrations that stop pinging raise an alert.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{
    EngineServices,
    actions::{ActionError, AlertGroupService},
    pipeline::AlertPipeline,
};
use crate::{
    config::HeartbeatMonitorConfig,
    models::{Actor, GroupAction, HeartbeatConfig},
    persistence::error::PersistenceError,
};

/// Errors raised by heartbeat operations.
#[derive(Debug, Error)]
pub enum HeartbeatError {
    /// The integration does not exist or is deleted.
    #[error("Unknown integration: {0}")]
    UnknownIntegration(i64),

    /// The integration has no heartbeat configured.
    #[error("No heartbeat configured for integration {0}")]
    NotConfigured(i64),

    /// The interval must be positive.
    #[error("Heartbeat interval must be positive")]
    InvalidInterval,

    /// Resolving the episode's group failed.
    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    /// Storage failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Watches heartbeat deadlines and turns missed ones into alerts.
///
/// A missing-heartbeat episode opens at most one alert group; the next ping
/// resolves it.
pub struct HeartbeatMonitor {
    services: EngineServices,
    pipeline: Arc<AlertPipeline>,
    actions: Arc<AlertGroupService>,
    config: HeartbeatMonitorConfig,
}

impl HeartbeatMonitor {
    /// Creates a new `HeartbeatMonitor`.
    pub fn new(
        services: EngineServices,
        pipeline: Arc<AlertPipeline>,
        actions: Arc<AlertGroupService>,
        config: HeartbeatMonitorConfig,
    ) -> Self {
        Self { services, pipeline, actions, config }
    }

    /// Configures (or reconfigures) the heartbeat of an integration.
    pub async fn configure(
        &self,
        integration_id: i64,
        interval_seconds: u64,
    ) -> Result<HeartbeatConfig, HeartbeatError> {
        if interval_seconds == 0 {
            return Err(HeartbeatError::InvalidInterval);
        }
        match self.services.repo.get_integration(integration_id).await? {
            Some(integration) if !integration.is_deleted() => {}
            _ => return Err(HeartbeatError::UnknownIntegration(integration_id)),
        }
        let config = self
            .services
            .repo
            .upsert_heartbeat(integration_id, interval_seconds, self.services.clock.now())
            .await?;
        tracing::info!(integration_id, interval_seconds, "Heartbeat configured.");
        Ok(config)
    }

    /// Records a ping. Resolves the open episode's group, if any.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn ping(&self, integration_id: i64) -> Result<(), HeartbeatError> {
        let previous = self
            .services
            .repo
            .record_heartbeat_ping(integration_id, self.services.clock.now())
            .await?
            .ok_or(HeartbeatError::NotConfigured(integration_id))?;

        if previous.alerted
            && let Some(alert_group_id) = previous.alert_group_id
        {
            self.actions.apply(alert_group_id, GroupAction::Resolve, Actor::Source).await?;
            tracing::info!(integration_id, alert_group_id, "Heartbeat restored; episode resolved.");
        }
        Ok(())
    }

    /// Checks every heartbeat once and returns how long to wait before the
    /// next sweep.
    pub async fn sweep(&self) -> Result<Duration, HeartbeatError> {
        let now = self.services.clock.now();
        let heartbeats = self.services.repo.list_heartbeats().await?;

        for heartbeat in heartbeats.iter().filter(|h| !h.alerted && h.is_expired(now)) {
            let integration_id = heartbeat.integration_id;
            // Claims the episode; a ping or a concurrent sweep makes this false.
            if !self.services.repo.open_heartbeat_episode(integration_id, heartbeat.last_seen_at).await? {
                continue;
            }
            tracing::warn!(integration_id, last_seen_at = %heartbeat.last_seen_at, "Heartbeat missing.");

            let payload = json!({ "kind": "heartbeat_missing", "integration_id": integration_id });
            match self.pipeline.ingest(integration_id, payload).await {
                Ok(receipt) => {
                    self.services
                        .repo
                        .set_heartbeat_episode_group(integration_id, receipt.alert_group_id)
                        .await?;
                }
                Err(e) => {
                    tracing::error!(integration_id, error = %e, "Failed to raise missing-heartbeat alert.");
                    // Reopens the episode so the next sweep tries again.
                    self.services.repo.abandon_heartbeat_episode(integration_id).await?;
                }
            }
        }

        let smallest = heartbeats.iter().map(|h| Duration::from_secs(h.interval_seconds)).min();
        Ok(smallest.map_or(self.config.max_sweep_interval_secs, |interval| {
            interval.min(self.config.max_sweep_interval_secs)
        }))
    }

    /// Sweeps until cancelled.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        tracing::info!("Heartbeat monitor started.");
        loop {
            let wait = match self.sweep().await {
                Ok(wait) => wait,
                Err(e) => {
                    tracing::error!(error = %e, "Heartbeat sweep failed.");
                    self.config.max_sweep_interval_secs
                }
            };
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(wait.max(Duration::from_secs(1))) => {}
            }
        }
        tracing::info!("Heartbeat monitor stopped.");
    }
}
