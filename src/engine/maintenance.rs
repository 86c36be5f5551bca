//! Maintenance windows: per-integration escalation gating with durable
//! expiry.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    clock::Clock,
    engine::queue::EscalationQueue,
    models::{MaintenanceDecision, MaintenanceMode, MaintenanceWindow},
    persistence::{error::PersistenceError, traits::StateRepository},
};

/// Errors raised by maintenance operations.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    /// The integration does not exist or is deleted.
    #[error("Unknown integration: {0}")]
    UnknownIntegration(i64),

    /// A window must last a positive amount of time.
    #[error("Maintenance duration must be positive")]
    InvalidDuration,

    /// Storage failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Owns the maintenance windows and their expiry timers.
///
/// The persisted `expires_at` is authoritative: decisions are computed from
/// it, and the timers only clean up rows that have run out. Runs held by a
/// suppress window are requeued when the window is stopped or replaced.
pub struct MaintenanceController {
    repo: Arc<dyn StateRepository>,
    clock: Arc<dyn Clock>,
    queue: Arc<dyn EscalationQueue>,
    timers: DashMap<i64, JoinHandle<()>>,
}

impl MaintenanceController {
    /// Creates a new `MaintenanceController`.
    pub fn new(repo: Arc<dyn StateRepository>, clock: Arc<dyn Clock>, queue: Arc<dyn EscalationQueue>) -> Self {
        Self { repo, clock, queue, timers: DashMap::new() }
    }

    /// The escalation decision for an integration right now.
    pub async fn is_allowed(&self, integration_id: i64) -> Result<MaintenanceDecision, MaintenanceError> {
        Ok(self.gate(integration_id).await?.0)
    }

    /// The decision together with the window behind it, from a single read.
    /// A `Suppressed` decision always comes with its window.
    pub async fn gate(
        &self,
        integration_id: i64,
    ) -> Result<(MaintenanceDecision, Option<MaintenanceWindow>), MaintenanceError> {
        let now = self.clock.now();
        let window = self.repo.get_maintenance_window(integration_id).await?.filter(|w| w.is_active(now));
        Ok((MaintenanceDecision::from_window(window.as_ref(), now), window))
    }

    /// The window in force for an integration, if any.
    pub async fn active_window(
        &self,
        integration_id: i64,
    ) -> Result<Option<MaintenanceWindow>, MaintenanceError> {
        Ok(self.gate(integration_id).await?.1)
    }

    /// Starts a window, replacing any window already in force.
    #[tracing::instrument(skip(self), level = "info")]
    pub async fn start(
        &self,
        integration_id: i64,
        mode: MaintenanceMode,
        duration: Duration,
    ) -> Result<MaintenanceWindow, MaintenanceError> {
        if duration.is_zero() {
            return Err(MaintenanceError::InvalidDuration);
        }
        match self.repo.get_integration(integration_id).await? {
            Some(integration) if !integration.is_deleted() => {}
            _ => return Err(MaintenanceError::UnknownIntegration(integration_id)),
        }

        let now = self.clock.now();
        let length = chrono::Duration::from_std(duration).map_err(|_| MaintenanceError::InvalidDuration)?;
        let expires_at = now.checked_add_signed(length).ok_or(MaintenanceError::InvalidDuration)?;
        let window = MaintenanceWindow { integration_id, mode, started_at: now, expires_at };
        self.repo.upsert_maintenance_window(&window).await?;
        self.arm(&window);
        tracing::info!(integration_id, %mode, %expires_at, "Maintenance started.");
        // Held runs re-evaluate against the new window.
        self.release_holds(integration_id).await?;
        Ok(window)
    }

    /// Ends a window early. Returns whether one was in force.
    #[tracing::instrument(skip(self), level = "info")]
    pub async fn stop(&self, integration_id: i64) -> Result<bool, MaintenanceError> {
        if let Some((_, timer)) = self.timers.remove(&integration_id) {
            timer.abort();
        }
        let now = self.clock.now();
        let was_active = self
            .repo
            .get_maintenance_window(integration_id)
            .await?
            .is_some_and(|window| window.is_active(now));
        self.repo.delete_maintenance_window(integration_id, None).await?;
        if was_active {
            tracing::info!(integration_id, "Maintenance stopped.");
        }
        self.release_holds(integration_id).await?;
        Ok(was_active)
    }

    async fn release_holds(&self, integration_id: i64) -> Result<(), MaintenanceError> {
        let released = self.repo.release_maintenance_holds(integration_id).await?;
        if !released.is_empty() {
            tracing::info!(integration_id, count = released.len(), "Requeueing escalations held by maintenance.");
        }
        for alert_group_id in released {
            self.queue.enqueue(alert_group_id).await;
        }
        Ok(())
    }

    /// Reloads persisted windows after a restart: expired rows are deleted,
    /// the others get their timers back.
    pub async fn restore(&self) -> Result<usize, MaintenanceError> {
        let now = self.clock.now();
        let mut restored = 0;
        for window in self.repo.list_maintenance_windows().await? {
            if window.is_active(now) {
                self.arm(&window);
                restored += 1;
            } else {
                self.repo
                    .delete_maintenance_window(window.integration_id, Some(window.expires_at))
                    .await?;
            }
        }
        tracing::info!(restored, "Maintenance windows restored.");
        Ok(restored)
    }

    /// Cancels every timer. Persisted windows are untouched.
    pub fn shutdown(&self) {
        for timer in self.timers.iter() {
            timer.abort();
        }
        self.timers.clear();
    }

    fn arm(&self, window: &MaintenanceWindow) {
        let repo = Arc::clone(&self.repo);
        let integration_id = window.integration_id;
        let expires_at = window.expires_at;
        let remaining = (expires_at - self.clock.now()).to_std().unwrap_or_default();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            // Only the row this timer was armed for; a replacement window
            // has a different expiry.
            match repo.delete_maintenance_window(integration_id, Some(expires_at)).await {
                Ok(true) => tracing::info!(integration_id, "Maintenance window expired."),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(integration_id, error = %e, "Failed to remove expired maintenance window.")
                }
            }
        });
        if let Some(previous) = self.timers.insert(integration_id, timer) {
            previous.abort();
        }
    }
}

impl Drop for MaintenanceController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{persistence::traits::AppRepository, test_helpers::TestHarness};

    async fn controller() -> (TestHarness, MaintenanceController, i64) {
        let harness = TestHarness::new().await;
        let integration = harness.create_integration("grafana").await;
        let controller = MaintenanceController::new(harness.repo.clone(), harness.clock.clone(), harness.queue.clone());
        (harness, controller, integration.id)
    }

    #[tokio::test]
    async fn test_decision_follows_persisted_expiry() {
        let (harness, controller, id) = controller().await;
        assert_eq!(controller.is_allowed(id).await.unwrap(), MaintenanceDecision::Allowed);

        controller.start(id, MaintenanceMode::Suppress, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(controller.is_allowed(id).await.unwrap(), MaintenanceDecision::Suppressed);

        // Expired but not yet swept: already allowed.
        harness.clock.advance(chrono::Duration::seconds(3600));
        assert_eq!(controller.is_allowed(id).await.unwrap(), MaintenanceDecision::Allowed);
        assert!(controller.active_window(id).await.unwrap().is_none());
        assert_eq!(controller.gate(id).await.unwrap(), (MaintenanceDecision::Allowed, None));
    }

    #[tokio::test]
    async fn test_start_replaces_the_active_window() {
        let (_harness, controller, id) = controller().await;
        controller.start(id, MaintenanceMode::Suppress, Duration::from_secs(3600)).await.unwrap();
        let replaced = controller.start(id, MaintenanceMode::Debug, Duration::from_secs(60)).await.unwrap();

        assert_eq!(controller.is_allowed(id).await.unwrap(), MaintenanceDecision::DebugOnly);
        assert_eq!(controller.active_window(id).await.unwrap(), Some(replaced));
        assert!(controller.stop(id).await.unwrap());
        assert!(!controller.stop(id).await.unwrap());
        assert_eq!(controller.is_allowed(id).await.unwrap(), MaintenanceDecision::Allowed);
    }

    #[tokio::test]
    async fn test_start_validates_input() {
        let (_harness, controller, id) = controller().await;
        assert!(matches!(
            controller.start(id, MaintenanceMode::Debug, Duration::ZERO).await,
            Err(MaintenanceError::InvalidDuration)
        ));
        assert!(matches!(
            controller.start(404, MaintenanceMode::Debug, Duration::from_secs(1)).await,
            Err(MaintenanceError::UnknownIntegration(404))
        ));
    }

    #[tokio::test]
    async fn test_restore_drops_expired_rows_and_keeps_live_ones() {
        let (harness, controller, id) = controller().await;
        let other = harness.create_integration("prometheus").await.id;
        controller.start(id, MaintenanceMode::Debug, Duration::from_secs(60)).await.unwrap();
        controller.start(other, MaintenanceMode::Suppress, Duration::from_secs(7200)).await.unwrap();
        controller.shutdown();

        harness.clock.advance(chrono::Duration::seconds(120));
        let restarted = MaintenanceController::new(harness.repo.clone(), harness.clock.clone(), harness.queue.clone());
        assert_eq!(restarted.restore().await.unwrap(), 1);

        let remaining = harness.repo.list_maintenance_windows().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].integration_id, other);
        assert_eq!(restarted.is_allowed(other).await.unwrap(), MaintenanceDecision::Suppressed);
    }

    #[tokio::test]
    async fn test_timer_removes_row_at_expiry() {
        let (harness, controller, id) = controller().await;
        controller.start(id, MaintenanceMode::Debug, Duration::from_millis(50)).await.unwrap();

        let mut removed = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if harness.repo.get_maintenance_window(id).await.unwrap().is_none() {
                removed = true;
                break;
            }
        }
        assert!(removed);
    }
}
