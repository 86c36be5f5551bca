//! The alert group state machine as a service: user, source, system and
//! escalation actions all go through [`AlertGroupService::apply`].

use serde::Serialize;
use thiserror::Error;

use super::EngineServices;
use crate::{
    models::{
        Actor, AlertGroup, GroupAction, TimelineEvent,
        alert_group::{EscalationEffect, StatusUpdate},
    },
    persistence::error::PersistenceError,
};

/// Errors raised by alert group actions.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The alert group does not exist.
    #[error("Alert group not found: {0}")]
    NotFound(i64),

    /// Storage failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// The state of a group after an action.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActionResult {
    /// The group as stored after the action.
    pub alert_group: AlertGroup,
    /// False when the action did not apply in the current state.
    pub changed: bool,
}

/// Outcome of one id in a bulk action.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BulkItemResult {
    /// The action was evaluated.
    Applied {
        /// Whether the status changed.
        changed: bool,
    },
    /// No such group.
    NotFound,
    /// The action failed.
    Failed {
        /// Error message.
        error: String,
    },
}

/// Per-id result of [`AlertGroupService::bulk`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BulkItem {
    /// Target group.
    pub alert_group_id: i64,
    /// What happened to it.
    #[serde(flatten)]
    pub result: BulkItemResult,
}

fn event_for(action: &GroupAction, actor: Actor, update: &StatusUpdate) -> TimelineEvent {
    match action {
        GroupAction::Acknowledge => TimelineEvent::Acknowledged { actor },
        GroupAction::Unacknowledge => TimelineEvent::Unacknowledged { actor },
        GroupAction::Resolve => TimelineEvent::Resolved { actor },
        GroupAction::Unresolve => TimelineEvent::Unresolved { actor },
        GroupAction::Silence { .. } => TimelineEvent::Silenced {
            actor,
            until: update.silenced_until.unwrap_or_default(),
        },
        GroupAction::Unsilence => TimelineEvent::Unsilenced { actor },
    }
}

/// Applies state machine actions and attachment changes.
#[derive(Debug, Clone)]
pub struct AlertGroupService {
    services: EngineServices,
}

impl AlertGroupService {
    /// Creates a new `AlertGroupService`.
    pub fn new(services: EngineServices) -> Self {
        Self { services }
    }

    async fn load(&self, alert_group_id: i64) -> Result<AlertGroup, ActionError> {
        self.services
            .repo
            .get_alert_group(alert_group_id)
            .await?
            .ok_or(ActionError::NotFound(alert_group_id))
    }

    /// Applies `action` to a group.
    ///
    /// Actions the transition table does not allow from the current status
    /// succeed with `changed = false`. So does an action that lost a race
    /// with a concurrent transition.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn apply(
        &self,
        alert_group_id: i64,
        action: GroupAction,
        actor: Actor,
    ) -> Result<ActionResult, ActionError> {
        let group = self.load(alert_group_id).await?;
        let Some(transition) = group.status.transition(&action) else {
            tracing::debug!(alert_group_id, status = %group.status, ?action, "Action does not apply; ignoring.");
            return Ok(ActionResult { alert_group: group, changed: false });
        };

        let now = self.services.clock.now();
        let update = StatusUpdate::for_action(&group, &action, transition.to, now);
        let event = event_for(&action, actor, &update);
        let changed = self
            .services
            .repo
            .apply_transition(alert_group_id, &transition, &update, &event, now)
            .await?;

        if changed {
            tracing::info!(alert_group_id, from = %transition.from, to = %transition.to, "Alert group status changed.");
            if matches!(transition.effect, EscalationEffect::Resume | EscalationEffect::Restart) {
                self.services.queue.enqueue(alert_group_id).await;
            }
        }

        let alert_group = self.load(alert_group_id).await?;
        Ok(ActionResult { alert_group, changed })
    }

    /// Attaches a group to a root group. Self-attachment, chained
    /// attachment and attaching a group that has dependents are no-ops.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn attach(
        &self,
        alert_group_id: i64,
        root_alert_group_id: i64,
        actor: Actor,
    ) -> Result<ActionResult, ActionError> {
        let group = self.load(alert_group_id).await?;
        self.load(root_alert_group_id).await?;
        if alert_group_id == root_alert_group_id {
            return Ok(ActionResult { alert_group: group, changed: false });
        }

        let event = TimelineEvent::Attached { actor, root_alert_group_id };
        let changed = self
            .services
            .repo
            .attach_alert_group(alert_group_id, root_alert_group_id, &event, self.services.clock.now())
            .await?;
        let alert_group = self.load(alert_group_id).await?;
        Ok(ActionResult { alert_group, changed })
    }

    /// Detaches a group from its root. The group escalates again on its own
    /// if it is still firing.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn unattach(
        &self,
        alert_group_id: i64,
        actor: Actor,
    ) -> Result<ActionResult, ActionError> {
        let group = self.load(alert_group_id).await?;
        let Some(root_alert_group_id) = group.root_alert_group_id else {
            return Ok(ActionResult { alert_group: group, changed: false });
        };

        let event = TimelineEvent::Unattached { actor, root_alert_group_id };
        let changed = self
            .services
            .repo
            .detach_alert_group(alert_group_id, root_alert_group_id, &event, self.services.clock.now())
            .await?;
        if changed {
            self.services.queue.enqueue(alert_group_id).await;
        }
        let alert_group = self.load(alert_group_id).await?;
        Ok(ActionResult { alert_group, changed })
    }

    /// Applies one action to many groups. Failures are reported per id.
    pub async fn bulk(&self, alert_group_ids: &[i64], action: GroupAction, actor: Actor) -> Vec<BulkItem> {
        let mut results = Vec::with_capacity(alert_group_ids.len());
        for &alert_group_id in alert_group_ids {
            let result = match self.apply(alert_group_id, action, actor.clone()).await {
                Ok(applied) => BulkItemResult::Applied { changed: applied.changed },
                Err(ActionError::NotFound(_)) => BulkItemResult::NotFound,
                Err(e) => {
                    tracing::warn!(alert_group_id, error = %e, "Bulk action failed for alert group.");
                    BulkItemResult::Failed { error: e.to_string() }
                }
            };
            results.push(BulkItem { alert_group_id, result });
        }
        results
    }
}
