//! Alert groups and their status transition table.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an alert group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertGroupStatus {
    /// Escalating.
    Firing,
    /// Someone is on it; escalation is paused.
    Acknowledged,
    /// Muted until `silenced_until`.
    Silenced,
    /// Closed.
    Resolved,
}

impl AlertGroupStatus {
    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertGroupStatus::Firing => "firing",
            AlertGroupStatus::Acknowledged => "acknowledged",
            AlertGroupStatus::Silenced => "silenced",
            AlertGroupStatus::Resolved => "resolved",
        }
    }

    /// Looks up the transition for `action` from this status. `None` means the
    /// action does not apply and must be treated as an idempotent no-op.
    pub fn transition(self, action: &GroupAction) -> Option<Transition> {
        use AlertGroupStatus::*;
        use EscalationEffect::*;

        let (to, effect) = match (self, action) {
            (Firing, GroupAction::Acknowledge) => (Acknowledged, Cancel),
            (Firing | Acknowledged, GroupAction::Resolve) => (Resolved, Cancel),
            (Firing, GroupAction::Silence { .. }) => (Silenced, Cancel),
            (Silenced, GroupAction::Unsilence) => (Firing, Resume),
            (Resolved, GroupAction::Unresolve) => (Firing, Restart),
            (Acknowledged, GroupAction::Unacknowledge) => (Firing, Resume),
            _ => return None,
        };
        Some(Transition { from: self, to, effect })
    }
}

impl fmt::Display for AlertGroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertGroupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "firing" => Ok(AlertGroupStatus::Firing),
            "acknowledged" => Ok(AlertGroupStatus::Acknowledged),
            "silenced" => Ok(AlertGroupStatus::Silenced),
            "resolved" => Ok(AlertGroupStatus::Resolved),
            other => Err(format!("unknown alert group status '{other}'")),
        }
    }
}

/// A status-changing action on an alert group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    /// Firing -> Acknowledged.
    Acknowledge,
    /// Acknowledged -> Firing.
    Unacknowledge,
    /// Firing/Acknowledged -> Resolved.
    Resolve,
    /// Resolved -> Firing.
    Unresolve,
    /// Firing -> Silenced for `duration`.
    Silence {
        /// How long the group stays silenced.
        duration: Duration,
    },
    /// Silenced -> Firing.
    Unsilence,
}

/// What a transition does to the group's escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationEffect {
    /// Pending steps are cancelled.
    Cancel,
    /// Escalation continues after the last completed step.
    Resume,
    /// Escalation starts over from step 0.
    Restart,
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Expected current status.
    pub from: AlertGroupStatus,
    /// Resulting status.
    pub to: AlertGroupStatus,
    /// Escalation side effect.
    pub effect: EscalationEffect,
}

/// A group of alerts sharing an integration and grouping key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertGroup {
    /// Row id.
    pub id: i64,
    /// Owning integration.
    pub integration_id: i64,
    /// Routing rule matched by the first alert.
    pub matched_rule_id: Option<i64>,
    /// Chain bound at creation.
    pub escalation_chain_id: Option<i64>,
    /// Grouping key.
    pub grouping_key: String,
    /// Current status.
    pub status: AlertGroupStatus,
    /// String labels copied from the first alert.
    pub labels: BTreeMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last acknowledgement.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Resolution time.
    pub resolved_at: Option<DateTime<Utc>>,
    /// End of the current silence.
    pub silenced_until: Option<DateTime<Utc>>,
    /// Root group this one is attached to.
    pub root_alert_group_id: Option<i64>,
}

/// Field changes written together with a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// New status.
    pub status: AlertGroupStatus,
    /// New acknowledgement time.
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// New resolution time.
    pub resolved_at: Option<DateTime<Utc>>,
    /// New silence deadline.
    pub silenced_until: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    /// Computes the fields a transition leaves on `group` at `now`.
    pub fn for_action(group: &AlertGroup, action: &GroupAction, to: AlertGroupStatus, now: DateTime<Utc>) -> Self {
        let mut update = StatusUpdate {
            status: to,
            acknowledged_at: group.acknowledged_at,
            resolved_at: group.resolved_at,
            silenced_until: group.silenced_until,
        };
        match action {
            GroupAction::Acknowledge => update.acknowledged_at = Some(now),
            GroupAction::Unacknowledge => update.acknowledged_at = None,
            GroupAction::Resolve => {
                update.resolved_at = Some(now);
                update.silenced_until = None;
            }
            GroupAction::Unresolve => {
                update.resolved_at = None;
                update.acknowledged_at = None;
            }
            GroupAction::Silence { duration } => {
                let duration = chrono::Duration::from_std(*duration).unwrap_or(chrono::Duration::MAX);
                update.silenced_until = Some(now.checked_add_signed(duration).unwrap_or(DateTime::<Utc>::MAX_UTC));
            }
            GroupAction::Unsilence => update.silenced_until = None,
        }
        update
    }
}

/// Query filter for listing alert groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertGroupFilter {
    /// Only groups in this status.
    pub status: Option<AlertGroupStatus>,
    /// Only groups of this integration.
    pub integration_id: Option<i64>,
    /// Only groups carrying this label.
    pub label: Option<(String, String)>,
    /// Maximum number of groups, newest first.
    pub limit: u32,
}
