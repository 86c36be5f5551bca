//! The append-only audit trail of an alert group.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::maintenance::MaintenanceMode;

/// Who performed an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Actor {
    /// A human, by external user id.
    User(String),
    /// The alert source (auto-acknowledge/resolve, heartbeat ping).
    Source,
    /// Background machinery (silence expiry).
    System,
    /// A step of the escalation chain.
    Escalation,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{id}"),
            Actor::Source => f.write_str("source"),
            Actor::System => f.write_str("system"),
            Actor::Escalation => f.write_str("escalation"),
        }
    }
}

impl From<Actor> for String {
    fn from(actor: Actor) -> Self {
        actor.to_string()
    }
}

impl TryFrom<String> for Actor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "source" => Ok(Actor::Source),
            "system" => Ok(Actor::System),
            "escalation" => Ok(Actor::Escalation),
            other => match other.strip_prefix("user:") {
                Some(id) if !id.is_empty() => Ok(Actor::User(id.to_string())),
                _ => Err(format!("invalid actor '{other}'")),
            },
        }
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// The notifier accepted the notification.
    Sent,
    /// The notifier failed or timed out.
    Failed,
    /// Debug maintenance: would have been sent.
    Suppressed,
}

/// One call (or skipped call) of the notifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryAttempt {
    /// Recipient.
    pub user_id: String,
    /// Policy channel.
    pub channel: String,
    /// Outcome.
    pub status: AttemptStatus,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What executing a step produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Recipients were resolved and notified.
    Notified {
        /// One entry per recipient and policy channel.
        attempts: Vec<DeliveryAttempt>,
    },
    /// The recipient set was empty.
    NoRecipients,
    /// The schedule or team could not be resolved.
    RecipientLookupFailed {
        /// Resolver error.
        error: String,
    },
    /// Inside the time window; continued immediately.
    TimeWindowPassed,
    /// The chain parked until `until`.
    Parked {
        /// Wake-up deadline.
        until: DateTime<Utc>,
    },
    /// The webhook was handed to the dispatcher.
    WebhookDispatched {
        /// Webhook id.
        webhook_id: String,
    },
    /// The dispatcher refused the webhook.
    WebhookFailed {
        /// Webhook id.
        webhook_id: String,
        /// Dispatcher error.
        error: String,
    },
    /// Debug maintenance: the webhook would have been dispatched.
    WebhookSuppressed {
        /// Webhook id.
        webhook_id: String,
    },
    /// The group was resolved by the chain.
    Resolved,
    /// Debug maintenance: the group would have been resolved.
    ResolveSuppressed,
    /// The chain restarted from step 0.
    Repeated {
        /// Restarts so far, including this one.
        repeat_count: u32,
    },
    /// The repeat limit was reached; the step was a no-op.
    RepeatLimitReached,
}

/// Why a group never escalated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The matched route has no escalation chain.
    NoChain,
    /// The group was created under a suppress maintenance window.
    MaintenanceSuppressed,
}

/// A timeline event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEvent {
    /// The group was created.
    Registered {
        /// Maintenance mode active at creation.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maintenance: Option<MaintenanceMode>,
    },
    /// The first alert matched a routing rule.
    RouteAssigned {
        /// Matched rule.
        rule_id: i64,
        /// Chain bound to the group.
        escalation_chain_id: Option<i64>,
    },
    /// Another alert joined the group.
    AlertAppended {
        /// The new alert.
        alert_id: i64,
    },
    /// An escalation step was committed.
    StepCompleted {
        /// Index in the chain.
        step_index: usize,
        /// What happened.
        outcome: StepOutcome,
        /// Set when the walk ran under a debug window.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maintenance: Option<MaintenanceMode>,
    },
    /// The chain ran out of steps.
    EscalationFinished,
    /// Escalation never ran.
    EscalationSkipped {
        /// Why.
        reason: SkipReason,
        /// Maintenance mode at the time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maintenance: Option<MaintenanceMode>,
    },
    /// Firing -> Acknowledged.
    Acknowledged {
        /// Who.
        actor: Actor,
    },
    /// Acknowledged -> Firing.
    Unacknowledged {
        /// Who.
        actor: Actor,
    },
    /// -> Resolved.
    Resolved {
        /// Who.
        actor: Actor,
    },
    /// Resolved -> Firing.
    Unresolved {
        /// Who.
        actor: Actor,
    },
    /// Firing -> Silenced.
    Silenced {
        /// Who.
        actor: Actor,
        /// Silence deadline.
        until: DateTime<Utc>,
    },
    /// Silenced -> Firing.
    Unsilenced {
        /// Who.
        actor: Actor,
    },
    /// Attached to a root group.
    Attached {
        /// Who.
        actor: Actor,
        /// Root group.
        root_alert_group_id: i64,
    },
    /// Detached from its root group.
    Unattached {
        /// Who.
        actor: Actor,
        /// Former root group.
        root_alert_group_id: i64,
    },
}

/// A persisted timeline entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimelineEntry {
    /// Row id.
    pub id: i64,
    /// Owning group.
    pub alert_group_id: i64,
    /// Event.
    pub event: TimelineEvent,
    /// Time of the event.
    pub created_at: DateTime<Utc>,
}
