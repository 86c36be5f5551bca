//! Escalation chains, their steps and the persisted run cursor.

use chrono::{DateTime, Days, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loader::{Loadable, LoaderError};

/// Upper bound on `RepeatEscalation` restarts per run of a chain.
pub const MAX_REPEAT_ESCALATIONS: u32 = 5;

/// Which of a user's two notification policies is used.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTier {
    /// The user's default policy.
    #[default]
    Default,
    /// The user's important policy.
    Important,
}

/// A daily time range in UTC. `from > to` wraps past midnight; `from == to`
/// covers the whole day.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UtcTimeRange {
    /// Inclusive start.
    pub from: NaiveTime,
    /// Exclusive end.
    pub to: NaiveTime,
}

impl UtcTimeRange {
    /// Creates a range from `HH:MM:SS` bounds.
    pub fn new(from: NaiveTime, to: NaiveTime) -> Self {
        Self { from, to }
    }

    /// Whether `at` falls inside the range.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let t = at.time().with_nanosecond(0).unwrap_or(at.time());
        if self.from == self.to {
            true
        } else if self.from < self.to {
            self.from <= t && t < self.to
        } else {
            t >= self.from || t < self.to
        }
    }

    /// The first instant strictly after `now` at which the range starts.
    pub fn next_start_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.from).and_utc();
        if today > now {
            today
        } else {
            today.checked_add_days(Days::new(1)).unwrap_or(DateTime::<Utc>::MAX_UTC)
        }
    }
}

/// One step of an escalation chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationStep {
    /// Notify a fixed set of users.
    NotifyUsers {
        /// Users to notify.
        user_ids: Vec<String>,
        /// Policy tier.
        #[serde(default)]
        tier: NotificationTier,
    },
    /// Notify whoever is on call for a schedule when the step runs.
    NotifyOnCallSchedule {
        /// Schedule to resolve.
        schedule_id: String,
        /// Policy tier.
        #[serde(default)]
        tier: NotificationTier,
    },
    /// Proceed only inside a daily UTC window; park until it opens otherwise.
    WaitForTimeWindow {
        /// The window.
        window: UtcTimeRange,
    },
    /// Fire-and-forget an outgoing webhook.
    TriggerWebhook {
        /// Webhook to call.
        webhook_id: String,
    },
    /// Notify every member of a team.
    NotifyTeam {
        /// Team to resolve.
        team_id: String,
        /// Policy tier.
        #[serde(default)]
        tier: NotificationTier,
    },
    /// Notify one user per execution, rotating through the list.
    NotifyUsersRoundRobin {
        /// Rotation members.
        user_ids: Vec<String>,
    },
    /// Park the chain for a fixed delay.
    Wait {
        /// Delay in seconds.
        delay_secs: u64,
    },
    /// Resolve the group and stop.
    Resolve,
    /// Start over from the first step, at most [`MAX_REPEAT_ESCALATIONS`] times.
    RepeatEscalation,
}

impl EscalationStep {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EscalationStep::NotifyUsers { .. } => "notify_users",
            EscalationStep::NotifyOnCallSchedule { .. } => "notify_on_call_schedule",
            EscalationStep::WaitForTimeWindow { .. } => "wait_for_time_window",
            EscalationStep::TriggerWebhook { .. } => "trigger_webhook",
            EscalationStep::NotifyTeam { .. } => "notify_team",
            EscalationStep::NotifyUsersRoundRobin { .. } => "notify_users_round_robin",
            EscalationStep::Wait { .. } => "wait",
            EscalationStep::Resolve => "resolve",
            EscalationStep::RepeatEscalation => "repeat_escalation",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            EscalationStep::NotifyUsers { user_ids, .. }
            | EscalationStep::NotifyUsersRoundRobin { user_ids } => {
                if user_ids.iter().any(|u| u.trim().is_empty()) {
                    return Err("user ids must not be blank".into());
                }
            }
            EscalationStep::NotifyOnCallSchedule { schedule_id: id, .. }
            | EscalationStep::TriggerWebhook { webhook_id: id }
            | EscalationStep::NotifyTeam { team_id: id, .. } => {
                if id.trim().is_empty() {
                    return Err(format!("{} requires a non-empty id", self.kind()));
                }
            }
            EscalationStep::Wait { delay_secs: 0 } => {
                return Err("wait delay must be positive".into());
            }
            _ => {}
        }
        Ok(())
    }
}

/// A persisted escalation chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscalationChain {
    /// Row id.
    pub id: i64,
    /// Unique name among non-ephemeral chains.
    pub name: String,
    /// Ordered steps.
    pub steps: Vec<EscalationStep>,
    /// Single-use chain built for direct paging.
    pub ephemeral: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: DateTime<Utc>,
}

/// An escalation chain as declared in `escalation_chains.yaml` or posted to
/// the API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscalationChainConfig {
    /// Unique name.
    pub name: String,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<EscalationStep>,
}

/// Errors raised while validating escalation chains.
#[derive(Debug, Error)]
pub enum EscalationChainConfigError {
    /// The file could not be loaded.
    #[error("Failed to load escalation chains: {0}")]
    Loader(#[from] LoaderError),

    /// The chain name is empty.
    #[error("Escalation chain name must not be empty")]
    EmptyName,

    /// A step is malformed.
    #[error("Escalation chain '{chain}', step {index}: {reason}")]
    InvalidStep {
        /// Chain name.
        chain: String,
        /// Step index.
        index: usize,
        /// What is wrong.
        reason: String,
    },
}

impl Loadable for EscalationChainConfig {
    type Error = EscalationChainConfigError;

    const KEY: &'static str = "escalation_chains";

    fn validate(&mut self) -> Result<(), Self::Error> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(EscalationChainConfigError::EmptyName);
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.validate().map_err(|reason| EscalationChainConfigError::InvalidStep {
                chain: self.name.clone(),
                index,
                reason,
            })?;
        }
        Ok(())
    }
}

/// The persisted escalation cursor and lease of one alert group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscalationState {
    /// Alert group.
    pub alert_group_id: i64,
    /// Index of the next step to execute.
    pub next_step: usize,
    /// Restarts performed by `RepeatEscalation`.
    pub repeat_count: u32,
    /// Parked until this instant.
    pub wake_at: Option<DateTime<Utc>>,
    /// The chain ran to completion or was skipped.
    pub finished: bool,
    /// Current lease holder.
    pub lease_owner: Option<String>,
    /// Lease expiry.
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// One channel of a user's notification policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyEntry {
    /// Opaque channel name (`sms`, `phone`, `push`, `chat`, ...).
    pub channel: String,
}

/// A user's two notification policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationPolicy {
    /// External user id.
    pub user_id: String,
    /// Policy used for default-tier steps.
    #[serde(default)]
    pub default: Vec<PolicyEntry>,
    /// Policy used for important-tier steps.
    #[serde(default)]
    pub important: Vec<PolicyEntry>,
}

impl NotificationPolicy {
    /// The entries for `tier`.
    pub fn entries(&self, tier: NotificationTier) -> &[PolicyEntry] {
        match tier {
            NotificationTier::Default => &self.default,
            NotificationTier::Important => &self.important,
        }
    }
}

impl Loadable for NotificationPolicy {
    type Error = LoaderError;

    const KEY: &'static str = "users";
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_time_range_same_day() {
        let range = UtcTimeRange::new(t(9, 0), t(17, 0));
        assert!(range.contains(at(9, 0)));
        assert!(range.contains(at(16, 59)));
        assert!(!range.contains(at(17, 0)));
        assert!(!range.contains(at(20, 0)));
    }

    #[test]
    fn test_time_range_wraps_midnight() {
        let range = UtcTimeRange::new(t(22, 0), t(6, 0));
        assert!(range.contains(at(23, 30)));
        assert!(range.contains(at(2, 0)));
        assert!(!range.contains(at(12, 0)));
    }

    #[test]
    fn test_time_range_equal_bounds_cover_whole_day() {
        let range = UtcTimeRange::new(t(8, 0), t(8, 0));
        assert!(range.contains(at(0, 0)));
        assert!(range.contains(at(23, 59)));
    }

    #[test]
    fn test_next_start_after_rolls_to_tomorrow() {
        let range = UtcTimeRange::new(t(9, 0), t(17, 0));
        assert_eq!(range.next_start_after(at(20, 0)), Utc.with_ymd_and_hms(2025, 3, 11, 9, 0, 0).unwrap());
        assert_eq!(range.next_start_after(at(7, 0)), at(9, 0));
    }

    #[test]
    fn test_step_serde_shape() {
        let json = r#"[
            {"type": "notify_users", "user_ids": ["alice"]},
            {"type": "wait_for_time_window", "window": {"from": "09:00:00", "to": "17:00:00"}},
            {"type": "notify_on_call_schedule", "schedule_id": "primary", "tier": "important"},
            {"type": "repeat_escalation"}
        ]"#;
        let steps: Vec<EscalationStep> = serde_json::from_str(json).unwrap();
        assert_eq!(steps.len(), 4);
        assert_eq!(
            steps[0],
            EscalationStep::NotifyUsers { user_ids: vec!["alice".into()], tier: NotificationTier::Default }
        );
        assert_eq!(
            steps[1],
            EscalationStep::WaitForTimeWindow { window: UtcTimeRange::new(t(9, 0), t(17, 0)) }
        );
        assert_eq!(steps[3], EscalationStep::RepeatEscalation);
    }

    #[test]
    fn test_validate_rejects_blank_schedule() {
        let mut chain = EscalationChainConfig {
            name: "primary".into(),
            steps: vec![EscalationStep::NotifyOnCallSchedule {
                schedule_id: " ".into(),
                tier: NotificationTier::Default,
            }],
        };
        assert!(matches!(
            chain.validate(),
            Err(EscalationChainConfigError::InvalidStep { index: 0, .. })
        ));
    }

    #[test]
    fn test_policy_entries_by_tier() {
        let policy = NotificationPolicy {
            user_id: "alice".into(),
            default: vec![PolicyEntry { channel: "push".into() }],
            important: vec![PolicyEntry { channel: "phone".into() }],
        };
        assert_eq!(policy.entries(NotificationTier::Important)[0].channel, "phone");
    }
}
