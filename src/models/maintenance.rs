//! Maintenance windows gate escalation per integration.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an active window affects escalation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceMode {
    /// Escalation runs but nothing is delivered.
    Debug,
    /// Escalation does not run.
    Suppress,
}

impl MaintenanceMode {
    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceMode::Debug => "debug",
            MaintenanceMode::Suppress => "suppress",
        }
    }
}

impl fmt::Display for MaintenanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaintenanceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(MaintenanceMode::Debug),
            "suppress" => Ok(MaintenanceMode::Suppress),
            other => Err(format!("unknown maintenance mode '{other}'")),
        }
    }
}

/// The single active window of an integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceWindow {
    /// Integration under maintenance.
    pub integration_id: i64,
    /// Mode.
    pub mode: MaintenanceMode,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub expires_at: DateTime<Utc>,
}

impl MaintenanceWindow {
    /// Whether the window still applies at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// The gate decision for one integration at one instant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceDecision {
    /// No active window.
    Allowed,
    /// Debug window: walk the chain, suppress deliveries.
    DebugOnly,
    /// Suppress window: do not escalate.
    Suppressed,
}

impl MaintenanceDecision {
    /// Derives the decision from the persisted window, ignoring expired rows.
    pub fn from_window(window: Option<&MaintenanceWindow>, now: DateTime<Utc>) -> Self {
        match window {
            Some(w) if w.is_active(now) => match w.mode {
                MaintenanceMode::Debug => MaintenanceDecision::DebugOnly,
                MaintenanceMode::Suppress => MaintenanceDecision::Suppressed,
            },
            _ => MaintenanceDecision::Allowed,
        }
    }

    /// The mode in force, if any.
    pub fn mode(&self) -> Option<MaintenanceMode> {
        match self {
            MaintenanceDecision::Allowed => None,
            MaintenanceDecision::DebugOnly => Some(MaintenanceMode::Debug),
            MaintenanceDecision::Suppressed => Some(MaintenanceMode::Suppress),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    #[test]
    fn test_expired_window_is_allowed() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let window = MaintenanceWindow {
            integration_id: 1,
            mode: MaintenanceMode::Suppress,
            started_at: start,
            expires_at: start + Duration::hours(1),
        };
        assert_eq!(
            MaintenanceDecision::from_window(Some(&window), start + Duration::minutes(30)),
            MaintenanceDecision::Suppressed
        );
        assert_eq!(
            MaintenanceDecision::from_window(Some(&window), start + Duration::hours(1)),
            MaintenanceDecision::Allowed
        );
        assert_eq!(MaintenanceDecision::from_window(None, start), MaintenanceDecision::Allowed);
    }
}
