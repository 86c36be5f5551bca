//! Heartbeat configuration of an integration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness tracking for one integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Monitored integration.
    pub integration_id: i64,
    /// Maximum silence before a synthetic alert is raised.
    pub interval_seconds: u64,
    /// Last ping.
    pub last_seen_at: DateTime<Utc>,
    /// A missing-heartbeat episode is open.
    pub alerted: bool,
    /// Group raised for the open episode.
    pub alert_group_id: Option<i64>,
}

impl HeartbeatConfig {
    /// Whether the integration has been silent for longer than the interval.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let interval = i64::try_from(self.interval_seconds).unwrap_or(i64::MAX);
        (now - self.last_seen_at).num_seconds() > interval
    }
}
