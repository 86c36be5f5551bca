//! Raw alerts as received from integrations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An alert. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    /// Row id.
    pub id: i64,

    /// Integration the alert arrived through.
    pub integration_id: i64,

    /// Group the alert was bound to.
    pub alert_group_id: i64,

    /// Raw payload.
    pub payload: Value,

    /// Receipt time.
    pub received_at: DateTime<Utc>,
}
