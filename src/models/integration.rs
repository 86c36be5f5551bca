//! Integrations: the monitored sources alerts arrive from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    loader::{Loadable, LoaderError},
    models::routing_rule::RouteFilter,
};

/// A monitored source. Alerts always arrive through exactly one integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Integration {
    /// Row id.
    pub id: i64,

    /// Unique name among active integrations.
    pub name: String,

    /// Template rendered against `{ payload }` to compute the grouping key.
    pub grouping_template: Option<String>,

    /// Predicate that acknowledges the group "by source" when truthy.
    pub acknowledge_condition: Option<String>,

    /// Predicate that resolves the group "by source" when truthy.
    pub resolve_condition: Option<String>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Soft-deletion time. Deleted integrations keep their history but reject
    /// new alerts.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Integration {
    /// Whether the integration has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Input for creating or updating an integration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewIntegration {
    /// Unique name.
    pub name: String,

    /// Grouping template.
    #[serde(default)]
    pub grouping_template: Option<String>,

    /// Auto-acknowledge predicate.
    #[serde(default)]
    pub acknowledge_condition: Option<String>,

    /// Auto-resolve predicate.
    #[serde(default)]
    pub resolve_condition: Option<String>,
}

/// A non-default route as declared in `integrations.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteConfig {
    /// Predicate that selects the route.
    pub filter: RouteFilter,

    /// Name of the escalation chain to run.
    #[serde(default)]
    pub escalation_chain: Option<String>,

    /// Opaque chat destinations forwarded with notifications.
    #[serde(default)]
    pub chat_destinations: Vec<String>,
}

/// Settings of the catch-all route every integration owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DefaultRouteConfig {
    /// Name of the escalation chain to run.
    #[serde(default)]
    pub escalation_chain: Option<String>,

    /// Opaque chat destinations forwarded with notifications.
    #[serde(default)]
    pub chat_destinations: Vec<String>,
}

/// Heartbeat settings of a configured integration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Maximum silence, in seconds, before a synthetic alert is raised.
    pub interval_secs: u64,
}

/// An integration as declared in `integrations.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrationConfig {
    /// Unique name.
    pub name: String,

    /// Grouping template.
    #[serde(default)]
    pub grouping_template: Option<String>,

    /// Auto-acknowledge predicate.
    #[serde(default)]
    pub acknowledge_condition: Option<String>,

    /// Auto-resolve predicate.
    #[serde(default)]
    pub resolve_condition: Option<String>,

    /// Ordered non-default routes. The default route is always appended.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Settings of the default route.
    #[serde(default)]
    pub default_route: DefaultRouteConfig,

    /// Optional heartbeat.
    #[serde(default)]
    pub heartbeat: Option<HeartbeatSettings>,
}

impl IntegrationConfig {
    /// Splits the declaration into the fields stored on the integration row.
    pub fn to_new_integration(&self) -> NewIntegration {
        NewIntegration {
            name: self.name.clone(),
            grouping_template: self.grouping_template.clone(),
            acknowledge_condition: self.acknowledge_condition.clone(),
            resolve_condition: self.resolve_condition.clone(),
        }
    }
}

/// Errors raised while validating integration declarations.
#[derive(Debug, Error)]
pub enum IntegrationConfigError {
    /// The file could not be loaded.
    #[error("Failed to load integrations: {0}")]
    Loader(#[from] LoaderError),

    /// The name is empty.
    #[error("Integration name must not be empty")]
    EmptyName,

    /// A non-default route tried to use the catch-all filter.
    #[error("Integration '{0}': only the default route may match everything")]
    ExplicitMatchAll(String),

    /// A heartbeat interval of zero.
    #[error("Integration '{0}': heartbeat interval must be positive")]
    InvalidHeartbeat(String),
}

impl Loadable for IntegrationConfig {
    type Error = IntegrationConfigError;

    const KEY: &'static str = "integrations";

    fn validate(&mut self) -> Result<(), Self::Error> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(IntegrationConfigError::EmptyName);
        }
        if self.routes.iter().any(|r| r.filter.is_match_all()) {
            return Err(IntegrationConfigError::ExplicitMatchAll(self.name.clone()));
        }
        if matches!(self.heartbeat, Some(HeartbeatSettings { interval_secs: 0 })) {
            return Err(IntegrationConfigError::InvalidHeartbeat(self.name.clone()));
        }
        Ok(())
    }
}
