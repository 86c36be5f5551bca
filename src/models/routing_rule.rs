//! Routing rules select the escalation chain for an incoming alert.

use serde::{Deserialize, Serialize};

/// The predicate of a routing rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RouteFilter {
    /// Always matches. Reserved for the default rule.
    MatchAll,

    /// A boolean template expression evaluated against `{ payload }`.
    Template(String),

    /// A regular expression searched in the JSON-serialized payload.
    Regex(String),
}

impl RouteFilter {
    /// Whether this is the catch-all filter.
    pub fn is_match_all(&self) -> bool {
        matches!(self, RouteFilter::MatchAll)
    }
}

/// A persisted routing rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingRule {
    /// Row id.
    pub id: i64,

    /// Owning integration.
    pub integration_id: i64,

    /// Dense position, 0..n-1. The default rule is always last.
    pub position: u32,

    /// Predicate.
    pub filter: RouteFilter,

    /// Chain run for groups created through this rule.
    pub escalation_chain_id: Option<i64>,

    /// Opaque chat destinations.
    pub chat_destinations: Vec<String>,
}

impl RoutingRule {
    /// Whether this is the integration's catch-all rule.
    pub fn is_default(&self) -> bool {
        self.filter.is_match_all()
    }
}

/// Input for creating or updating a routing rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewRoutingRule {
    /// Predicate.
    pub filter: RouteFilter,

    /// Chain to run.
    #[serde(default)]
    pub escalation_chain_id: Option<i64>,

    /// Opaque chat destinations.
    #[serde(default)]
    pub chat_destinations: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_serde_shape() {
        let filter: RouteFilter =
            serde_json::from_str(r#"{"type":"template","value":"payload.severity == 'critical'"}"#)
                .unwrap();
        assert_eq!(filter, RouteFilter::Template("payload.severity == 'critical'".into()));

        let filter: RouteFilter = serde_json::from_str(r#"{"type":"match_all"}"#).unwrap();
        assert!(filter.is_match_all());
    }
}
