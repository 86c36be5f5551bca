//! Per-integration routing tables.
//!
//! Rules live in an immutable snapshot that is swapped wholesale on every
//! committed change, so matching never takes a lock.

pub mod predicate;
pub mod service;

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
pub use predicate::{PredicateError, PredicateEvaluator};
use serde_json::Value;
pub use service::RouteService;
use thiserror::Error;

use crate::{context::AppMetrics, models::RoutingRule, persistence::error::PersistenceError};

/// Errors raised by routing lookups and rule management.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// The integration has no routing table (unknown or deleted).
    #[error("Unknown integration: {0}")]
    UnknownIntegration(i64),

    /// The integration's table has no catch-all rule.
    #[error("Integration {0} has no default routing rule")]
    MissingDefaultRule(i64),

    /// The rule does not exist.
    #[error("Routing rule not found: {0}")]
    RuleNotFound(i64),

    /// The filter does not compile.
    #[error("Invalid routing filter: {0}")]
    InvalidPredicate(#[from] PredicateError),

    /// The referenced escalation chain does not exist.
    #[error("Unknown escalation chain: {0}")]
    UnknownChain(i64),

    /// The change would break the default rule invariant.
    #[error("Invalid routing change: {0}")]
    InvalidChange(String),

    /// The caller's view of rule positions is stale.
    #[error("Routing positions changed concurrently: {0}")]
    PositionDrift(String),

    /// Storage failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

type Snapshot = HashMap<i64, Arc<Vec<RoutingRule>>>;

/// Lock-free routing lookups over the committed rules.
pub struct RoutingTable {
    snapshot: ArcSwap<Snapshot>,
    evaluator: Arc<PredicateEvaluator>,
    metrics: AppMetrics,
}

impl RoutingTable {
    /// Creates an empty table.
    pub fn new(evaluator: Arc<PredicateEvaluator>, metrics: AppMetrics) -> Self {
        Self { snapshot: ArcSwap::from_pointee(HashMap::new()), evaluator, metrics }
    }

    /// Returns the first rule, by position, whose filter matches `payload`.
    ///
    /// A filter that fails to evaluate counts as a non-match. The default rule
    /// matches everything, so the only failure for a configured integration is
    /// a missing default.
    pub fn match_rule(
        &self,
        integration_id: i64,
        payload: &Value,
    ) -> Result<RoutingRule, RoutingError> {
        let snapshot = self.snapshot.load();
        let rules =
            snapshot.get(&integration_id).ok_or(RoutingError::UnknownIntegration(integration_id))?;

        for rule in rules.iter() {
            match self.evaluator.matches(&rule.filter, payload) {
                Ok(true) => {
                    tracing::debug!(integration_id, rule_id = rule.id, position = rule.position, "Routing rule matched.");
                    return Ok(rule.clone());
                }
                Ok(false) => {}
                Err(e) => {
                    self.metrics.metrics.predicate_evaluation_error();
                    tracing::warn!(integration_id, rule_id = rule.id, error = %e, "Routing filter failed to evaluate; skipping rule.");
                }
            }
        }
        Err(RoutingError::MissingDefaultRule(integration_id))
    }

    /// Returns the rules of one integration in position order.
    pub fn rules(&self, integration_id: i64) -> Option<Arc<Vec<RoutingRule>>> {
        self.snapshot.load().get(&integration_id).cloned()
    }

    /// Replaces every table.
    pub fn replace_all(&self, rules: Vec<RoutingRule>) {
        let mut grouped: HashMap<i64, Vec<RoutingRule>> = HashMap::new();
        for rule in rules {
            grouped.entry(rule.integration_id).or_default().push(rule);
        }
        let snapshot: Snapshot = grouped
            .into_iter()
            .map(|(integration_id, mut rules)| {
                rules.sort_by_key(|r| r.position);
                (integration_id, Arc::new(rules))
            })
            .collect();
        tracing::info!(integrations = snapshot.len(), "Routing tables loaded.");
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Replaces one integration's table.
    pub fn replace_integration(&self, integration_id: i64, mut rules: Vec<RoutingRule>) {
        rules.sort_by_key(|r| r.position);
        let rules = Arc::new(rules);
        self.snapshot.rcu(|current| {
            let mut next = Snapshot::clone(current);
            next.insert(integration_id, Arc::clone(&rules));
            next
        });
        tracing::debug!(integration_id, "Routing table reloaded.");
    }

    /// Drops one integration's table.
    pub fn remove_integration(&self, integration_id: i64) {
        self.snapshot.rcu(|current| {
            let mut next = Snapshot::clone(current);
            next.remove(&integration_id);
            next
        });
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable").field("integrations", &self.snapshot.load().len()).finish()
    }
}
