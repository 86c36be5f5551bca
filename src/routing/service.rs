//! Validated rule management on top of the repository and the routing table.

use std::sync::Arc;

use crate::{
    models::{NewRoutingRule, RouteFilter, RoutingRule},
    persistence::{error::PersistenceError, traits::StateRepository},
    routing::{PredicateEvaluator, RoutingError, RoutingTable},
};

/// Creates, edits, deletes and reorders routing rules.
///
/// Every change is validated before it is written and the integration's
/// snapshot is reloaded after the commit.
pub struct RouteService {
    repo: Arc<dyn StateRepository>,
    table: Arc<RoutingTable>,
    evaluator: Arc<PredicateEvaluator>,
}

fn map_write_error(e: PersistenceError) -> RoutingError {
    match e {
        PersistenceError::InvalidInput(msg) => RoutingError::InvalidChange(msg),
        PersistenceError::Conflict(msg) => RoutingError::PositionDrift(msg),
        other => RoutingError::Persistence(other),
    }
}

impl RouteService {
    /// Creates a new `RouteService`.
    pub fn new(
        repo: Arc<dyn StateRepository>,
        table: Arc<RoutingTable>,
        evaluator: Arc<PredicateEvaluator>,
    ) -> Self {
        Self { repo, table, evaluator }
    }

    /// The routing table this service maintains.
    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    /// Loads every active integration's rules into the table.
    #[tracing::instrument(skip(self), level = "info")]
    pub async fn load_all(&self) -> Result<(), RoutingError> {
        let rules = self.repo.list_all_routing_rules().await?;
        self.table.replace_all(rules);
        Ok(())
    }

    /// Reloads one integration's rules.
    pub async fn reload_integration(&self, integration_id: i64) -> Result<(), RoutingError> {
        let rules = self.repo.list_routing_rules(integration_id).await?;
        if rules.is_empty() {
            self.table.remove_integration(integration_id);
        } else {
            self.table.replace_integration(integration_id, rules);
        }
        Ok(())
    }

    /// Validates a rule body. Only the default rule may match everything.
    pub async fn validate(
        &self,
        rule: &NewRoutingRule,
        is_default: bool,
    ) -> Result<(), RoutingError> {
        match (&rule.filter, is_default) {
            (RouteFilter::MatchAll, false) => {
                return Err(RoutingError::InvalidChange(
                    "only the default rule may match everything".into(),
                ));
            }
            (filter, true) if !filter.is_match_all() => {
                return Err(RoutingError::InvalidChange(
                    "the default rule's filter cannot be changed".into(),
                ));
            }
            (filter, _) => self.evaluator.validate_filter(filter)?,
        }
        self.validate_chain(rule.escalation_chain_id).await
    }

    /// Checks that a chain reference resolves.
    pub async fn validate_chain(&self, chain_id: Option<i64>) -> Result<(), RoutingError> {
        if let Some(chain_id) = chain_id
            && self.repo.get_escalation_chain(chain_id).await?.is_none()
        {
            return Err(RoutingError::UnknownChain(chain_id));
        }
        Ok(())
    }

    async fn ensure_active_integration(&self, integration_id: i64) -> Result<(), RoutingError> {
        match self.repo.get_integration(integration_id).await? {
            Some(integration) if !integration.is_deleted() => Ok(()),
            _ => Err(RoutingError::UnknownIntegration(integration_id)),
        }
    }

    async fn existing_rule(&self, rule_id: i64) -> Result<RoutingRule, RoutingError> {
        self.repo.get_routing_rule(rule_id).await?.ok_or(RoutingError::RuleNotFound(rule_id))
    }

    /// Inserts a rule before the default rule.
    #[tracing::instrument(skip(self, rule), level = "debug")]
    pub async fn create_rule(
        &self,
        integration_id: i64,
        rule: NewRoutingRule,
        position: Option<u32>,
    ) -> Result<RoutingRule, RoutingError> {
        self.ensure_active_integration(integration_id).await?;
        self.validate(&rule, false).await?;
        let created = self
            .repo
            .insert_routing_rule(integration_id, &rule, position)
            .await
            .map_err(map_write_error)?;
        self.reload_integration(integration_id).await?;
        Ok(created)
    }

    /// Replaces a rule's filter, chain and destinations.
    #[tracing::instrument(skip(self, rule), level = "debug")]
    pub async fn update_rule(
        &self,
        rule_id: i64,
        rule: NewRoutingRule,
    ) -> Result<RoutingRule, RoutingError> {
        let existing = self.existing_rule(rule_id).await?;
        self.validate(&rule, existing.is_default()).await?;
        let updated = self.repo.update_routing_rule(rule_id, &rule).await.map_err(map_write_error)?;
        self.reload_integration(existing.integration_id).await?;
        Ok(updated)
    }

    /// Deletes a non-default rule.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn delete_rule(&self, rule_id: i64) -> Result<RoutingRule, RoutingError> {
        let deleted = self.repo.delete_routing_rule(rule_id).await.map_err(|e| match e {
            PersistenceError::NotFound(_) => RoutingError::RuleNotFound(rule_id),
            other => map_write_error(other),
        })?;
        self.reload_integration(deleted.integration_id).await?;
        Ok(deleted)
    }

    /// Moves a rule from `from` to `to`. `expected_rule_at_to` is the rule
    /// the caller saw at `to`; the move is refused if either position has
    /// changed since.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn move_rule(
        &self,
        rule_id: i64,
        from: u32,
        to: u32,
        expected_rule_at_to: Option<i64>,
    ) -> Result<RoutingRule, RoutingError> {
        let moved = self
            .repo
            .move_routing_rule(rule_id, from, to, expected_rule_at_to)
            .await
            .map_err(|e| match e {
                PersistenceError::NotFound(_) => RoutingError::RuleNotFound(rule_id),
                other => map_write_error(other),
            })?;
        self.reload_integration(moved.integration_id).await?;
        Ok(moved)
    }
}
