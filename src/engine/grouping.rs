//! Binds incoming alerts to alert groups.

use std::{collections::BTreeMap, sync::Arc};

use chrono::Duration;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::{EngineServices, actions::AlertGroupService};
use crate::{
    config::GroupingConfig,
    models::{
        Actor, GroupAction, Integration, MaintenanceDecision, MaintenanceMode, RoutingRule,
        TimelineEvent, timeline::SkipReason,
    },
    persistence::{
        error::PersistenceError,
        traits::{GroupedAlert, GroupingRequest},
    },
    routing::PredicateEvaluator,
};

/// Errors raised while grouping an alert.
#[derive(Debug, Error)]
pub enum GroupingError {
    /// The database stayed busy through every retry.
    #[error("Grouping key '{0}' stayed contended after retries")]
    Contended(String),

    /// Storage failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Renders grouping keys, binds alerts to groups and applies the
/// integration's auto-acknowledge and auto-resolve conditions.
pub struct AlertGrouper {
    services: EngineServices,
    evaluator: Arc<PredicateEvaluator>,
    actions: Arc<AlertGroupService>,
    config: GroupingConfig,
}

/// Labels stored on a new group: the string-valued entries of the payload's
/// `labels` object.
fn extract_labels(payload: &Value) -> BTreeMap<String, String> {
    payload
        .get("labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .map(|(k, v)| {
                    let value = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

impl AlertGrouper {
    /// Creates a new `AlertGrouper`.
    pub fn new(
        services: EngineServices,
        evaluator: Arc<PredicateEvaluator>,
        actions: Arc<AlertGroupService>,
        config: GroupingConfig,
    ) -> Self {
        Self { services, evaluator, actions, config }
    }

    /// The grouping key for `payload`. Without a template, or when the
    /// template fails or renders blank, the alert gets a key of its own.
    pub fn grouping_key(&self, integration: &Integration, payload: &Value) -> String {
        let rendered = integration.grouping_template.as_deref().and_then(|template| {
            match self.evaluator.render(template, payload) {
                Ok(key) => Some(key.trim().to_string()).filter(|key| !key.is_empty()),
                Err(e) => {
                    self.services.metrics.metrics.predicate_evaluation_error();
                    tracing::warn!(integration_id = integration.id, error = %e, "Grouping template failed to render.");
                    None
                }
            }
        });
        rendered.unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Groups an alert routed by `rule`.
    pub async fn group(
        &self,
        integration: &Integration,
        rule: &RoutingRule,
        payload: Value,
        maintenance: MaintenanceDecision,
    ) -> Result<GroupedAlert, GroupingError> {
        let grouping_key = self.grouping_key(integration, &payload);
        let request = self.request(integration, rule, rule.escalation_chain_id, grouping_key, payload, maintenance, false);
        self.bind(integration, request, maintenance).await
    }

    /// Always creates a new group bound to `escalation_chain_id`, closed for
    /// grouping. Used for direct paging.
    pub async fn group_new(
        &self,
        integration: &Integration,
        rule: &RoutingRule,
        escalation_chain_id: i64,
        payload: Value,
        maintenance: MaintenanceDecision,
    ) -> Result<GroupedAlert, GroupingError> {
        let grouping_key = Uuid::new_v4().to_string();
        let request = self.request(integration, rule, Some(escalation_chain_id), grouping_key, payload, maintenance, true);
        self.bind(integration, request, maintenance).await
    }

    #[allow(clippy::too_many_arguments)]
    fn request(
        &self,
        integration: &Integration,
        rule: &RoutingRule,
        escalation_chain_id: Option<i64>,
        grouping_key: String,
        payload: Value,
        maintenance: MaintenanceDecision,
        force_new: bool,
    ) -> GroupingRequest {
        let received_at = self.services.clock.now();
        let lookback = Duration::from_std(self.config.lookback_secs).unwrap_or(Duration::MAX);
        GroupingRequest {
            integration_id: integration.id,
            grouping_key,
            matched_rule_id: Some(rule.id),
            escalation_chain_id,
            labels: extract_labels(&payload),
            payload,
            received_at,
            open_since: received_at.checked_sub_signed(lookback).unwrap_or_default(),
            force_new,
            maintenance: maintenance.mode(),
        }
    }

    /// Exponential delay before retry `attempt`, jittered by ±50%.
    fn backoff(&self, attempt: u32) -> std::time::Duration {
        let base = self.config.retry_backoff_ms.saturating_mul(1 << attempt.min(10));
        base.mul_f64(rand::random::<f64>() + 0.5)
    }

    #[tracing::instrument(skip_all, fields(integration_id = integration.id, grouping_key = %request.grouping_key), level = "debug")]
    async fn bind(
        &self,
        integration: &Integration,
        request: GroupingRequest,
        maintenance: MaintenanceDecision,
    ) -> Result<GroupedAlert, GroupingError> {
        let mut attempt = 0;
        let grouped = loop {
            match self.services.repo.group_alert(&request).await {
                Ok(grouped) => break grouped,
                Err(PersistenceError::Conflict(reason)) if attempt < self.config.max_retries => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    tracing::debug!(attempt, ?delay, %reason, "Grouping hit a busy database; retrying.");
                    tokio::time::sleep(delay).await;
                }
                Err(PersistenceError::Conflict(_)) => {
                    return Err(GroupingError::Contended(request.grouping_key.clone()));
                }
                Err(e) => return Err(e.into()),
            }
        };

        let alert_group_id = grouped.alert_group.id;
        if grouped.created {
            self.services.metrics.metrics.alert_group_created();
            tracing::info!(alert_group_id, "Alert group created.");
        }

        self.apply_source_conditions(integration, alert_group_id, &request.payload).await;

        if maintenance == MaintenanceDecision::Suppressed {
            if grouped.created {
                let event = TimelineEvent::EscalationSkipped {
                    reason: SkipReason::MaintenanceSuppressed,
                    maintenance: Some(MaintenanceMode::Suppress),
                };
                self.services
                    .repo
                    .finish_escalation(alert_group_id, None, &event, request.received_at)
                    .await?;
            }
            tracing::debug!(alert_group_id, "Integration under suppress maintenance; escalation not requested.");
        } else {
            self.services.queue.enqueue(alert_group_id).await;
        }

        Ok(grouped)
    }

    /// Acknowledges or resolves the group "by source" when the integration's
    /// conditions hold for this alert.
    async fn apply_source_conditions(&self, integration: &Integration, alert_group_id: i64, payload: &Value) {
        let conditions = [
            (integration.acknowledge_condition.as_deref(), GroupAction::Acknowledge),
            (integration.resolve_condition.as_deref(), GroupAction::Resolve),
        ];
        for (condition, action) in conditions {
            let Some(condition) = condition else { continue };
            let holds = match self.evaluator.evaluate_expression(condition, payload) {
                Ok(holds) => holds,
                Err(e) => {
                    self.services.metrics.metrics.predicate_evaluation_error();
                    tracing::warn!(integration_id = integration.id, ?action, error = %e, "Source condition failed to evaluate.");
                    false
                }
            };
            if holds {
                if let Err(e) = self.actions.apply(alert_group_id, action, Actor::Source).await {
                    tracing::warn!(alert_group_id, ?action, error = %e, "Failed to apply source action.");
                }
            }
        }
    }
}
