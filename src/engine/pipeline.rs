//! The inbound side of the engine: alert ingestion and direct paging.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::{
    EngineServices,
    grouping::{AlertGrouper, GroupingError},
    maintenance::{MaintenanceController, MaintenanceError},
};
use crate::{
    models::{
        EscalationChainConfig, EscalationStep, Integration, NotificationTier, RoutingRule,
        paging::{PagingRequest, Responder, ResponderType},
    },
    persistence::{error::PersistenceError, traits::GroupedAlert},
    routing::{RoutingError, RoutingTable},
};

/// Errors raised while accepting an alert or a page.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The integration does not exist or is deleted.
    #[error("Unknown integration: {0}")]
    UnknownIntegration(i64),

    /// The request is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Routing failed.
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Grouping failed.
    #[error("Grouping error: {0}")]
    Grouping(#[from] GroupingError),

    /// The maintenance lookup failed.
    #[error("Maintenance error: {0}")]
    Maintenance(#[from] MaintenanceError),

    /// Storage failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// The ingestion workers are gone.
    #[error("Ingestion is shutting down")]
    Unavailable,
}

/// What an accepted alert turned into.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestReceipt {
    /// The stored alert.
    pub alert_id: i64,
    /// The group it joined.
    pub alert_group_id: i64,
    /// Whether the group was created for it.
    pub created: bool,
    /// The routing rule it matched.
    pub rule_id: i64,
}

impl IngestReceipt {
    fn new(grouped: &GroupedAlert, rule: &RoutingRule) -> Self {
        Self {
            alert_id: grouped.alert.id,
            alert_group_id: grouped.alert_group.id,
            created: grouped.created,
            rule_id: rule.id,
        }
    }
}

/// Routes, groups and enqueues alerts.
pub struct AlertPipeline {
    services: EngineServices,
    routing: Arc<RoutingTable>,
    grouper: Arc<AlertGrouper>,
    maintenance: Arc<MaintenanceController>,
}

impl AlertPipeline {
    /// Creates a new `AlertPipeline`.
    pub fn new(
        services: EngineServices,
        routing: Arc<RoutingTable>,
        grouper: Arc<AlertGrouper>,
        maintenance: Arc<MaintenanceController>,
    ) -> Self {
        Self { services, routing, grouper, maintenance }
    }

    async fn active_integration(&self, integration_id: i64) -> Result<Integration, PipelineError> {
        match self.services.repo.get_integration(integration_id).await? {
            Some(integration) if !integration.is_deleted() => Ok(integration),
            _ => Err(PipelineError::UnknownIntegration(integration_id)),
        }
    }

    /// Accepts one alert from an integration.
    #[tracing::instrument(skip(self, payload), level = "debug")]
    pub async fn ingest(&self, integration_id: i64, payload: Value) -> Result<IngestReceipt, PipelineError> {
        let integration = self.active_integration(integration_id).await?;
        self.services.metrics.metrics.alert_ingested();

        let rule = self.routing.match_rule(integration_id, &payload)?;
        let decision = self.maintenance.is_allowed(integration_id).await?;
        let grouped = self.grouper.group(&integration, &rule, payload, decision).await?;

        let receipt = IngestReceipt::new(&grouped, &rule);
        tracing::info!(integration_id, alert_id = receipt.alert_id, alert_group_id = receipt.alert_group_id, rule_id = rule.id, "Alert ingested.");
        Ok(receipt)
    }

    /// Pages responders directly, bypassing the integration's routes.
    ///
    /// Builds a single-use chain with one `NotifyUsers` step per tier and one
    /// `NotifyTeam` step per team, then opens a new group bound to it.
    #[tracing::instrument(skip(self, request), fields(integration_id = request.integration_id), level = "debug")]
    pub async fn page(&self, request: PagingRequest) -> Result<IngestReceipt, PipelineError> {
        let responders = dedup(request.responders);
        if responders.is_empty() {
            return Err(PipelineError::InvalidRequest("at least one responder is required".into()));
        }
        if responders.iter().any(|r| r.id.trim().is_empty()) {
            return Err(PipelineError::InvalidRequest("responder ids must not be blank".into()));
        }
        let integration = self.active_integration(request.integration_id).await?;
        let rule = self
            .routing
            .rules(integration.id)
            .and_then(|rules| rules.iter().find(|r| r.is_default()).cloned())
            .ok_or(RoutingError::MissingDefaultRule(integration.id))?;

        let now = self.services.clock.now();
        let chain = EscalationChainConfig {
            name: format!("direct-page-{}", Uuid::new_v4()),
            steps: paging_steps(&responders),
        };
        let chain = self.services.repo.create_escalation_chain(&chain, true, now).await?;

        let payload = json!({
            "kind": "direct_page",
            "title": request.title,
            "message": request.message,
        });
        self.services.metrics.metrics.alert_ingested();
        let decision = self.maintenance.is_allowed(integration.id).await?;
        let grouped = self.grouper.group_new(&integration, &rule, chain.id, payload, decision).await?;

        tracing::info!(alert_group_id = grouped.alert_group.id, chain_id = chain.id, responders = responders.len(), "Direct page created.");
        Ok(IngestReceipt::new(&grouped, &rule))
    }
}

/// Drops repeated responders, keeping the first occurrence.
fn dedup(responders: Vec<Responder>) -> Vec<Responder> {
    let mut unique: Vec<Responder> = Vec::with_capacity(responders.len());
    for responder in responders {
        let seen = unique
            .iter()
            .any(|r| r.responder_type == responder.responder_type && r.id == responder.id);
        if !seen {
            unique.push(responder);
        }
    }
    unique
}

fn paging_steps(responders: &[Responder]) -> Vec<EscalationStep> {
    let mut steps = Vec::new();
    for tier in [NotificationTier::Important, NotificationTier::Default] {
        let user_ids: Vec<String> = responders
            .iter()
            .filter(|r| r.responder_type == ResponderType::User && r.tier == tier)
            .map(|r| r.id.clone())
            .collect();
        if !user_ids.is_empty() {
            steps.push(EscalationStep::NotifyUsers { user_ids, tier });
        }
    }
    steps.extend(
        responders
            .iter()
            .filter(|r| r.responder_type == ResponderType::Team)
            .map(|r| EscalationStep::NotifyTeam { team_id: r.id.clone(), tier: r.tier }),
    );
    steps
}

/// One queued alert with the channel its result goes back on.
#[derive(Debug)]
pub struct IngestRequest {
    /// Source integration.
    pub integration_id: i64,
    /// Raw payload.
    pub payload: Value,
    /// Where the worker sends the result.
    pub reply: oneshot::Sender<Result<IngestReceipt, PipelineError>>,
}

/// Submits alerts to the ingestion workers and waits for their result.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestRequest>,
}

impl IngestHandle {
    /// Creates the handle and the receiving end for the workers.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<IngestRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queues one alert and waits for the worker's answer.
    pub async fn ingest(&self, integration_id: i64, payload: Value) -> Result<IngestReceipt, PipelineError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(IngestRequest { integration_id, payload, reply })
            .await
            .map_err(|_| PipelineError::Unavailable)?;
        response.await.map_err(|_| PipelineError::Unavailable)?
    }
}
