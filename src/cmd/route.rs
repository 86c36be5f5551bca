//! `beacon route`: shows where an alert would go without touching the
//! configured database.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::GroupingConfig,
    context::{AppContextBuilder, AppContextError},
    engine::{EngineServices, actions::AlertGroupService, grouping::AlertGrouper, queue::ChannelQueue},
    models::RouteFilter,
    persistence::{error::PersistenceError, traits::AppRepository},
    routing::{RouteService, RoutingError, RoutingTable},
};

/// Errors raised by the `route` command.
#[derive(Error, Debug)]
pub enum Error {
    /// The payload file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload is not JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration or resource files are invalid.
    #[error("Context error: {0}")]
    Context(#[from] AppContextError),

    /// Routing failed.
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// The scratch database failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// No integration has this name.
    #[error("Unknown integration: {0}")]
    UnknownIntegration(String),
}

/// Arguments of the `route` command.
#[derive(Parser, Debug)]
pub struct RouteArgs {
    /// Name of the integration, as declared in `integrations.yaml`.
    #[arg(short, long)]
    integration: String,

    /// Path to a JSON payload. Reads stdin when omitted.
    #[arg(short, long)]
    payload: Option<PathBuf>,
}

/// What the engine would do with the payload.
#[derive(Debug, Serialize)]
pub struct RouteReport {
    /// Position of the matched rule.
    pub position: u32,
    /// Its filter.
    pub filter: RouteFilter,
    /// Whether the catch-all rule matched.
    pub is_default: bool,
    /// Name of the chain a new group would run.
    pub escalation_chain: Option<String>,
    /// Chat destinations of the rule.
    pub chat_destinations: Vec<String>,
    /// The computed grouping key.
    pub grouping_key: String,
}

/// Loads the resource files into a scratch in-memory database and routes
/// the payload through them.
pub async fn execute(config_dir: Option<String>, args: RouteArgs) -> Result<(), Error> {
    let raw = match &args.payload {
        Some(path) => std::fs::read_to_string(path)?,
        None => std::io::read_to_string(std::io::stdin())?,
    };
    let payload: Value = serde_json::from_str(&raw)?;

    let report = route(config_dir, &args.integration, &payload).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn route(config_dir: Option<String>, integration: &str, payload: &Value) -> Result<RouteReport, Error> {
    let context = AppContextBuilder::new(config_dir)
        .database_url("sqlite::memory:".to_string())
        .build()
        .await?;

    let integration = context
        .repo
        .get_active_integration_by_name(integration)
        .await?
        .ok_or_else(|| Error::UnknownIntegration(integration.to_string()))?;

    let table = Arc::new(RoutingTable::new(context.evaluator.clone(), context.metrics.clone()));
    let routes = RouteService::new(context.repo.clone(), table.clone(), context.evaluator.clone());
    routes.load_all().await?;
    let rule = table.match_rule(integration.id, payload)?;

    let escalation_chain = match rule.escalation_chain_id {
        Some(chain_id) => context.repo.get_escalation_chain(chain_id).await?.map(|c| c.name),
        None => None,
    };

    // Nothing is enqueued; the grouper is only asked for the key.
    let (queue, _rx) = ChannelQueue::new(1);
    let services = EngineServices {
        repo: context.repo.clone(),
        clock: context.clock.clone(),
        metrics: context.metrics.clone(),
        queue: Arc::new(queue),
    };
    let actions = Arc::new(AlertGroupService::new(services.clone()));
    let grouper = AlertGrouper::new(services, context.evaluator.clone(), actions, GroupingConfig::default());

    Ok(RouteReport {
        position: rule.position,
        is_default: rule.is_default(),
        filter: rule.filter,
        escalation_chain,
        chat_destinations: rule.chat_destinations,
        grouping_key: grouper.grouping_key(&integration, payload),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn write_configs(dir: &std::path::Path) {
        fs::write(dir.join("app.yaml"), "database_url: sqlite::memory:\n").unwrap();
        fs::write(
            dir.join("escalation_chains.yaml"),
            r#"
escalation_chains:
  - name: critical
    steps:
      - type: notify_users
        user_ids: [alice]
        tier: important
"#,
        )
        .unwrap();
        fs::write(
            dir.join("integrations.yaml"),
            r#"
integrations:
  - name: grafana
    grouping_template: "{{ payload.labels.alertname }}"
    routes:
      - filter:
          type: template
          value: "{{ payload.labels.severity == 'critical' }}"
        escalation_chain: critical
"#,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_route_reports_matched_rule_and_key() {
        let dir = tempdir().unwrap();
        write_configs(dir.path());
        let config_dir = Some(dir.path().to_string_lossy().into_owned());

        let payload = json!({ "labels": { "alertname": "DiskFull", "severity": "critical" } });
        let report = route(config_dir.clone(), "grafana", &payload).await.unwrap();
        assert_eq!(report.position, 0);
        assert!(!report.is_default);
        assert_eq!(report.escalation_chain.as_deref(), Some("critical"));
        assert_eq!(report.grouping_key, "DiskFull");

        let payload = json!({ "labels": { "alertname": "DiskFull", "severity": "info" } });
        let report = route(config_dir, "grafana", &payload).await.unwrap();
        assert!(report.is_default);
        assert_eq!(report.escalation_chain, None);
    }

    #[tokio::test]
    async fn test_route_rejects_unknown_integration() {
        let dir = tempdir().unwrap();
        write_configs(dir.path());
        let config_dir = Some(dir.path().to_string_lossy().into_owned());

        let result = route(config_dir, "nope", &json!({})).await;
        assert!(matches!(result, Err(Error::UnknownIntegration(_))));
    }
}
