//! This module provides the `InitializationService` responsible for loading
//! the resource files (escalation chains, integrations with their routes and
//! heartbeats, notification policies) into the database at startup.

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;

use crate::{
    clock::Clock,
    config::AppConfig,
    loader::{LoaderError, load_config_if_exists},
    models::{
        EscalationChainConfig, IntegrationConfig, NewRoutingRule, NotificationPolicy,
        escalation::EscalationChainConfigError, integration::IntegrationConfigError,
    },
    persistence::{error::PersistenceError, traits::StateRepository},
    routing::{PredicateError, PredicateEvaluator},
};

/// Errors that can occur during initialization.
#[derive(Debug, Error)]
pub enum InitializationError {
    /// `escalation_chains.yaml` is invalid.
    #[error("Failed to load escalation chains: {0}")]
    ChainLoad(#[from] EscalationChainConfigError),

    /// `integrations.yaml` is invalid.
    #[error("Failed to load integrations: {0}")]
    IntegrationLoad(#[from] IntegrationConfigError),

    /// `users.yaml` is invalid.
    #[error("Failed to load notification policies: {0}")]
    PolicyLoad(#[from] LoaderError),

    /// An integration refers to a chain that is not declared.
    #[error("Integration '{integration}' refers to unknown escalation chain '{chain}'")]
    UnknownChain {
        /// Integration name.
        integration: String,
        /// Chain name.
        chain: String,
    },

    /// A template or predicate of an integration does not compile.
    #[error("Integration '{integration}': {source}")]
    InvalidPredicate {
        /// Integration name.
        integration: String,
        /// Compilation error.
        #[source]
        source: PredicateError,
    },

    /// Storage failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// A service responsible for initializing application state at startup.
pub struct InitializationService {
    config: AppConfig,
    repo: Arc<dyn StateRepository>,
    evaluator: Arc<PredicateEvaluator>,
    clock: Arc<dyn Clock>,
}

impl InitializationService {
    /// Creates a new `InitializationService`.
    pub fn new(
        config: AppConfig,
        repo: Arc<dyn StateRepository>,
        evaluator: Arc<PredicateEvaluator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, repo, evaluator, clock }
    }

    /// Loads chains first so integrations can refer to them by name.
    pub async fn run(&self) -> Result<(), InitializationError> {
        let chains = self.load_escalation_chains().await?;
        self.load_integrations(&chains).await?;
        self.load_notification_policies().await?;
        Ok(())
    }

    /// Upserts every chain by name and returns their ids by name.
    pub(crate) async fn load_escalation_chains(&self) -> Result<HashMap<String, i64>, InitializationError> {
        let path = &self.config.escalation_chains_config_path;
        let chains: Vec<EscalationChainConfig> = load_config_if_exists(path)?;
        let now = self.clock.now();

        let mut ids = HashMap::with_capacity(chains.len());
        for chain in &chains {
            let stored = match self.repo.get_escalation_chain_by_name(&chain.name).await? {
                Some(existing) => self.repo.update_escalation_chain(existing.id, chain, now).await?,
                None => self.repo.create_escalation_chain(chain, false, now).await?,
            };
            ids.insert(stored.name.clone(), stored.id);
        }
        tracing::info!(count = chains.len(), path = %path.display(), "Escalation chains loaded.");
        Ok(ids)
    }

    /// Upserts every integration by name, replacing its routes and
    /// configuring its heartbeat.
    pub(crate) async fn load_integrations(
        &self,
        chains: &HashMap<String, i64>,
    ) -> Result<(), InitializationError> {
        let path = &self.config.integrations_config_path;
        let integrations: Vec<IntegrationConfig> = load_config_if_exists(path)?;
        let now = self.clock.now();

        for declared in &integrations {
            self.validate_integration(declared)?;
            let chain_id = |name: &Option<String>| -> Result<Option<i64>, InitializationError> {
                name.as_ref()
                    .map(|chain| {
                        chains.get(chain).copied().ok_or_else(|| InitializationError::UnknownChain {
                            integration: declared.name.clone(),
                            chain: chain.clone(),
                        })
                    })
                    .transpose()
            };

            let default_chain_id = chain_id(&declared.default_route.escalation_chain)?;
            let mut rules = Vec::with_capacity(declared.routes.len());
            for route in &declared.routes {
                rules.push(NewRoutingRule {
                    filter: route.filter.clone(),
                    escalation_chain_id: chain_id(&route.escalation_chain)?,
                    chat_destinations: route.chat_destinations.clone(),
                });
            }

            let fields = declared.to_new_integration();
            let default_destinations = &declared.default_route.chat_destinations;
            let integration = match self.repo.get_active_integration_by_name(&declared.name).await? {
                Some(existing) => self.repo.update_integration(existing.id, &fields).await?,
                None => {
                    self.repo
                        .create_integration(&fields, default_chain_id, default_destinations, now)
                        .await?
                }
            };
            self.repo
                .replace_routing_rules(integration.id, &rules, default_chain_id, default_destinations)
                .await?;

            if let Some(heartbeat) = declared.heartbeat {
                self.repo.upsert_heartbeat(integration.id, heartbeat.interval_secs, now).await?;
            }
            tracing::debug!(integration_id = integration.id, name = %integration.name, routes = rules.len() + 1, "Integration loaded.");
        }
        tracing::info!(count = integrations.len(), path = %path.display(), "Integrations loaded.");
        Ok(())
    }

    fn validate_integration(&self, declared: &IntegrationConfig) -> Result<(), InitializationError> {
        let invalid = |source| InitializationError::InvalidPredicate {
            integration: declared.name.clone(),
            source,
        };
        if let Some(template) = &declared.grouping_template {
            self.evaluator.validate_template(template).map_err(invalid)?;
        }
        for condition in [&declared.acknowledge_condition, &declared.resolve_condition].into_iter().flatten() {
            self.evaluator.validate_expression(condition).map_err(invalid)?;
        }
        for route in &declared.routes {
            self.evaluator.validate_filter(&route.filter).map_err(invalid)?;
        }
        Ok(())
    }

    /// Upserts every notification policy.
    pub(crate) async fn load_notification_policies(&self) -> Result<(), InitializationError> {
        let path = &self.config.users_config_path;
        let policies: Vec<NotificationPolicy> = load_config_if_exists(path)?;
        for policy in &policies {
            self.repo.upsert_notification_policy(policy).await?;
        }
        tracing::info!(count = policies.len(), path = %path.display(), "Notification policies loaded.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use tempfile::TempDir;

    use super::*;
    use crate::{
        models::{EscalationStep, RouteFilter},
        persistence::traits::{AlertStore, AppRepository},
        test_helpers::TestHarness,
    };

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    const CHAINS: &str = r#"
escalation_chains:
  - name: critical
    steps:
      - type: notify_users
        user_ids: [alice]
        tier: important
      - type: wait
        delay_secs: 300
  - name: low
    steps: []
"#;

    const INTEGRATIONS: &str = r##"
integrations:
  - name: grafana
    grouping_template: "{{ payload.labels.alertname }}"
    resolve_condition: "payload.state == 'ok'"
    routes:
      - filter:
          type: template
          value: "payload.severity == 'critical'"
        escalation_chain: critical
    default_route:
      escalation_chain: low
      chat_destinations: ["#alerts"]
    heartbeat:
      interval_secs: 120
"##;

    fn config(dir: &TempDir, integrations: &str) -> AppConfig {
        AppConfig {
            escalation_chains_config_path: write(dir, "escalation_chains.yaml", CHAINS),
            integrations_config_path: write(dir, "integrations.yaml", integrations),
            users_config_path: write(
                dir,
                "users.yaml",
                "users:\n  - user_id: alice\n    important:\n      - channel: phone\n",
            ),
            ..AppConfig::default()
        }
    }

    fn service(harness: &TestHarness, config: AppConfig) -> InitializationService {
        InitializationService::new(
            config,
            harness.repo.clone(),
            Arc::new(PredicateEvaluator::new()),
            harness.clock.clone(),
        )
    }

    #[tokio::test]
    async fn test_loads_every_resource() {
        let harness = TestHarness::new().await;
        let dir = TempDir::new().unwrap();
        service(&harness, config(&dir, INTEGRATIONS)).run().await.unwrap();

        let critical = harness.repo.get_escalation_chain_by_name("critical").await.unwrap().unwrap();
        assert_eq!(critical.steps.len(), 2);
        assert!(matches!(critical.steps[1], EscalationStep::Wait { delay_secs: 300 }));
        let low = harness.repo.get_escalation_chain_by_name("low").await.unwrap().unwrap();

        let grafana = harness.repo.get_active_integration_by_name("grafana").await.unwrap().unwrap();
        let rules = harness.repo.list_routing_rules(grafana.id).await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].filter, RouteFilter::Template("payload.severity == 'critical'".into()));
        assert_eq!(rules[0].escalation_chain_id, Some(critical.id));
        assert!(rules[1].is_default());
        assert_eq!(rules[1].escalation_chain_id, Some(low.id));
        assert_eq!(rules[1].chat_destinations, vec!["#alerts".to_string()]);

        assert_eq!(harness.repo.get_heartbeat(grafana.id).await.unwrap().unwrap().interval_seconds, 120);
        let policy = harness.repo.get_notification_policy("alice").await.unwrap().unwrap();
        assert_eq!(policy.important[0].channel, "phone");
    }

    #[tokio::test]
    async fn test_reload_upserts_by_name() {
        let harness = TestHarness::new().await;
        let dir = TempDir::new().unwrap();
        service(&harness, config(&dir, INTEGRATIONS)).run().await.unwrap();
        let before = harness.repo.get_active_integration_by_name("grafana").await.unwrap().unwrap();
        let group = harness.fire_alert("grafana", "disk").await;

        service(&harness, config(&dir, INTEGRATIONS)).run().await.unwrap();

        let after = harness.repo.get_active_integration_by_name("grafana").await.unwrap().unwrap();
        assert_eq!(before.id, after.id);
        assert_eq!(harness.repo.list_integrations().await.unwrap().len(), 1);
        assert_eq!(harness.repo.list_escalation_chains().await.unwrap().len(), 2);
        assert_eq!(harness.repo.list_routing_rules(after.id).await.unwrap().len(), 2);
        assert!(harness.repo.get_alert_group(group.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_files_are_skipped() {
        let harness = TestHarness::new().await;
        let dir = TempDir::new().unwrap();
        let config = AppConfig {
            escalation_chains_config_path: dir.path().join("escalation_chains.yaml"),
            integrations_config_path: dir.path().join("integrations.yaml"),
            users_config_path: dir.path().join("users.yaml"),
            ..AppConfig::default()
        };
        service(&harness, config).run().await.unwrap();
        assert!(harness.repo.list_integrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_chain_is_rejected() {
        let harness = TestHarness::new().await;
        let dir = TempDir::new().unwrap();
        let integrations = "integrations:\n  - name: grafana\n    default_route:\n      escalation_chain: nope\n";
        let err = service(&harness, config(&dir, integrations)).run().await.unwrap_err();
        assert!(matches!(err, InitializationError::UnknownChain { ref chain, .. } if chain == "nope"));
        assert!(harness.repo.list_integrations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_predicate_is_rejected_before_commit() {
        let harness = TestHarness::new().await;
        let dir = TempDir::new().unwrap();
        let integrations = "integrations:\n  - name: grafana\n    routes:\n      - filter:\n          type: template\n          value: \"payload.value +\"\n";
        let err = service(&harness, config(&dir, integrations)).run().await.unwrap_err();
        assert!(matches!(err, InitializationError::InvalidPredicate { .. }));
        assert!(harness.repo.list_integrations().await.unwrap().is_empty());
    }
}
