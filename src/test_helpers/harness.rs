use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use super::{RecordingNotifier, RecordingQueue, RecordingWebhookDispatcher};
use crate::{
    clock::{Clock, ManualClock},
    config::{ExecutorConfig, GroupingConfig, HeartbeatMonitorConfig},
    context::AppMetrics,
    engine::{
        EngineServices,
        actions::AlertGroupService,
        executor::{EscalationExecutor, Outbound},
        grouping::AlertGrouper,
        heartbeat::HeartbeatMonitor,
        maintenance::MaintenanceController,
        pipeline::AlertPipeline,
    },
    models::{
        AlertGroup, EscalationChain, EscalationChainConfig, EscalationStep, Integration,
        NewIntegration,
    },
    notifier::{Notifier, StaticOnCallResolver},
    persistence::{
        sqlite::SqliteStateRepository,
        traits::{AlertStore, AppRepository, GroupingRequest},
    },
    routing::{PredicateEvaluator, RouteService, RoutingTable},
};

const DEFAULT_CHANNEL: &str = "push";

/// Monday 2025-03-10 12:00 UTC, where every test clock starts.
pub fn test_start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
}

/// A migrated in-memory repository, a manual clock and a recording queue.
pub struct TestHarness {
    /// The repository.
    pub repo: Arc<SqliteStateRepository>,
    /// The clock every service sees.
    pub clock: Arc<ManualClock>,
    /// Shared counters.
    pub metrics: AppMetrics,
    /// Escalation run requests.
    pub queue: Arc<RecordingQueue>,
}

impl TestHarness {
    /// Creates a new `TestHarness`.
    pub async fn new() -> Self {
        Self::on_database("sqlite::memory:").await
    }

    /// A harness over the database at `url`, migrated before use.
    pub async fn on_database(url: &str) -> Self {
        let repo = SqliteStateRepository::new(url).await.unwrap();
        repo.run_migrations().await.unwrap();
        Self {
            repo: Arc::new(repo),
            clock: Arc::new(ManualClock::new(test_start_time())),
            metrics: AppMetrics::default(),
            queue: Arc::new(RecordingQueue::default()),
        }
    }

    /// Engine services backed by this harness.
    pub fn services(&self) -> EngineServices {
        EngineServices {
            repo: self.repo.clone(),
            clock: self.clock.clone(),
            metrics: self.metrics.clone(),
            queue: self.queue.clone(),
        }
    }

    /// Returns the active integration called `name`, creating it with a bare
    /// default rule if needed.
    pub async fn create_integration(&self, name: &str) -> Integration {
        if let Some(existing) = self.repo.get_active_integration_by_name(name).await.unwrap() {
            return existing;
        }
        let integration = NewIntegration {
            name: name.to_string(),
            grouping_template: None,
            acknowledge_condition: None,
            resolve_condition: None,
        };
        self.repo.create_integration(&integration, None, &[], self.clock.now()).await.unwrap()
    }

    /// Creates a chain.
    pub async fn create_chain(&self, name: &str, steps: Vec<EscalationStep>) -> EscalationChain {
        let chain = EscalationChainConfig { name: name.to_string(), steps };
        self.repo.create_escalation_chain(&chain, false, self.clock.now()).await.unwrap()
    }

    /// Stores an alert under `key` without routing it or requesting a run.
    pub async fn fire_alert(&self, integration_name: &str, key: &str) -> AlertGroup {
        self.group(integration_name, key, None).await
    }

    /// Like [`Self::fire_alert`], binding a new group to `chain_id`.
    pub async fn fire_alert_with_chain(&self, integration_name: &str, key: &str, chain_id: i64) -> AlertGroup {
        self.group(integration_name, key, Some(chain_id)).await
    }

    async fn group(&self, integration_name: &str, key: &str, chain_id: Option<i64>) -> AlertGroup {
        let integration = self.create_integration(integration_name).await;
        let rule = self.repo.list_routing_rules(integration.id).await.unwrap().into_iter().find(|r| r.is_default());
        let now = self.clock.now();
        let request = GroupingRequest {
            integration_id: integration.id,
            grouping_key: key.to_string(),
            matched_rule_id: rule.map(|r| r.id),
            escalation_chain_id: chain_id,
            payload: json!({ "title": key }),
            labels: Default::default(),
            received_at: now,
            open_since: now - chrono::Duration::days(1),
            force_new: false,
            maintenance: None,
        };
        self.repo.group_alert(&request).await.unwrap().alert_group
    }

    /// Marks a group's escalation finished.
    pub async fn finish(&self, alert_group_id: i64) {
        let event = crate::models::TimelineEvent::EscalationFinished;
        assert!(self.repo.finish_escalation(alert_group_id, None, &event, self.clock.now()).await.unwrap());
    }

    /// Parks a group's escalation until `until`.
    pub async fn park(&self, alert_group_id: i64, until: DateTime<Utc>) {
        let now = self.clock.now();
        let owner = "test-harness";
        assert!(self.repo.try_acquire_lease(alert_group_id, owner, now, until).await.unwrap());
        assert!(self.repo.park_escalation(alert_group_id, owner, until).await.unwrap());
        self.repo.release_lease(alert_group_id, owner).await.unwrap();
    }
}

/// A [`TestHarness`] with the whole engine wired against recording adapters.
pub struct EngineHarness {
    /// The underlying harness.
    pub harness: TestHarness,
    /// Same as `harness.repo`.
    pub repo: Arc<SqliteStateRepository>,
    /// Same as `harness.clock`.
    pub clock: Arc<ManualClock>,
    /// Services shared by every component below.
    pub services: EngineServices,
    /// Rule management over the pipeline's routing table.
    pub routes: Arc<RouteService>,
    /// Group actions.
    pub actions: Arc<AlertGroupService>,
    /// Maintenance windows.
    pub maintenance: Arc<MaintenanceController>,
    /// Ingestion and paging.
    pub pipeline: Arc<AlertPipeline>,
    /// Heartbeats.
    pub heartbeat: Arc<HeartbeatMonitor>,
    /// The executor.
    pub executor: Arc<EscalationExecutor>,
    /// Records deliveries unless replaced with [`Self::with_notifier`].
    pub notifier: Arc<RecordingNotifier>,
    /// Records webhook events.
    pub webhooks: Arc<RecordingWebhookDispatcher>,
    outbound: Outbound,
}

impl EngineHarness {
    /// Creates a new `EngineHarness`.
    pub async fn new() -> Self {
        let notifier = Arc::new(RecordingNotifier::default());
        Self::build(TestHarness::new().await, notifier.clone(), notifier).await
    }

    /// An engine over the database at `url`, such as a file in a temp dir.
    pub async fn on_database(url: &str) -> Self {
        let notifier = Arc::new(RecordingNotifier::default());
        Self::build(TestHarness::on_database(url).await, notifier.clone(), notifier).await
    }

    /// An engine whose executor delivers through `notifier`.
    pub async fn with_notifier(notifier: Arc<dyn Notifier>) -> Self {
        Self::build(TestHarness::new().await, notifier, Arc::new(RecordingNotifier::default())).await
    }

    async fn build(harness: TestHarness, delivering: Arc<dyn Notifier>, recording: Arc<RecordingNotifier>) -> Self {
        let services = harness.services();
        let evaluator = Arc::new(PredicateEvaluator::new());
        let table = Arc::new(RoutingTable::new(evaluator.clone(), harness.metrics.clone()));
        let routes = Arc::new(RouteService::new(harness.repo.clone(), table.clone(), evaluator.clone()));
        let actions = Arc::new(AlertGroupService::new(services.clone()));
        let maintenance = Arc::new(MaintenanceController::new(harness.repo.clone(), harness.clock.clone(), harness.queue.clone()));
        let grouper = Arc::new(AlertGrouper::new(
            services.clone(),
            evaluator,
            actions.clone(),
            GroupingConfig::default(),
        ));
        let pipeline = Arc::new(AlertPipeline::new(services.clone(), table, grouper, maintenance.clone()));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            services.clone(),
            pipeline.clone(),
            actions.clone(),
            HeartbeatMonitorConfig::default(),
        ));
        let webhooks = Arc::new(RecordingWebhookDispatcher::default());
        let outbound = Outbound {
            notifier: delivering,
            webhooks: webhooks.clone(),
            on_call: Arc::new(StaticOnCallResolver::new(vec![], vec![])),
        };

        let executor = Arc::new(EscalationExecutor::new(
            services.clone(),
            outbound.clone(),
            maintenance.clone(),
            actions.clone(),
            ExecutorConfig::default(),
            DEFAULT_CHANNEL.to_string(),
        ));

        Self {
            repo: harness.repo.clone(),
            clock: harness.clock.clone(),
            harness,
            services,
            routes,
            actions,
            maintenance,
            pipeline,
            heartbeat,
            executor,
            notifier: recording,
            webhooks,
            outbound,
        }
    }

    fn executor_with(&self, config: ExecutorConfig) -> EscalationExecutor {
        EscalationExecutor::new(
            self.services.clone(),
            self.outbound.clone(),
            self.maintenance.clone(),
            self.actions.clone(),
            config,
            DEFAULT_CHANNEL.to_string(),
        )
    }

    /// An executor sharing this engine but bounding each delivery by `timeout`.
    pub fn executor_with_timeout(&self, timeout: Duration) -> EscalationExecutor {
        self.executor_with(ExecutorConfig { delivery_timeout_ms: timeout, ..ExecutorConfig::default() })
    }

    /// Creates a chain from `steps` and fires a new group bound to it.
    pub async fn group_with_chain(&self, steps: Vec<EscalationStep>) -> AlertGroup {
        let suffix = Uuid::new_v4().simple().to_string();
        let chain = self.harness.create_chain(&format!("chain-{suffix}"), steps).await;
        self.group_for_chain(chain.id, &suffix).await
    }

    /// Fires a new group under `key` bound to `chain_id`.
    pub async fn group_for_chain(&self, chain_id: i64, key: &str) -> AlertGroup {
        self.harness.fire_alert_with_chain("grafana", key, chain_id).await
    }
}
