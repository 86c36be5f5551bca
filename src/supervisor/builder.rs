//! This module provides the `SupervisorBuilder` for constructing a `Supervisor`.

use std::sync::Arc;

use super::{Supervisor, SupervisorError};
use crate::{
    clock::{Clock, SystemClock},
    config::AppConfig,
    context::AppMetrics,
    engine::{
        EngineServices,
        actions::AlertGroupService,
        executor::{EscalationExecutor, Outbound},
        grouping::AlertGrouper,
        heartbeat::HeartbeatMonitor,
        maintenance::MaintenanceController,
        pipeline::{AlertPipeline, IngestHandle},
        queue::ChannelQueue,
        scheduler::EscalationScheduler,
        workers::EscalationDispatcher,
    },
    http_client::HttpClientPool,
    http_server::ApiState,
    loader::load_config_if_exists,
    models::{
        on_call::{ScheduleConfig, TeamConfig},
        webhook::WebhookConfig,
    },
    notifier::{HttpNotifier, HttpWebhookDispatcher, LogNotifier, Notifier, StaticOnCallResolver},
    persistence::sqlite::SqliteStateRepository,
    routing::{PredicateEvaluator, RouteService, RoutingTable},
};

/// A builder for creating a `Supervisor` instance.
#[derive(Default)]
pub struct SupervisorBuilder {
    config: Option<AppConfig>,
    state: Option<Arc<SqliteStateRepository>>,
    metrics: Option<AppMetrics>,
    clock: Option<Arc<dyn Clock>>,
    evaluator: Option<Arc<PredicateEvaluator>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl SupervisorBuilder {
    /// Creates a new, empty `SupervisorBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the application configuration for the `Supervisor`.
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the state repository (database connection) for the `Supervisor`.
    pub fn state(mut self, state: Arc<SqliteStateRepository>) -> Self {
        self.state = Some(state);
        self
    }

    /// Sets the shared counters. Fresh counters are used when unset.
    pub fn metrics(mut self, metrics: AppMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replaces the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shares a predicate evaluator (and its compiled-template cache).
    pub fn evaluator(mut self, evaluator: Arc<PredicateEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Replaces the notifier chosen from `notifier.relay_url`.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Wires every engine service together.
    ///
    /// Schedules, teams and webhooks are read from their resource files here;
    /// routing rules and maintenance windows are loaded from the database when
    /// the supervisor starts.
    pub async fn build(self) -> Result<Supervisor, SupervisorError> {
        let config = self.config.ok_or(SupervisorError::MissingConfig)?;
        let state = self.state.ok_or(SupervisorError::MissingStateRepository)?;
        let metrics = self.metrics.unwrap_or_default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let evaluator = self.evaluator.unwrap_or_else(|| Arc::new(PredicateEvaluator::new()));

        let schedules: Vec<ScheduleConfig> = load_config_if_exists(&config.schedules_config_path)?;
        let teams: Vec<TeamConfig> = load_config_if_exists(&config.schedules_config_path)?;
        let webhooks: Vec<WebhookConfig> = load_config_if_exists(&config.webhooks_config_path)?;
        tracing::info!(
            schedules = schedules.len(),
            teams = teams.len(),
            webhooks = webhooks.len(),
            "Outbound resources loaded."
        );

        let notifier = match (self.notifier, &config.notifier.relay_url) {
            (Some(notifier), _) => notifier,
            (None, Some(relay_url)) => {
                let client = config
                    .notifier
                    .http_base
                    .build_client()
                    .map_err(|e| SupervisorError::InvalidConfiguration(e.to_string()))?;
                tracing::info!(relay_url = %relay_url, "Notifications go to the relay.");
                Arc::new(HttpNotifier::new(relay_url.clone(), client)) as Arc<dyn Notifier>
            }
            (None, None) => {
                tracing::warn!("No notification relay configured; notifications are only logged.");
                Arc::new(LogNotifier)
            }
        };

        let pool = Arc::new(HttpClientPool::new(config.notifier.http_base.clone()));
        let webhooks = Arc::new(HttpWebhookDispatcher::new(webhooks, pool));

        let (queue, escalation_rx) = ChannelQueue::new(config.executor.queue_capacity);
        let queue = Arc::new(queue);
        let services = EngineServices {
            repo: state.clone(),
            clock: clock.clone(),
            metrics: metrics.clone(),
            queue: queue.clone(),
        };

        let table = Arc::new(RoutingTable::new(evaluator.clone(), metrics.clone()));
        let routes = Arc::new(RouteService::new(state.clone(), table.clone(), evaluator.clone()));
        let actions = Arc::new(AlertGroupService::new(services.clone()));
        let maintenance = Arc::new(MaintenanceController::new(state.clone(), clock.clone(), queue.clone()));
        let grouper = Arc::new(AlertGrouper::new(
            services.clone(),
            evaluator.clone(),
            actions.clone(),
            config.grouping.clone(),
        ));
        let pipeline = Arc::new(AlertPipeline::new(services.clone(), table, grouper, maintenance.clone()));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            services.clone(),
            pipeline.clone(),
            actions.clone(),
            config.heartbeat.clone(),
        ));

        let outbound = Outbound {
            notifier,
            webhooks: webhooks.clone(),
            on_call: Arc::new(StaticOnCallResolver::new(schedules, teams)),
        };
        let executor = Arc::new(EscalationExecutor::new(
            services.clone(),
            outbound,
            maintenance.clone(),
            actions.clone(),
            config.executor.clone(),
            config.default_channel.clone(),
        ));
        let dispatcher = EscalationDispatcher::new(
            executor,
            queue,
            config.executor.concurrency,
            config.executor.retry_delay_ms,
        );
        let scheduler = EscalationScheduler::new(services, actions.clone(), config.scheduler.clone());

        let (ingest, ingest_rx) = IngestHandle::new(config.ingest_channel_capacity);
        let config = Arc::new(config);
        let api_state = ApiState {
            config: config.clone(),
            repo: state.clone(),
            metrics,
            clock,
            ingest,
            pipeline: pipeline.clone(),
            actions,
            routes: routes.clone(),
            maintenance: maintenance.clone(),
            heartbeat: heartbeat.clone(),
            evaluator,
        };

        Ok(Supervisor {
            config,
            state,
            api_state,
            routes,
            pipeline,
            maintenance,
            heartbeat,
            webhooks,
            dispatcher: Arc::new(dispatcher),
            scheduler: Arc::new(scheduler),
            escalation_rx,
            ingest_rx,
            cancellation_token: tokio_util::sync::CancellationToken::new(),
            join_set: tokio::task::JoinSet::new(),
        })
    }
}
