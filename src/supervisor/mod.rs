//! The Supervisor module manages the lifecycle of the Beacon engine.
//!
//! The supervisor owns every long-running service: the HTTP API, the
//! ingestion workers, the escalation dispatcher, the deadline scheduler and
//! the heartbeat monitor.
//!
//! ## Responsibilities
//!
//! - **Initialization**: The `SupervisorBuilder` constructs and wires the
//!   services, injecting configuration, the database and the outbound
//!   adapters.
//! - **Startup**: Routing rules and maintenance windows are loaded from the
//!   database, then escalations that were running when the process stopped
//!   are re-queued.
//! - **Graceful Shutdown**: On Ctrl+C or SIGTERM every service is cancelled,
//!   escalation runs in flight are drained and pending webhook calls are
//!   awaited within `shutdown_timeout`.
//! - **Task Supervision**: If a critical service panics, the supervisor shuts
//!   the others down so the process exits instead of running half-alive.

mod builder;

use std::sync::Arc;

pub use builder::SupervisorBuilder;
use thiserror::Error;
use tokio::{signal, sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    config::AppConfig,
    engine::{
        heartbeat::HeartbeatMonitor,
        maintenance::{MaintenanceController, MaintenanceError},
        pipeline::{AlertPipeline, IngestRequest},
        scheduler::EscalationScheduler,
        workers::{EscalationDispatcher, run_ingest_workers},
    },
    http_server::{self, ApiState},
    models::{on_call::OnCallConfigError, webhook::WebhookConfigError},
    notifier::HttpWebhookDispatcher,
    persistence::{error::PersistenceError, sqlite::SqliteStateRepository, traits::StateRepository},
    routing::{RouteService, RoutingError},
};

/// Represents the set of errors that can occur during the supervisor's
/// operation.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A required configuration was not provided to the `SupervisorBuilder`.
    #[error("Missing configuration for Supervisor")]
    MissingConfig,

    /// A state repository was not provided to the `SupervisorBuilder`.
    #[error("Missing state repository for Supervisor")]
    MissingStateRepository,

    /// An error occurred due to an invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// `schedules.yaml` could not be loaded.
    #[error("Failed to load schedules: {0}")]
    OnCallLoad(#[from] OnCallConfigError),

    /// `webhooks.yaml` could not be loaded.
    #[error("Failed to load webhooks: {0}")]
    WebhookLoad(#[from] WebhookConfigError),

    /// Routing rules could not be loaded.
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Maintenance windows could not be restored.
    #[error("Maintenance error: {0}")]
    Maintenance(#[from] MaintenanceError),

    /// A storage failure during startup.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// The primary runtime manager for the application.
///
/// Once `run` is called, it becomes the main process loop.
pub struct Supervisor {
    /// Shared application configuration.
    config: Arc<AppConfig>,

    /// The persistent state repository.
    state: Arc<SqliteStateRepository>,

    /// Everything the HTTP handlers need.
    api_state: ApiState,

    /// Routing rules, loaded into the in-memory table at startup.
    routes: Arc<RouteService>,

    /// Ingestion and paging.
    pipeline: Arc<AlertPipeline>,

    /// Maintenance windows and their expiry timers.
    maintenance: Arc<MaintenanceController>,

    /// Heartbeat sweeps.
    heartbeat: Arc<HeartbeatMonitor>,

    /// Outgoing webhook calls, awaited on shutdown.
    webhooks: Arc<HttpWebhookDispatcher>,

    /// Consumes the escalation queue.
    dispatcher: Arc<EscalationDispatcher>,

    /// Parked chains, silence expiry and stale leases.
    scheduler: Arc<EscalationScheduler>,

    /// Receiving end of the escalation queue.
    escalation_rx: mpsc::Receiver<i64>,

    /// Receiving end of the ingestion queue.
    ingest_rx: mpsc::Receiver<IngestRequest>,

    /// A token used to signal a graceful shutdown to all supervised tasks.
    cancellation_token: CancellationToken,

    /// A set of all spawned tasks that the supervisor is actively managing.
    join_set: JoinSet<()>,
}

impl Supervisor {
    /// Returns a new `SupervisorBuilder` instance.
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::new()
    }

    /// A token that stops the supervisor when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Starts every service and supervises them until shutdown.
    ///
    /// 1. Loads routing rules and restores maintenance timers.
    /// 2. Spawns the signal handler, the HTTP server, the ingestion workers,
    ///    the escalation dispatcher, the scheduler and the heartbeat monitor.
    /// 3. Re-queues escalations interrupted by the previous shutdown.
    /// 4. Waits for a shutdown signal or a failed task, then drains the
    ///    services and cleans up within `shutdown_timeout`.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        self.routes.load_all().await?;
        let restored = self.maintenance.restore().await?;
        tracing::info!(maintenance_windows = restored, "Engine state loaded.");

        let cancellation_token = self.cancellation_token.clone();
        self.join_set.spawn(async move {
            let ctrl_c = signal::ctrl_c();
            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to register SIGTERM handler.");
                        std::future::pending::<()>().await;
                    }
                }
            };
            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => tracing::info!("SIGINT (Ctrl+C) received, initiating graceful shutdown."),
                _ = terminate => tracing::info!("SIGTERM received, initiating graceful shutdown."),
                _ = cancellation_token.cancelled() => {},
            }

            cancellation_token.cancel();
        });

        if self.config.server.enabled {
            let api_state = self.api_state.clone();
            let token = self.cancellation_token.clone();
            self.join_set.spawn(async move {
                if let Err(e) = http_server::run_server_from_config(api_state, token.clone()).await {
                    tracing::error!(error = %e, "HTTP server failed to start. Initiating shutdown.");
                    token.cancel();
                }
            });
        }

        self.join_set.spawn(run_ingest_workers(
            Arc::clone(&self.pipeline),
            self.ingest_rx,
            self.config.ingest_workers,
            self.cancellation_token.clone(),
        ));

        let escalation_rx = self.escalation_rx;
        let dispatcher = Arc::clone(&self.dispatcher);
        let token = self.cancellation_token.clone();
        self.join_set.spawn(async move {
            dispatcher.run(escalation_rx, token).await;
        });

        let scheduler = Arc::clone(&self.scheduler);
        let token = self.cancellation_token.clone();
        self.join_set.spawn(async move {
            if let Err(e) = scheduler.recover().await {
                tracing::error!(error = %e, "Failed to recover escalations.");
            }
            scheduler.run(token).await;
        });

        let heartbeat = Arc::clone(&self.heartbeat);
        let token = self.cancellation_token.clone();
        self.join_set.spawn(async move {
            heartbeat.run(token).await;
        });

        loop {
            tokio::select! {
                maybe_result = self.join_set.join_next() => {
                    match maybe_result {
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            tracing::error!("A critical task failed: {:?}. Initiating shutdown.", e);
                            self.cancellation_token.cancel();
                        }
                        None => break,
                    }
                }
                _ = self.cancellation_token.cancelled() => break,
            }
        }

        tracing::info!("Starting graceful shutdown...");
        let shutdown_timeout = self.config.shutdown_timeout;

        let join_set = &mut self.join_set;
        let state = &self.state;
        let maintenance = &self.maintenance;
        let webhooks = &self.webhooks;
        let cleanup_logic = async {
            // Runs in flight finish their current step; webhooks already
            // handed to the dispatcher are awaited.
            while join_set.join_next().await.is_some() {}
            tracing::info!("All supervised tasks have completed.");

            maintenance.shutdown();
            webhooks.wait().await;

            if let Err(e) = state.flush().await {
                tracing::error!(error = %e, "Failed to flush pending writes, but continuing cleanup.");
            }
            if let Err(e) = state.cleanup().await {
                tracing::error!(error = %e, "Failed to perform state repository cleanup, but continuing.");
            }
        };

        if tokio::time::timeout(shutdown_timeout, cleanup_logic).await.is_err() {
            tracing::warn!(
                "Cleanup did not complete within the timeout of {:?}. Continuing shutdown.",
                shutdown_timeout
            );
            self.join_set.shutdown().await;
        } else {
            tracing::info!("Cleanup completed successfully.");
        }

        self.state.close().await;
        tracing::info!("Supervisor shutdown complete.");
        Ok(())
    }
}
