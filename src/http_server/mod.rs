//! HTTP server module

mod alert_groups;
mod auth;
mod chains;
mod error;
mod integrations;
mod routes;
mod status;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router, middleware,
    response::IntoResponse,
    routing::{MethodRouter, delete, get, post, put},
};
pub use error::ApiError;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::Clock,
    config::AppConfig,
    context::AppMetrics,
    engine::{
        actions::AlertGroupService, heartbeat::HeartbeatMonitor,
        maintenance::MaintenanceController, pipeline::{AlertPipeline, IngestHandle},
    },
    persistence::traits::StateRepository,
    routing::{PredicateEvaluator, RouteService},
};

/// Shared state of every handler.
#[derive(Clone)]
pub struct ApiState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Durable state.
    pub repo: Arc<dyn StateRepository>,
    /// Shared counters.
    pub metrics: AppMetrics,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Queues alerts for the ingestion workers.
    pub ingest: IngestHandle,
    /// Direct paging.
    pub pipeline: Arc<AlertPipeline>,
    /// Alert group actions.
    pub actions: Arc<AlertGroupService>,
    /// Routing rule management.
    pub routes: Arc<RouteService>,
    /// Maintenance windows.
    pub maintenance: Arc<MaintenanceController>,
    /// Heartbeats.
    pub heartbeat: Arc<HeartbeatMonitor>,
    /// Template and predicate validation.
    pub evaluator: Arc<PredicateEvaluator>,
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Builds the API router. Write endpoints other than alert ingestion and
/// heartbeat pings require the API key when one is configured.
pub fn build_router(state: ApiState) -> Router {
    let guarded = |method_router: MethodRouter<ApiState>| {
        method_router.route_layer(middleware::from_fn_with_state(state.clone(), auth::auth))
    };

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status::status))
        .route(
            "/integrations",
            get(integrations::list_integrations).merge(guarded(post(integrations::create_integration))),
        )
        .route("/integrations/{id}", guarded(delete(integrations::delete_integration)))
        .route("/integrations/{id}/alerts", post(integrations::ingest_alert))
        .route(
            "/integrations/{id}/heartbeat",
            post(integrations::ping_heartbeat).merge(guarded(put(integrations::configure_heartbeat))),
        )
        .route(
            "/integrations/{id}/maintenance",
            get(integrations::get_maintenance).merge(guarded(
                put(integrations::start_maintenance).delete(integrations::stop_maintenance),
            )),
        )
        .route(
            "/integrations/{id}/routes",
            get(routes::list_routes).merge(guarded(post(routes::create_route))),
        )
        .route("/routes/{id}", guarded(put(routes::update_route).delete(routes::delete_route)))
        .route("/routes/{id}/move", guarded(post(routes::move_route)))
        .route(
            "/escalation-chains",
            get(chains::list_chains).merge(guarded(post(chains::create_chain))),
        )
        .route(
            "/escalation-chains/{id}",
            get(chains::get_chain).merge(guarded(put(chains::update_chain).delete(chains::delete_chain))),
        )
        .route("/alert-groups", get(alert_groups::list_alert_groups))
        .route("/alert-groups/bulk-action", guarded(post(alert_groups::bulk_action)))
        .route("/alert-groups/{id}", get(alert_groups::get_alert_group))
        .route("/alert-groups/{id}/alerts", get(alert_groups::list_alerts))
        .route("/alert-groups/{id}/timeline", get(alert_groups::timeline))
        .route("/alert-groups/{id}/actions", guarded(post(alert_groups::apply_action)))
        .route("/paging", guarded(post(alert_groups::page)))
        .with_state(state)
}

/// Serves the API on `listener` until cancelled.
pub async fn serve(listener: TcpListener, state: ApiState, cancellation_token: CancellationToken) {
    let app = build_router(state);
    let addr = listener.local_addr().ok();
    tracing::info!(address = ?addr, "HTTP server listening.");
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancellation_token.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "HTTP server failed.");
    }
    tracing::info!("HTTP server stopped.");
}

/// Binds the configured address and serves the API until cancelled.
pub async fn run_server_from_config(
    state: ApiState,
    cancellation_token: CancellationToken,
) -> std::io::Result<()> {
    let addr: SocketAddr = state.config.server.listen_address.parse().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid server.listen_address: {e}"),
        )
    })?;
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, cancellation_token).await;
    Ok(())
}
