//! Handlers for integrations: CRUD, alert ingestion, heartbeats and
//! maintenance windows.

use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ApiError, ApiState};
use crate::models::{Integration, MaintenanceMode, NewIntegration};

/// Body of `POST /integrations`.
#[derive(Debug, Deserialize)]
pub struct CreateIntegrationRequest {
    /// Name, templates and predicates.
    #[serde(flatten)]
    pub integration: NewIntegration,
    /// Chain of the default route.
    #[serde(default)]
    pub default_escalation_chain_id: Option<i64>,
    /// Chat destinations of the default route.
    #[serde(default)]
    pub default_chat_destinations: Vec<String>,
}

/// Body of `PUT /integrations/{id}/heartbeat`.
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    /// Maximum silence in seconds.
    pub interval_secs: u64,
}

/// Body of `PUT /integrations/{id}/maintenance`.
#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    /// Debug or suppress.
    pub mode: MaintenanceMode,
    /// Window length in seconds.
    pub duration_secs: u64,
}

async fn active_integration(state: &ApiState, integration_id: i64) -> Result<Integration, ApiError> {
    state
        .repo
        .get_integration(integration_id)
        .await?
        .filter(|integration| !integration.is_deleted())
        .ok_or_else(|| ApiError::NotFound("Integration not found".to_string()))
}

/// Lists active integrations.
pub async fn list_integrations(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let integrations = state.repo.list_integrations().await?;
    Ok((StatusCode::OK, Json(json!({ "integrations": integrations }))))
}

/// Creates an integration with its default route.
pub async fn create_integration(
    State(state): State<ApiState>,
    Json(mut request): Json<CreateIntegrationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let integration = &mut request.integration;
    integration.name = integration.name.trim().to_string();
    if integration.name.is_empty() {
        return Err(ApiError::UnprocessableEntity("Integration name must not be empty".into()));
    }
    if let Some(template) = &integration.grouping_template {
        state.evaluator.validate_template(template)?;
    }
    for condition in [&integration.acknowledge_condition, &integration.resolve_condition].into_iter().flatten() {
        state.evaluator.validate_expression(condition)?;
    }
    state.routes.validate_chain(request.default_escalation_chain_id).await?;

    let created = state
        .repo
        .create_integration(
            &request.integration,
            request.default_escalation_chain_id,
            &request.default_chat_destinations,
            state.clock.now(),
        )
        .await?;
    state.routes.reload_integration(created.id).await?;
    tracing::info!(integration_id = created.id, name = %created.name, "Integration created.");

    Ok((StatusCode::CREATED, Json(json!({ "integration": created }))))
}

/// Soft-deletes an integration. Its groups and timeline stay readable.
pub async fn delete_integration(
    State(state): State<ApiState>,
    Path(integration_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    active_integration(&state, integration_id).await?;
    state.repo.delete_integration(integration_id, state.clock.now()).await?;
    state.maintenance.stop(integration_id).await?;
    state.routes.reload_integration(integration_id).await?;
    tracing::info!(integration_id, "Integration deleted.");
    Ok(StatusCode::NO_CONTENT)
}

/// Accepts an alert. Answers once it is grouped.
pub async fn ingest_alert(
    State(state): State<ApiState>,
    Path(integration_id): Path<i64>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state.ingest.ingest(integration_id, payload).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// Records a heartbeat ping.
pub async fn ping_heartbeat(
    State(state): State<ApiState>,
    Path(integration_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.heartbeat.ping(integration_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Configures the heartbeat of an integration.
pub async fn configure_heartbeat(
    State(state): State<ApiState>,
    Path(integration_id): Path<i64>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let heartbeat = state.heartbeat.configure(integration_id, request.interval_secs).await?;
    Ok((StatusCode::OK, Json(json!({ "heartbeat": heartbeat }))))
}

/// The maintenance window in force, if any.
pub async fn get_maintenance(
    State(state): State<ApiState>,
    Path(integration_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    active_integration(&state, integration_id).await?;
    let window = state.maintenance.active_window(integration_id).await?;
    Ok((StatusCode::OK, Json(json!({ "maintenance": window }))))
}

/// Starts (or replaces) a maintenance window.
pub async fn start_maintenance(
    State(state): State<ApiState>,
    Path(integration_id): Path<i64>,
    Json(request): Json<MaintenanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let window = state
        .maintenance
        .start(integration_id, request.mode, Duration::from_secs(request.duration_secs))
        .await?;
    Ok((StatusCode::OK, Json(json!({ "maintenance": window }))))
}

/// Ends maintenance early.
pub async fn stop_maintenance(
    State(state): State<ApiState>,
    Path(integration_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    active_integration(&state, integration_id).await?;
    if state.maintenance.stop(integration_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("No active maintenance window".to_string()))
    }
}
