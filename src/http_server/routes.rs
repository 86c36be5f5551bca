//! Handlers for routing rules.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::json;

use super::{ApiError, ApiState};
use crate::models::NewRoutingRule;

/// Body of `POST /integrations/{id}/routes`.
#[derive(Debug, Deserialize)]
pub struct CreateRouteRequest {
    /// The rule.
    #[serde(flatten)]
    pub rule: NewRoutingRule,
    /// Insert position; appended before the default rule when absent.
    #[serde(default)]
    pub position: Option<u32>,
}

/// Body of `POST /routes/{id}/move`.
#[derive(Debug, Deserialize)]
pub struct MoveRouteRequest {
    /// Position the caller saw the rule at.
    pub from: u32,
    /// Target position.
    pub to: u32,
    /// Rule the caller saw at `to`.
    #[serde(default)]
    pub expected_rule_at_to: Option<i64>,
}

/// Lists an integration's rules by position.
pub async fn list_routes(
    State(state): State<ApiState>,
    Path(integration_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let integration = state
        .repo
        .get_integration(integration_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Integration not found".to_string()))?;
    let routes = state.repo.list_routing_rules(integration.id).await?;
    Ok((StatusCode::OK, Json(json!({ "routes": routes }))))
}

/// Creates a non-default rule.
pub async fn create_route(
    State(state): State<ApiState>,
    Path(integration_id): Path<i64>,
    Json(request): Json<CreateRouteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let route = state.routes.create_rule(integration_id, request.rule, request.position).await?;
    Ok((StatusCode::CREATED, Json(json!({ "route": route }))))
}

/// Replaces a rule's filter, chain and destinations.
pub async fn update_route(
    State(state): State<ApiState>,
    Path(rule_id): Path<i64>,
    Json(rule): Json<NewRoutingRule>,
) -> Result<impl IntoResponse, ApiError> {
    let route = state.routes.update_rule(rule_id, rule).await?;
    Ok((StatusCode::OK, Json(json!({ "route": route }))))
}

/// Deletes a non-default rule.
pub async fn delete_route(
    State(state): State<ApiState>,
    Path(rule_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.routes.delete_rule(rule_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Moves a rule, rejecting the move when the caller's view is stale.
pub async fn move_route(
    State(state): State<ApiState>,
    Path(rule_id): Path<i64>,
    Json(request): Json<MoveRouteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let route = state
        .routes
        .move_rule(rule_id, request.from, request.to, request.expected_rule_at_to)
        .await?;
    Ok((StatusCode::OK, Json(json!({ "route": route }))))
}
