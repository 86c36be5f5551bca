//! Handlers for escalation chains.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

use super::{ApiError, ApiState};
use crate::{loader::Loadable, models::EscalationChainConfig};

fn validated(mut chain: EscalationChainConfig) -> Result<EscalationChainConfig, ApiError> {
    chain.validate().map_err(|e| ApiError::UnprocessableEntity(e.to_string()))?;
    Ok(chain)
}

/// Lists reusable chains.
pub async fn list_chains(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let chains = state.repo.list_escalation_chains().await?;
    Ok((StatusCode::OK, Json(json!({ "escalation_chains": chains }))))
}

/// Retrieves one chain, single-use paging chains included.
pub async fn get_chain(
    State(state): State<ApiState>,
    Path(chain_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let chain = state
        .repo
        .get_escalation_chain(chain_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Escalation chain not found".to_string()))?;
    Ok((StatusCode::OK, Json(json!({ "escalation_chain": chain }))))
}

/// Creates a chain.
pub async fn create_chain(
    State(state): State<ApiState>,
    Json(chain): Json<EscalationChainConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let chain = validated(chain)?;
    let created = state.repo.create_escalation_chain(&chain, false, state.clock.now()).await?;
    tracing::info!(chain_id = created.id, name = %created.name, "Escalation chain created.");
    Ok((StatusCode::CREATED, Json(json!({ "escalation_chain": created }))))
}

/// Replaces a chain's name and steps. Groups already escalating continue
/// from their persisted cursor against the new steps.
pub async fn update_chain(
    State(state): State<ApiState>,
    Path(chain_id): Path<i64>,
    Json(chain): Json<EscalationChainConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let chain = validated(chain)?;
    let updated = state.repo.update_escalation_chain(chain_id, &chain, state.clock.now()).await?;
    Ok((StatusCode::OK, Json(json!({ "escalation_chain": updated }))))
}

/// Deletes a chain no routing rule refers to.
pub async fn delete_chain(
    State(state): State<ApiState>,
    Path(chain_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.repo.delete_escalation_chain(chain_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
