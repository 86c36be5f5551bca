//! Handlers for alert groups: queries, actions and direct paging.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::json;

use super::{ApiError, ApiState};
use crate::models::{
    Actor, AlertGroupFilter, AlertGroupStatus, GroupAction, paging::PagingRequest,
};

/// Query string of `GET /alert-groups`.
#[derive(Debug, Default, Deserialize)]
pub struct AlertGroupQuery {
    /// Only groups in this status.
    pub status: Option<AlertGroupStatus>,
    /// Only groups of this integration.
    pub integration_id: Option<i64>,
    /// `key:value` label filter.
    pub label: Option<String>,
    /// Maximum number of groups.
    pub limit: Option<u32>,
}

impl AlertGroupQuery {
    fn into_filter(self) -> Result<AlertGroupFilter, ApiError> {
        let label = self
            .label
            .map(|label| {
                label
                    .split_once(':')
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .ok_or_else(|| ApiError::BadRequest("label must be key:value".to_string()))
            })
            .transpose()?;
        Ok(AlertGroupFilter {
            status: self.status,
            integration_id: self.integration_id,
            label,
            limit: self.limit.unwrap_or_default(),
        })
    }
}

/// An action requested through the API.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    /// Acknowledge.
    Acknowledge,
    /// Unacknowledge.
    Unacknowledge,
    /// Resolve.
    Resolve,
    /// Unresolve.
    Unresolve,
    /// Silence for a while.
    Silence {
        /// Silence length in seconds.
        duration_secs: u64,
    },
    /// Unsilence.
    Unsilence,
    /// Attach under another group.
    Attach {
        /// Root group.
        root_alert_group_id: i64,
    },
    /// Detach from the root group.
    Unattach,
}

impl ActionRequest {
    fn group_action(&self) -> Result<GroupAction, ApiError> {
        Ok(match self {
            ActionRequest::Acknowledge => GroupAction::Acknowledge,
            ActionRequest::Unacknowledge => GroupAction::Unacknowledge,
            ActionRequest::Resolve => GroupAction::Resolve,
            ActionRequest::Unresolve => GroupAction::Unresolve,
            ActionRequest::Silence { duration_secs: 0 } => {
                return Err(ApiError::UnprocessableEntity("duration_secs must be positive".into()));
            }
            ActionRequest::Silence { duration_secs } =>
                GroupAction::Silence { duration: Duration::from_secs(*duration_secs) },
            ActionRequest::Unsilence => GroupAction::Unsilence,
            ActionRequest::Attach { .. } | ActionRequest::Unattach => {
                return Err(ApiError::UnprocessableEntity(
                    "attach and unattach are not status actions".into(),
                ));
            }
        })
    }
}

/// Body of `POST /alert-groups/{id}/actions`.
#[derive(Debug, Deserialize)]
pub struct ActionBody {
    /// Acting user.
    pub user_id: String,
    /// The action.
    #[serde(flatten)]
    pub action: ActionRequest,
}

/// Body of `POST /alert-groups/bulk-action`.
#[derive(Debug, Deserialize)]
pub struct BulkActionBody {
    /// Target groups.
    pub alert_group_ids: Vec<i64>,
    /// Acting user.
    pub user_id: String,
    /// The action.
    #[serde(flatten)]
    pub action: ActionRequest,
}

fn actor(user_id: &str) -> Result<Actor, ApiError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(ApiError::UnprocessableEntity("user_id must not be empty".into()));
    }
    Ok(Actor::User(user_id.to_string()))
}

/// Lists alert groups, newest first.
pub async fn list_alert_groups(
    State(state): State<ApiState>,
    Query(query): Query<AlertGroupQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let groups = state.repo.list_alert_groups(&query.into_filter()?).await?;
    Ok((StatusCode::OK, Json(json!({ "alert_groups": groups }))))
}

/// Retrieves one group.
pub async fn get_alert_group(
    State(state): State<ApiState>,
    Path(alert_group_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let group = state
        .repo
        .get_alert_group(alert_group_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Alert group not found".to_string()))?;
    Ok((StatusCode::OK, Json(json!({ "alert_group": group }))))
}

/// Lists a group's alerts in arrival order.
pub async fn list_alerts(
    State(state): State<ApiState>,
    Path(alert_group_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.repo.get_alert_group(alert_group_id).await?.is_none() {
        return Err(ApiError::NotFound("Alert group not found".to_string()));
    }
    let alerts = state.repo.alerts_for_group(alert_group_id).await?;
    Ok((StatusCode::OK, Json(json!({ "alerts": alerts }))))
}

/// A group's timeline, oldest first.
pub async fn timeline(
    State(state): State<ApiState>,
    Path(alert_group_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.repo.get_alert_group(alert_group_id).await?.is_none() {
        return Err(ApiError::NotFound("Alert group not found".to_string()));
    }
    let timeline = state.repo.timeline(alert_group_id).await?;
    Ok((StatusCode::OK, Json(json!({ "timeline": timeline }))))
}

/// Applies one action. Actions that do not apply in the current status
/// answer `changed: false`.
pub async fn apply_action(
    State(state): State<ApiState>,
    Path(alert_group_id): Path<i64>,
    Json(body): Json<ActionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor(&body.user_id)?;
    let result = match body.action {
        ActionRequest::Attach { root_alert_group_id } =>
            state.actions.attach(alert_group_id, root_alert_group_id, actor).await?,
        ActionRequest::Unattach => state.actions.unattach(alert_group_id, actor).await?,
        action => state.actions.apply(alert_group_id, action.group_action()?, actor).await?,
    };
    Ok((StatusCode::OK, Json(result)))
}

/// Applies one status action to many groups and reports per id.
pub async fn bulk_action(
    State(state): State<ApiState>,
    Json(body): Json<BulkActionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor(&body.user_id)?;
    let action = body.action.group_action()?;
    let results = state.actions.bulk(&body.alert_group_ids, action, actor).await;
    Ok((StatusCode::OK, Json(json!({ "results": results }))))
}

/// Pages responders directly.
pub async fn page(
    State(state): State<ApiState>,
    Json(request): Json<PagingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state.pipeline.page(request).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}
