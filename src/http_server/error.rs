//! Defines the custom `ApiError` type for the HTTP server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

use crate::{
    engine::{
        actions::ActionError, heartbeat::HeartbeatError, maintenance::MaintenanceError,
        pipeline::PipelineError,
    },
    persistence::error::PersistenceError,
    routing::{PredicateError, RoutingError},
};

/// A custom error type for the API that can be converted into an HTTP response.
#[derive(Debug)]
pub enum ApiError {
    /// Represents an unauthorized request.
    Unauthorized,

    /// Represents a resource that could not be found.
    NotFound(String),

    /// Represents a malformed request.
    BadRequest(String),

    /// Represents a validation error for an unprocessable entity.
    UnprocessableEntity(String),

    /// Represents a conflict, e.g., a stale view of rule positions.
    Conflict(String),

    /// The engine is shutting down.
    ServiceUnavailable(String),

    /// Represents a generic internal server error.
    InternalServerError(String),
}

/// Converts a `PersistenceError` into an `ApiError`.
///
/// This allows for the convenient use of the `?` operator in handlers
/// on functions that return `Result<_, PersistenceError>`.
impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound(what) => ApiError::NotFound(format!("Not found: {what}")),
            PersistenceError::InvalidInput(msg) => ApiError::UnprocessableEntity(msg),
            PersistenceError::AlreadyExists(msg) | PersistenceError::Conflict(msg) =>
                ApiError::Conflict(msg),
            _ => ApiError::InternalServerError(err.to_string()),
        }
    }
}

impl From<PredicateError> for ApiError {
    fn from(err: PredicateError) -> Self {
        ApiError::UnprocessableEntity(err.to_string())
    }
}

impl From<RoutingError> for ApiError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::UnknownIntegration(_) | RoutingError::RuleNotFound(_) =>
                ApiError::NotFound(err.to_string()),
            RoutingError::InvalidPredicate(_)
            | RoutingError::UnknownChain(_)
            | RoutingError::InvalidChange(_)
            | RoutingError::MissingDefaultRule(_) => ApiError::UnprocessableEntity(err.to_string()),
            RoutingError::PositionDrift(_) => ApiError::Conflict(err.to_string()),
            RoutingError::Persistence(e) => e.into(),
        }
    }
}

impl From<ActionError> for ApiError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ActionError::Persistence(e) => e.into(),
        }
    }
}

impl From<MaintenanceError> for ApiError {
    fn from(err: MaintenanceError) -> Self {
        match err {
            MaintenanceError::UnknownIntegration(_) => ApiError::NotFound(err.to_string()),
            MaintenanceError::InvalidDuration => ApiError::UnprocessableEntity(err.to_string()),
            MaintenanceError::Persistence(e) => e.into(),
        }
    }
}

impl From<HeartbeatError> for ApiError {
    fn from(err: HeartbeatError) -> Self {
        match err {
            HeartbeatError::UnknownIntegration(_) | HeartbeatError::NotConfigured(_) =>
                ApiError::NotFound(err.to_string()),
            HeartbeatError::InvalidInterval => ApiError::UnprocessableEntity(err.to_string()),
            HeartbeatError::Action(e) => e.into(),
            HeartbeatError::Persistence(e) => e.into(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::UnknownIntegration(_) => ApiError::NotFound(err.to_string()),
            PipelineError::InvalidRequest(msg) => ApiError::UnprocessableEntity(msg),
            PipelineError::Routing(e) => e.into(),
            PipelineError::Maintenance(e) => e.into(),
            PipelineError::Persistence(e) => e.into(),
            PipelineError::Unavailable => ApiError::ServiceUnavailable(err.to_string()),
            PipelineError::Grouping(_) => ApiError::InternalServerError(err.to_string()),
        }
    }
}

/// Implements the conversion from `ApiError` into an `axum` response.
///
/// This is the central point for mapping internal application errors to
/// user-facing HTTP responses.
impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self {
            ApiError::Unauthorized =>
                (StatusCode::UNAUTHORIZED, json!({ "error": "Unauthorized" })),
            ApiError::InternalServerError(err) => {
                tracing::error!("Internal server error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "An internal server error occurred" }),
                )
            }
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, json!({ "error": message })),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
            ApiError::UnprocessableEntity(message) =>
                (StatusCode::UNPROCESSABLE_ENTITY, json!({ "error": message })),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, json!({ "error": message })),
            ApiError::ServiceUnavailable(message) =>
                (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": message })),
        };

        (status, Json(body)).into_response()
    }
}
