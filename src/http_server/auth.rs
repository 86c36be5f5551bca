//! Bearer API-key guard for write endpoints.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::Response,
};

use super::{ApiState, error::ApiError};

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Rejects the request unless it carries `server.api_key` as a bearer token.
/// Without a configured key every request passes.
pub async fn auth(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(api_key) = state.config.server.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    match bearer_token(request.headers()) {
        Some(token) if token == api_key => Ok(next.run(request).await),
        presented => {
            tracing::debug!(
                method = %request.method(),
                path = %request.uri().path(),
                token_present = presented.is_some(),
                "Rejected unauthenticated write."
            );
            Err(ApiError::Unauthorized)
        }
    }
}
