//! `GET /status`: version, uptime, engine counters and active maintenance.

use axum::{extract::State, response::Json};
use serde::Serialize;

use super::{ApiError, ApiState};
use crate::context::MetricsSnapshot;

/// Body of `GET /status`.
#[derive(Debug, Serialize, Clone)]
pub struct StatusResponse {
    /// Crate version.
    pub version: &'static str,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Integrations currently inside a maintenance window.
    pub maintenance_windows: usize,
    /// Engine counters.
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
}

/// Reports version, uptime and engine counters.
pub async fn status(State(state): State<ApiState>) -> Result<Json<StatusResponse>, ApiError> {
    let now = state.clock.now();
    let maintenance_windows = state
        .repo
        .list_maintenance_windows()
        .await?
        .iter()
        .filter(|window| window.is_active(now))
        .count();

    let metrics = &state.metrics.metrics;
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: metrics.start_time.elapsed().as_secs(),
        maintenance_windows,
        counters: metrics.snapshot(),
    }))
}
