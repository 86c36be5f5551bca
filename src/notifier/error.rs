//! Error types for the outbound adapters.

use thiserror::Error;

use crate::http_client::HttpClientPoolError;

/// Errors raised by notifiers, webhook dispatchers and on-call resolvers.
#[derive(Debug, Error)]
pub enum NotifierError {
    /// The webhook id is not configured.
    #[error("Unknown webhook: {0}")]
    UnknownWebhook(String),

    /// The schedule id is not configured.
    #[error("Unknown schedule: {0}")]
    UnknownSchedule(String),

    /// The team id is not configured.
    #[error("Unknown team: {0}")]
    UnknownTeam(String),

    /// An error originating from the HTTP client pool.
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] HttpClientPoolError),

    /// An error from the underlying `reqwest` client.
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    /// An error from the retrying client.
    #[error("Request error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    /// The remote end answered with a non-success status.
    #[error("Remote returned {0}")]
    Status(reqwest::StatusCode),
}
