//! Outgoing webhooks as declared in `webhooks.yaml`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{
    config::HttpRetryConfig,
    loader::{Loadable, LoaderError},
};

/// An outgoing webhook target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookConfig {
    /// External webhook id referenced by `TriggerWebhook` steps.
    pub id: String,
    /// Target URL.
    pub url: Url,
    /// Extra request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Retry policy for this target.
    #[serde(default)]
    pub retry_policy: HttpRetryConfig,
}

/// Errors raised while validating webhooks.
#[derive(Debug, Error)]
pub enum WebhookConfigError {
    /// The file could not be loaded.
    #[error("Failed to load webhooks: {0}")]
    Loader(#[from] LoaderError),

    /// The webhook has no id.
    #[error("Webhook id must not be empty")]
    EmptyId,

    /// The URL scheme is not HTTP(S).
    #[error("Webhook '{0}' must use http or https")]
    UnsupportedScheme(String),
}

impl Loadable for WebhookConfig {
    type Error = WebhookConfigError;

    const KEY: &'static str = "webhooks";

    fn validate(&mut self) -> Result<(), Self::Error> {
        if self.id.trim().is_empty() {
            return Err(WebhookConfigError::EmptyId);
        }
        if !matches!(self.url.scheme(), "http" | "https") {
            return Err(WebhookConfigError::UnsupportedScheme(self.id.clone()));
        }
        Ok(())
    }
}
