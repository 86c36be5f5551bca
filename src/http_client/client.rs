//! Retry layer for outbound webhook calls.

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{Jitter, RetryTransientMiddleware, policies::ExponentialBackoff};

use crate::config::{HttpRetryConfig, JitterSetting};

impl From<JitterSetting> for Jitter {
    fn from(setting: JitterSetting) -> Self {
        match setting {
            JitterSetting::None => Jitter::None,
            JitterSetting::Full => Jitter::Full,
        }
    }
}

/// The backoff schedule a webhook's `retry_policy` describes.
pub fn backoff_policy(retry_policy: &HttpRetryConfig) -> ExponentialBackoff {
    ExponentialBackoff::builder()
        .jitter(retry_policy.jitter.into())
        .base(retry_policy.base_for_backoff)
        .retry_bounds(retry_policy.initial_backoff_ms, retry_policy.max_backoff_secs)
        .build_with_max_retries(retry_policy.max_retries)
}

/// Wraps `base_client` so transient failures (connect errors, timeouts,
/// 5xx and 429 responses) are retried on `retry_policy`'s schedule.
pub fn retrying_client(
    retry_policy: &HttpRetryConfig,
    base_client: reqwest::Client,
) -> ClientWithMiddleware {
    ClientBuilder::new(base_client)
        .with(RetryTransientMiddleware::new_with_policy(backoff_policy(retry_policy)))
        .build()
}
