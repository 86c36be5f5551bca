//! Outbound HTTP for webhooks: a retry layer and a client pool shared by
//! webhooks with the same retry policy.

mod client;
mod pool;

pub use client::{backoff_policy, retrying_client};
pub use pool::{HttpClientPool, HttpClientPoolError};
