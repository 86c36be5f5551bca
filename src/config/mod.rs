//! Configuration module for Beacon.

mod app_config;
mod engine;
mod helpers;
mod http_base;
mod http_retry;
mod server;

pub use app_config::AppConfig;
pub use engine::{
    ExecutorConfig, GroupingConfig, HeartbeatMonitorConfig, NotifierConfig, SchedulerConfig,
};
pub use helpers::{
    deserialize_duration_from_ms, deserialize_duration_from_seconds, serialize_duration_to_ms,
    serialize_duration_to_seconds,
};
pub use http_base::BaseHttpClientConfig;
pub use http_retry::{HttpRetryConfig, JitterSetting};
pub use server::ServerConfig;
