use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::{
    BaseHttpClientConfig, deserialize_duration_from_ms, deserialize_duration_from_seconds,
    serialize_duration_to_ms, serialize_duration_to_seconds,
};

fn default_executor_concurrency() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_delivery_timeout() -> Duration {
    Duration::from_millis(10_000)
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(5_000)
}

fn default_lookback() -> Duration {
    Duration::from_secs(86_400)
}

fn default_grouping_retries() -> u32 {
    5
}

fn default_grouping_backoff() -> Duration {
    Duration::from_millis(25)
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(1_000)
}

fn default_max_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

/// Escalation executor settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ExecutorConfig {
    /// Maximum concurrent escalation runs.
    #[serde(default = "default_executor_concurrency")]
    pub concurrency: usize,

    /// Capacity of the escalation request queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a run lease is valid without renewal.
    #[serde(
        default = "default_lease_ttl",
        deserialize_with = "deserialize_duration_from_seconds",
        serialize_with = "serialize_duration_to_seconds"
    )]
    pub lease_ttl_secs: Duration,

    /// Bound on a single `deliver` call.
    #[serde(
        default = "default_delivery_timeout",
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub delivery_timeout_ms: Duration,

    /// Delay before a run aborted by a storage failure is retried.
    #[serde(
        default = "default_retry_delay",
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub retry_delay_ms: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_executor_concurrency(),
            queue_capacity: default_queue_capacity(),
            lease_ttl_secs: default_lease_ttl(),
            delivery_timeout_ms: default_delivery_timeout(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

/// Alert grouping settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GroupingConfig {
    /// Groups older than this stop accepting new alerts.
    #[serde(
        default = "default_lookback",
        deserialize_with = "deserialize_duration_from_seconds",
        serialize_with = "serialize_duration_to_seconds"
    )]
    pub lookback_secs: Duration,

    /// Retries while the database is busy.
    #[serde(default = "default_grouping_retries")]
    pub max_retries: u32,

    /// First retry delay. Doubles per attempt, with jitter.
    #[serde(
        default = "default_grouping_backoff",
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub retry_backoff_ms: Duration,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            lookback_secs: default_lookback(),
            max_retries: default_grouping_retries(),
            retry_backoff_ms: default_grouping_backoff(),
        }
    }
}

/// Escalation scheduler settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SchedulerConfig {
    /// Interval of the deadline sweep.
    #[serde(
        default = "default_tick_interval",
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub tick_interval_ms: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_interval_ms: default_tick_interval() }
    }
}

/// Heartbeat monitor settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HeartbeatMonitorConfig {
    /// Upper bound on the sweep interval.
    #[serde(
        default = "default_max_sweep_interval",
        deserialize_with = "deserialize_duration_from_seconds",
        serialize_with = "serialize_duration_to_seconds"
    )]
    pub max_sweep_interval_secs: Duration,
}

impl Default for HeartbeatMonitorConfig {
    fn default() -> Self {
        Self { max_sweep_interval_secs: default_max_sweep_interval() }
    }
}

/// Outbound notification settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct NotifierConfig {
    /// Relay that receives notification envelopes. Notifications are only
    /// logged when unset.
    #[serde(default)]
    pub relay_url: Option<Url>,

    /// Connection settings for outgoing HTTP clients.
    #[serde(default)]
    pub http_base: BaseHttpClientConfig,
}
