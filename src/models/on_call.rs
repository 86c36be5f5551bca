//! Static on-call schedules and teams as declared in `schedules.yaml`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    loader::{Loadable, LoaderError},
    models::escalation::UtcTimeRange,
};

/// Users on call during a daily window. A layer without a window covers the
/// whole day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleLayer {
    /// On-call users.
    pub users: Vec<String>,
    /// Daily UTC window.
    #[serde(default)]
    pub window: Option<UtcTimeRange>,
}

/// An on-call schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// External schedule id.
    pub id: String,
    /// Layers, all of which apply at once.
    #[serde(default)]
    pub layers: Vec<ScheduleLayer>,
}

/// A team.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeamConfig {
    /// External team id.
    pub id: String,
    /// Members.
    #[serde(default)]
    pub members: Vec<String>,
}

/// Errors raised while validating schedules and teams.
#[derive(Debug, Error)]
pub enum OnCallConfigError {
    /// The file could not be loaded.
    #[error("Failed to load on-call configuration: {0}")]
    Loader(#[from] LoaderError),

    /// An entry has no id.
    #[error("Schedule and team ids must not be empty")]
    EmptyId,
}

impl Loadable for ScheduleConfig {
    type Error = OnCallConfigError;

    const KEY: &'static str = "schedules";

    fn validate(&mut self) -> Result<(), Self::Error> {
        if self.id.trim().is_empty() {
            return Err(OnCallConfigError::EmptyId);
        }
        Ok(())
    }
}

impl Loadable for TeamConfig {
    type Error = OnCallConfigError;

    const KEY: &'static str = "teams";

    fn validate(&mut self) -> Result<(), Self::Error> {
        if self.id.trim().is_empty() {
            return Err(OnCallConfigError::EmptyId);
        }
        Ok(())
    }
}
