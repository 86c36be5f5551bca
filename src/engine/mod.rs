//! The Beacon engine: grouping, the alert group state machine, escalation,
//! maintenance, heartbeats and the background loops that drive them.

pub mod actions;
pub mod executor;
pub mod grouping;
pub mod heartbeat;
pub mod maintenance;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod workers;

use std::sync::Arc;

use crate::{clock::Clock, context::AppMetrics, persistence::traits::StateRepository};

/// Handles shared by every engine service.
#[derive(Clone)]
pub struct EngineServices {
    /// Durable state.
    pub repo: Arc<dyn StateRepository>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Shared counters.
    pub metrics: AppMetrics,
    /// Escalation run requests.
    pub queue: Arc<dyn queue::EscalationQueue>,
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices").field("clock", &self.clock).finish_non_exhaustive()
    }
}
