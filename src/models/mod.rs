//! This module contains the data models for the Beacon engine.

pub mod alert;
pub mod alert_group;
pub mod escalation;
pub mod heartbeat;
pub mod integration;
pub mod maintenance;
pub mod on_call;
pub mod paging;
pub mod routing_rule;
pub mod timeline;
pub mod webhook;

pub use alert::Alert;
pub use alert_group::{AlertGroup, AlertGroupFilter, AlertGroupStatus, GroupAction};
pub use escalation::{
    EscalationChain, EscalationChainConfig, EscalationState, EscalationStep, NotificationPolicy,
    NotificationTier, UtcTimeRange,
};
pub use heartbeat::HeartbeatConfig;
pub use integration::{Integration, IntegrationConfig, NewIntegration};
pub use maintenance::{MaintenanceDecision, MaintenanceMode, MaintenanceWindow};
pub use routing_rule::{NewRoutingRule, RouteFilter, RoutingRule};
pub use timeline::{Actor, TimelineEntry, TimelineEvent};
