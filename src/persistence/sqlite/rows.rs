//! Raw row shapes and their conversion into domain models.

use sqlx::FromRow;

use super::{from_millis, opt_from_millis};
use crate::{
    models::{
        Alert, AlertGroup, AlertGroupStatus, EscalationChain, EscalationState, HeartbeatConfig,
        Integration, MaintenanceMode, MaintenanceWindow, RoutingRule, TimelineEntry,
    },
    persistence::error::PersistenceError,
};

#[derive(Debug, FromRow)]
pub(super) struct IntegrationRow {
    integration_id: i64,
    name: String,
    grouping_template: Option<String>,
    acknowledge_condition: Option<String>,
    resolve_condition: Option<String>,
    created_at: i64,
    deleted_at: Option<i64>,
}

impl TryFrom<IntegrationRow> for Integration {
    type Error = PersistenceError;

    fn try_from(row: IntegrationRow) -> Result<Self, Self::Error> {
        Ok(Integration {
            id: row.integration_id,
            name: row.name,
            grouping_template: row.grouping_template,
            acknowledge_condition: row.acknowledge_condition,
            resolve_condition: row.resolve_condition,
            created_at: from_millis(row.created_at)?,
            deleted_at: opt_from_millis(row.deleted_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct RoutingRuleRow {
    rule_id: i64,
    integration_id: i64,
    position: i64,
    filter: String,
    escalation_chain_id: Option<i64>,
    chat_destinations: String,
}

impl TryFrom<RoutingRuleRow> for RoutingRule {
    type Error = PersistenceError;

    fn try_from(row: RoutingRuleRow) -> Result<Self, Self::Error> {
        Ok(RoutingRule {
            id: row.rule_id,
            integration_id: row.integration_id,
            position: u32::try_from(row.position).map_err(|_| {
                PersistenceError::SerializationError(format!(
                    "rule {} has invalid position {}",
                    row.rule_id, row.position
                ))
            })?,
            filter: serde_json::from_str(&row.filter)?,
            escalation_chain_id: row.escalation_chain_id,
            chat_destinations: serde_json::from_str(&row.chat_destinations)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct EscalationChainRow {
    chain_id: i64,
    name: String,
    steps: String,
    ephemeral: bool,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<EscalationChainRow> for EscalationChain {
    type Error = PersistenceError;

    fn try_from(row: EscalationChainRow) -> Result<Self, Self::Error> {
        Ok(EscalationChain {
            id: row.chain_id,
            name: row.name,
            steps: serde_json::from_str(&row.steps)?,
            ephemeral: row.ephemeral,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct AlertGroupRow {
    alert_group_id: i64,
    integration_id: i64,
    matched_rule_id: Option<i64>,
    escalation_chain_id: Option<i64>,
    grouping_key: String,
    status: String,
    labels: String,
    created_at: i64,
    acknowledged_at: Option<i64>,
    resolved_at: Option<i64>,
    silenced_until: Option<i64>,
    root_alert_group_id: Option<i64>,
}

impl TryFrom<AlertGroupRow> for AlertGroup {
    type Error = PersistenceError;

    fn try_from(row: AlertGroupRow) -> Result<Self, Self::Error> {
        Ok(AlertGroup {
            id: row.alert_group_id,
            integration_id: row.integration_id,
            matched_rule_id: row.matched_rule_id,
            escalation_chain_id: row.escalation_chain_id,
            grouping_key: row.grouping_key,
            status: row
                .status
                .parse::<AlertGroupStatus>()
                .map_err(PersistenceError::SerializationError)?,
            labels: serde_json::from_str(&row.labels)?,
            created_at: from_millis(row.created_at)?,
            acknowledged_at: opt_from_millis(row.acknowledged_at)?,
            resolved_at: opt_from_millis(row.resolved_at)?,
            silenced_until: opt_from_millis(row.silenced_until)?,
            root_alert_group_id: row.root_alert_group_id,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct AlertRow {
    alert_id: i64,
    alert_group_id: i64,
    integration_id: i64,
    payload: String,
    received_at: i64,
}

impl TryFrom<AlertRow> for Alert {
    type Error = PersistenceError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        Ok(Alert {
            id: row.alert_id,
            integration_id: row.integration_id,
            alert_group_id: row.alert_group_id,
            payload: serde_json::from_str(&row.payload)?,
            received_at: from_millis(row.received_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct TimelineRow {
    entry_id: i64,
    alert_group_id: i64,
    event: String,
    created_at: i64,
}

impl TryFrom<TimelineRow> for TimelineEntry {
    type Error = PersistenceError;

    fn try_from(row: TimelineRow) -> Result<Self, Self::Error> {
        Ok(TimelineEntry {
            id: row.entry_id,
            alert_group_id: row.alert_group_id,
            event: serde_json::from_str(&row.event)?,
            created_at: from_millis(row.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct EscalationStateRow {
    alert_group_id: i64,
    next_step: i64,
    repeat_count: i64,
    wake_at: Option<i64>,
    finished: bool,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
}

impl TryFrom<EscalationStateRow> for EscalationState {
    type Error = PersistenceError;

    fn try_from(row: EscalationStateRow) -> Result<Self, Self::Error> {
        let invalid = |field: &str, value: i64| {
            PersistenceError::SerializationError(format!(
                "escalation state {} has invalid {field} {value}",
                row.alert_group_id
            ))
        };
        Ok(EscalationState {
            alert_group_id: row.alert_group_id,
            next_step: usize::try_from(row.next_step)
                .map_err(|_| invalid("next_step", row.next_step))?,
            repeat_count: u32::try_from(row.repeat_count)
                .map_err(|_| invalid("repeat_count", row.repeat_count))?,
            wake_at: opt_from_millis(row.wake_at)?,
            finished: row.finished,
            lease_owner: row.lease_owner,
            lease_expires_at: opt_from_millis(row.lease_expires_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct MaintenanceWindowRow {
    integration_id: i64,
    mode: String,
    started_at: i64,
    expires_at: i64,
}

impl TryFrom<MaintenanceWindowRow> for MaintenanceWindow {
    type Error = PersistenceError;

    fn try_from(row: MaintenanceWindowRow) -> Result<Self, Self::Error> {
        Ok(MaintenanceWindow {
            integration_id: row.integration_id,
            mode: row.mode.parse::<MaintenanceMode>().map_err(PersistenceError::SerializationError)?,
            started_at: from_millis(row.started_at)?,
            expires_at: from_millis(row.expires_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct HeartbeatRow {
    integration_id: i64,
    interval_seconds: i64,
    last_seen_at: i64,
    alerted: bool,
    alert_group_id: Option<i64>,
}

impl TryFrom<HeartbeatRow> for HeartbeatConfig {
    type Error = PersistenceError;

    fn try_from(row: HeartbeatRow) -> Result<Self, Self::Error> {
        Ok(HeartbeatConfig {
            integration_id: row.integration_id,
            interval_seconds: u64::try_from(row.interval_seconds).map_err(|_| {
                PersistenceError::SerializationError(format!(
                    "heartbeat {} has invalid interval {}",
                    row.integration_id, row.interval_seconds
                ))
            })?,
            last_seen_at: from_millis(row.last_seen_at)?,
            alerted: row.alerted,
            alert_group_id: row.alert_group_id,
        })
    }
}

/// Converts a batch of rows, failing on the first bad one.
pub(super) fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, PersistenceError>
where
    T: TryFrom<R, Error = PersistenceError>,
{
    rows.into_iter().map(T::try_from).collect()
}
