//! Repository interfaces of the engine.
//!
//! [`AppRepository`] holds configuration-owned records (integrations, routes,
//! chains, policies, maintenance windows, heartbeats); [`AlertStore`] holds
//! the runtime records (alerts, groups, timeline, escalation cursors and
//! leases). [`StateRepository`] is the combination the services depend on.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    models::{
        Alert, AlertGroup, AlertGroupFilter, EscalationChain, EscalationChainConfig,
        EscalationState, HeartbeatConfig, Integration, MaintenanceMode, MaintenanceWindow,
        NewIntegration, NewRoutingRule, NotificationPolicy, RoutingRule, TimelineEntry,
        TimelineEvent,
        alert_group::{StatusUpdate, Transition},
    },
    persistence::error::PersistenceError,
};

/// Everything needed to bind one alert to a group atomically.
#[derive(Debug, Clone)]
pub struct GroupingRequest {
    /// Source integration.
    pub integration_id: i64,
    /// Rendered grouping key.
    pub grouping_key: String,
    /// Rule matched by the alert.
    pub matched_rule_id: Option<i64>,
    /// Chain bound to a newly created group.
    pub escalation_chain_id: Option<i64>,
    /// Raw payload.
    pub payload: Value,
    /// Labels stored on a newly created group.
    pub labels: BTreeMap<String, String>,
    /// Receipt time.
    pub received_at: DateTime<Utc>,
    /// Open groups created before this instant no longer accept alerts.
    pub open_since: DateTime<Utc>,
    /// Always create a new group, closed for grouping.
    pub force_new: bool,
    /// Maintenance mode recorded on a newly created group.
    pub maintenance: Option<MaintenanceMode>,
}

/// Result of [`AlertStore::group_alert`].
#[derive(Debug, Clone)]
pub struct GroupedAlert {
    /// The stored alert.
    pub alert: Alert,
    /// The group it was bound to.
    pub alert_group: AlertGroup,
    /// Whether the group was created by this call.
    pub created: bool,
}

/// Cursor update committed together with a `StepCompleted` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCommit {
    /// Index of the executed step; must equal the persisted cursor.
    pub step_index: usize,
    /// New cursor.
    pub next_step: usize,
    /// New repeat counter.
    pub repeat_count: u32,
    /// Parking deadline.
    pub wake_at: Option<DateTime<Utc>>,
    /// The chain is done.
    pub finished: bool,
}

/// Configuration-owned records.
#[async_trait]
pub trait AppRepository: Send + Sync {
    /// Creates an integration and its default routing rule.
    async fn create_integration(
        &self,
        integration: &NewIntegration,
        default_chain_id: Option<i64>,
        default_destinations: &[String],
        now: DateTime<Utc>,
    ) -> Result<Integration, PersistenceError>;

    /// Updates the templates of an active integration.
    async fn update_integration(
        &self,
        integration_id: i64,
        integration: &NewIntegration,
    ) -> Result<Integration, PersistenceError>;

    /// Fetches an integration, deleted or not.
    async fn get_integration(
        &self,
        integration_id: i64,
    ) -> Result<Option<Integration>, PersistenceError>;

    /// Fetches an active integration by name.
    async fn get_active_integration_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Integration>, PersistenceError>;

    /// Lists active integrations.
    async fn list_integrations(&self) -> Result<Vec<Integration>, PersistenceError>;

    /// Soft-deletes an integration and drops its heartbeat and maintenance
    /// window.
    async fn delete_integration(
        &self,
        integration_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    /// Lists an integration's rules by position.
    async fn list_routing_rules(
        &self,
        integration_id: i64,
    ) -> Result<Vec<RoutingRule>, PersistenceError>;

    /// Lists the rules of every active integration.
    async fn list_all_routing_rules(&self) -> Result<Vec<RoutingRule>, PersistenceError>;

    /// Fetches one rule.
    async fn get_routing_rule(&self, rule_id: i64)
    -> Result<Option<RoutingRule>, PersistenceError>;

    /// Inserts a rule before the default rule, at `position` if given
    /// (clamped), shifting later rules.
    async fn insert_routing_rule(
        &self,
        integration_id: i64,
        rule: &NewRoutingRule,
        position: Option<u32>,
    ) -> Result<RoutingRule, PersistenceError>;

    /// Replaces a rule's filter, chain and destinations.
    async fn update_routing_rule(
        &self,
        rule_id: i64,
        rule: &NewRoutingRule,
    ) -> Result<RoutingRule, PersistenceError>;

    /// Deletes a non-default rule and re-densifies positions.
    async fn delete_routing_rule(&self, rule_id: i64) -> Result<RoutingRule, PersistenceError>;

    /// Moves a rule from `from` to `to`, failing with
    /// [`PersistenceError::Conflict`] when the persisted positions differ from
    /// the caller's view.
    async fn move_routing_rule(
        &self,
        rule_id: i64,
        from: u32,
        to: u32,
        expected_rule_at_to: Option<i64>,
    ) -> Result<RoutingRule, PersistenceError>;

    /// Replaces every rule of an integration (config reload).
    async fn replace_routing_rules(
        &self,
        integration_id: i64,
        rules: &[NewRoutingRule],
        default_chain_id: Option<i64>,
        default_destinations: &[String],
    ) -> Result<Vec<RoutingRule>, PersistenceError>;

    /// Creates a chain.
    async fn create_escalation_chain(
        &self,
        chain: &EscalationChainConfig,
        ephemeral: bool,
        now: DateTime<Utc>,
    ) -> Result<EscalationChain, PersistenceError>;

    /// Replaces a chain's name and steps.
    async fn update_escalation_chain(
        &self,
        chain_id: i64,
        chain: &EscalationChainConfig,
        now: DateTime<Utc>,
    ) -> Result<EscalationChain, PersistenceError>;

    /// Fetches a chain, ephemeral or not.
    async fn get_escalation_chain(
        &self,
        chain_id: i64,
    ) -> Result<Option<EscalationChain>, PersistenceError>;

    /// Fetches a non-ephemeral chain by name.
    async fn get_escalation_chain_by_name(
        &self,
        name: &str,
    ) -> Result<Option<EscalationChain>, PersistenceError>;

    /// Lists non-ephemeral chains.
    async fn list_escalation_chains(&self) -> Result<Vec<EscalationChain>, PersistenceError>;

    /// Deletes a chain no rule references.
    async fn delete_escalation_chain(&self, chain_id: i64) -> Result<(), PersistenceError>;

    /// Returns the round-robin counter of a chain step and advances it.
    async fn advance_round_robin(
        &self,
        chain_id: i64,
        step_index: usize,
    ) -> Result<u64, PersistenceError>;

    /// Fetches a user's notification policy.
    async fn get_notification_policy(
        &self,
        user_id: &str,
    ) -> Result<Option<NotificationPolicy>, PersistenceError>;

    /// Stores a user's notification policy.
    async fn upsert_notification_policy(
        &self,
        policy: &NotificationPolicy,
    ) -> Result<(), PersistenceError>;

    /// Fetches the window of an integration, expired or not.
    async fn get_maintenance_window(
        &self,
        integration_id: i64,
    ) -> Result<Option<MaintenanceWindow>, PersistenceError>;

    /// Stores a window, replacing any existing one.
    async fn upsert_maintenance_window(
        &self,
        window: &MaintenanceWindow,
    ) -> Result<(), PersistenceError>;

    /// Deletes the window of an integration. With `expires_at`, only a window
    /// with exactly that deadline is deleted.
    async fn delete_maintenance_window(
        &self,
        integration_id: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, PersistenceError>;

    /// Lists all persisted windows.
    async fn list_maintenance_windows(&self) -> Result<Vec<MaintenanceWindow>, PersistenceError>;

    /// Configures a heartbeat. A new heartbeat starts as seen at `now`.
    async fn upsert_heartbeat(
        &self,
        integration_id: i64,
        interval_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatConfig, PersistenceError>;

    /// Fetches a heartbeat.
    async fn get_heartbeat(
        &self,
        integration_id: i64,
    ) -> Result<Option<HeartbeatConfig>, PersistenceError>;

    /// Lists heartbeats of active integrations.
    async fn list_heartbeats(&self) -> Result<Vec<HeartbeatConfig>, PersistenceError>;

    /// Records a ping, closing any open episode. Returns the state before the
    /// ping.
    async fn record_heartbeat_ping(
        &self,
        integration_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<HeartbeatConfig>, PersistenceError>;

    /// Opens an episode if none is open and no ping arrived since
    /// `last_seen_at`.
    async fn open_heartbeat_episode(
        &self,
        integration_id: i64,
        last_seen_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Records the group raised for the open episode.
    async fn set_heartbeat_episode_group(
        &self,
        integration_id: i64,
        alert_group_id: i64,
    ) -> Result<bool, PersistenceError>;

    /// Closes an open episode that never got a group, so the next sweep can
    /// raise it again.
    async fn abandon_heartbeat_episode(&self, integration_id: i64) -> Result<bool, PersistenceError>;

    /// Removes a heartbeat.
    async fn delete_heartbeat(&self, integration_id: i64) -> Result<bool, PersistenceError>;
}

/// Runtime records.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Stores an alert and binds it to an open group or a new one, in one
    /// transaction. Fails with [`PersistenceError::Conflict`] when the
    /// database stayed locked by other writers past the busy timeout.
    async fn group_alert(&self, request: &GroupingRequest)
    -> Result<GroupedAlert, PersistenceError>;

    /// Fetches a group.
    async fn get_alert_group(
        &self,
        alert_group_id: i64,
    ) -> Result<Option<AlertGroup>, PersistenceError>;

    /// Lists groups, newest first.
    async fn list_alert_groups(
        &self,
        filter: &AlertGroupFilter,
    ) -> Result<Vec<AlertGroup>, PersistenceError>;

    /// Alerts of a group in receipt order.
    async fn alerts_for_group(&self, alert_group_id: i64) -> Result<Vec<Alert>, PersistenceError>;

    /// Timeline of a group in insertion order.
    async fn timeline(&self, alert_group_id: i64) -> Result<Vec<TimelineEntry>, PersistenceError>;

    /// Appends a timeline entry.
    async fn append_timeline(
        &self,
        alert_group_id: i64,
        event: &TimelineEvent,
        at: DateTime<Utc>,
    ) -> Result<TimelineEntry, PersistenceError>;

    /// Applies a status transition if the group is still in `transition.from`,
    /// together with its escalation effect and timeline entry. Returns false
    /// when the status changed concurrently.
    async fn apply_transition(
        &self,
        alert_group_id: i64,
        transition: &Transition,
        update: &StatusUpdate,
        event: &TimelineEvent,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Attaches a group to `root` unless the group is already attached, has
    /// dependents, or `root` is itself attached.
    async fn attach_alert_group(
        &self,
        alert_group_id: i64,
        root_alert_group_id: i64,
        event: &TimelineEvent,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Detaches a group currently attached to `root`.
    async fn detach_alert_group(
        &self,
        alert_group_id: i64,
        root_alert_group_id: i64,
        event: &TimelineEvent,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Fetches the escalation cursor of a group.
    async fn escalation_state(
        &self,
        alert_group_id: i64,
    ) -> Result<Option<EscalationState>, PersistenceError>;

    /// Takes the run lease if it is free or expired.
    async fn try_acquire_lease(
        &self,
        alert_group_id: i64,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Extends a held lease.
    async fn renew_lease(
        &self,
        alert_group_id: i64,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Releases a held lease.
    async fn release_lease(&self, alert_group_id: i64, owner: &str)
    -> Result<(), PersistenceError>;

    /// Commits one executed step and its timeline entry. Returns false when
    /// the lease was lost or the cursor moved.
    async fn commit_step(
        &self,
        alert_group_id: i64,
        owner: &str,
        commit: &StepCommit,
        event: &TimelineEvent,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Marks the escalation finished with a final timeline entry. With an
    /// owner, only while that lease is held.
    async fn finish_escalation(
        &self,
        alert_group_id: i64,
        owner: Option<&str>,
        event: &TimelineEvent,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Parks a leased run until `until` without advancing the cursor.
    async fn park_escalation(
        &self,
        alert_group_id: i64,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Parks a leased run behind a suppress window until `until`. Unlike
    /// [`Self::park_escalation`], the hold can be released before `until`.
    async fn hold_escalation(
        &self,
        alert_group_id: i64,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Clears and returns the held runs of an integration's groups.
    async fn release_maintenance_holds(&self, integration_id: i64) -> Result<Vec<i64>, PersistenceError>;

    /// Clears and returns every deadline at or before `now`.
    async fn take_due_wakeups(&self, now: DateTime<Utc>) -> Result<Vec<i64>, PersistenceError>;

    /// Silenced groups whose silence ended at or before `now`.
    async fn expired_silences(&self, now: DateTime<Utc>) -> Result<Vec<i64>, PersistenceError>;

    /// Frees and returns every lease that expired at or before `now`.
    async fn reclaim_expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, PersistenceError>;

    /// Firing, unattached groups with an unfinished, unparked escalation.
    async fn resumable_alert_groups(&self) -> Result<Vec<i64>, PersistenceError>;
}

/// The full repository the engine runs on.
#[async_trait]
pub trait StateRepository: AppRepository + AlertStore {
    /// Ensures all pending writes are flushed to disk.
    async fn flush(&self) -> Result<(), PersistenceError>;

    /// Performs any necessary cleanup operations before shutdown.
    async fn cleanup(&self) -> Result<(), PersistenceError>;
}
