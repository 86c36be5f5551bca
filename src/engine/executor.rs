//! The escalation executor walks an alert group's chain one committed step
//! at a time.

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::{
    EngineServices,
    actions::{ActionError, AlertGroupService},
    maintenance::{MaintenanceController, MaintenanceError},
};
use crate::{
    config::ExecutorConfig,
    models::{
        Actor, AlertGroup, AlertGroupStatus, EscalationChain, EscalationState, EscalationStep,
        GroupAction, MaintenanceDecision, NotificationTier, TimelineEvent,
        escalation::MAX_REPEAT_ESCALATIONS,
        timeline::{AttemptStatus, DeliveryAttempt, SkipReason, StepOutcome},
    },
    notifier::{
        DeliveryStatus, NotificationContent, Notifier, OnCallResolver, WebhookDispatcher,
        WebhookEvent,
    },
    persistence::{error::PersistenceError, traits::StepCommit},
};

/// Errors that abort a run.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The alert group does not exist.
    #[error("Alert group not found: {0}")]
    GroupNotFound(i64),

    /// Another owner took the lease over.
    #[error("Lease lost for alert group {0}")]
    LeaseLost(i64),

    /// Storage failure.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// The maintenance lookup failed.
    #[error("Maintenance error: {0}")]
    Maintenance(#[from] MaintenanceError),

    /// The resolve step failed.
    #[error("Action error: {0}")]
    Action(#[from] ActionError),
}

impl ExecutorError {
    /// Whether re-queueing the request can help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutorError::GroupNotFound(_) | ExecutorError::LeaseLost(_))
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run holds the lease; this request was coalesced into it.
    AlreadyRunning,
    /// The group has no chain.
    NoChain,
    /// Suppress maintenance vetoed the run until the window ends.
    Suppressed {
        /// End of the window.
        until: DateTime<Utc>,
    },
    /// The group is not escalating (not firing, attached, or finished).
    Stopped,
    /// The chain is waiting for a deadline.
    Parked {
        /// When the scheduler wakes the group.
        until: DateTime<Utc>,
    },
    /// Every step ran.
    Finished,
    /// A resolve step resolved the group.
    Resolved,
    /// The group became escalatable again while this run held the lease.
    /// The caller should request another run.
    Rerun,
}

/// Outbound adapters the executor talks to.
#[derive(Clone)]
pub struct Outbound {
    /// User notifications.
    pub notifier: Arc<dyn Notifier>,
    /// Webhook calls.
    pub webhooks: Arc<dyn WebhookDispatcher>,
    /// Schedule and team lookups.
    pub on_call: Arc<dyn OnCallResolver>,
}

/// What to do after a step is committed.
enum Flow {
    Continue,
    Park(DateTime<Utc>),
    Finish,
}

struct StepResult {
    outcome: StepOutcome,
    next_step: usize,
    repeat_count: u32,
    flow: Flow,
}

/// Everything a step needs to know about the run it belongs to.
struct RunContext<'a> {
    group: &'a AlertGroup,
    chain: &'a EscalationChain,
    decision: MaintenanceDecision,
    payload: &'a Value,
}

/// Runs escalation chains.
///
/// Only one run per alert group is active at a time: the run holds a lease
/// in the group's escalation state and renews it at every step boundary.
/// Every step commits its timeline entry and the advanced cursor together,
/// so a committed step never runs twice.
pub struct EscalationExecutor {
    worker_id: String,
    services: EngineServices,
    outbound: Outbound,
    maintenance: Arc<MaintenanceController>,
    actions: Arc<AlertGroupService>,
    config: ExecutorConfig,
    default_channel: String,
}

impl EscalationExecutor {
    /// Creates a new `EscalationExecutor`.
    pub fn new(
        services: EngineServices,
        outbound: Outbound,
        maintenance: Arc<MaintenanceController>,
        actions: Arc<AlertGroupService>,
        config: ExecutorConfig,
        default_channel: String,
    ) -> Self {
        Self {
            worker_id: format!("beacon-{}", Uuid::new_v4().simple()),
            services,
            outbound,
            maintenance,
            actions,
            config,
            default_channel,
        }
    }

    fn lease_ttl(&self) -> Duration {
        Duration::from_std(self.config.lease_ttl_secs).unwrap_or(Duration::MAX)
    }

    /// Runs the chain of one alert group from its persisted cursor.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn run(&self, alert_group_id: i64) -> Result<RunOutcome, ExecutorError> {
        let repo = &self.services.repo;
        let state =
            repo.escalation_state(alert_group_id).await?.ok_or(ExecutorError::GroupNotFound(alert_group_id))?;
        if state.finished {
            return Ok(RunOutcome::Stopped);
        }

        let owner = format!("{}:{}", self.worker_id, Uuid::new_v4());
        let now = self.services.clock.now();
        let expires_at = now.checked_add_signed(self.lease_ttl()).unwrap_or(DateTime::<Utc>::MAX_UTC);
        if !repo.try_acquire_lease(alert_group_id, &owner, now, expires_at).await? {
            tracing::debug!(alert_group_id, "Escalation already running; request coalesced.");
            return Ok(RunOutcome::AlreadyRunning);
        }
        self.services.metrics.metrics.escalation_run();

        let result = self.walk(alert_group_id, &owner).await;
        if let Err(e) = repo.release_lease(alert_group_id, &owner).await {
            tracing::warn!(alert_group_id, error = %e, "Failed to release escalation lease.");
        }

        match result {
            Ok(RunOutcome::Stopped) => {
                if self.is_escalatable(alert_group_id).await? {
                    tracing::debug!(alert_group_id, "Alert group resumed during the run; asking for a rerun.");
                    return Ok(RunOutcome::Rerun);
                }
                Ok(RunOutcome::Stopped)
            }
            Ok(outcome) => {
                tracing::debug!(alert_group_id, ?outcome, "Escalation run ended.");
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(alert_group_id, error = %e, "Escalation run aborted.");
                Err(e)
            }
        }
    }

    /// Firing, unattached, unfinished and not parked.
    async fn is_escalatable(&self, alert_group_id: i64) -> Result<bool, ExecutorError> {
        let repo = &self.services.repo;
        let (Some(group), Some(state)) =
            (repo.get_alert_group(alert_group_id).await?, repo.escalation_state(alert_group_id).await?)
        else {
            return Ok(false);
        };
        Ok(is_firing(&group) && !state.finished && state.wake_at.is_none())
    }

    async fn walk(&self, alert_group_id: i64, owner: &str) -> Result<RunOutcome, ExecutorError> {
        let repo = &self.services.repo;
        let group = self.load_group(alert_group_id).await?;
        if !is_firing(&group) {
            return Ok(RunOutcome::Stopped);
        }

        let (decision, window) = self.maintenance.gate(group.integration_id).await?;
        let mode = decision.mode();
        let chain = match group.escalation_chain_id {
            Some(chain_id) => repo.get_escalation_chain(chain_id).await?,
            None => None,
        };
        let Some(chain) = chain else {
            let event = TimelineEvent::EscalationSkipped { reason: SkipReason::NoChain, maintenance: mode };
            repo.finish_escalation(alert_group_id, Some(owner), &event, self.services.clock.now()).await?;
            tracing::info!(alert_group_id, "Alert group has no escalation chain.");
            return Ok(RunOutcome::NoChain);
        };

        if decision == MaintenanceDecision::Suppressed
            && let Some(window) = window
        {
            repo.hold_escalation(alert_group_id, owner, window.expires_at).await?;
            tracing::info!(alert_group_id, until = %window.expires_at, "Escalation held by suppress maintenance.");
            return Ok(RunOutcome::Suppressed { until: window.expires_at });
        }

        let payload = repo
            .alerts_for_group(alert_group_id)
            .await?
            .into_iter()
            .next()
            .map(|alert| alert.payload)
            .unwrap_or(Value::Null);

        loop {
            let now = self.services.clock.now();
            let state = repo.escalation_state(alert_group_id).await?.ok_or(ExecutorError::GroupNotFound(alert_group_id))?;
            if state.finished {
                return Ok(RunOutcome::Stopped);
            }
            if let Some(wake_at) = state.wake_at
                && wake_at > now
            {
                return Ok(RunOutcome::Parked { until: wake_at });
            }
            let group = self.load_group(alert_group_id).await?;
            if !is_firing(&group) {
                tracing::debug!(alert_group_id, status = %group.status, "Alert group stopped escalating.");
                return Ok(RunOutcome::Stopped);
            }

            let expires_at = now.checked_add_signed(self.lease_ttl()).unwrap_or(DateTime::<Utc>::MAX_UTC);
            if !repo.renew_lease(alert_group_id, owner, expires_at).await? {
                return Err(ExecutorError::LeaseLost(alert_group_id));
            }

            let step_index = state.next_step;
            let Some(step) = chain.steps.get(step_index) else {
                repo.finish_escalation(alert_group_id, Some(owner), &TimelineEvent::EscalationFinished, now).await?;
                tracing::info!(alert_group_id, "Escalation chain finished.");
                return Ok(RunOutcome::Finished);
            };

            let ctx = RunContext { group: &group, chain: &chain, decision, payload: &payload };
            let result = self.execute_step(&ctx, step_index, step, &state, now).await?;
            tracing::info!(alert_group_id, step_index, step = step.kind(), "Escalation step completed.");

            let (wake_at, finished) = match result.flow {
                Flow::Continue => (None, false),
                Flow::Park(until) => (Some(until), false),
                Flow::Finish => (None, true),
            };
            let commit = StepCommit {
                step_index,
                next_step: result.next_step,
                repeat_count: result.repeat_count,
                wake_at,
                finished,
            };
            let event = TimelineEvent::StepCompleted { step_index, outcome: result.outcome, maintenance: mode };
            if !repo.commit_step(alert_group_id, owner, &commit, &event, self.services.clock.now()).await? {
                // Restarted or taken over while the step ran.
                tracing::debug!(alert_group_id, step_index, "Escalation cursor moved; step not committed.");
                return Ok(RunOutcome::Stopped);
            }

            match result.flow {
                Flow::Continue => {}
                Flow::Park(until) => return Ok(RunOutcome::Parked { until }),
                Flow::Finish => return Ok(RunOutcome::Resolved),
            }
        }
    }

    async fn load_group(&self, alert_group_id: i64) -> Result<AlertGroup, ExecutorError> {
        self.services
            .repo
            .get_alert_group(alert_group_id)
            .await?
            .ok_or(ExecutorError::GroupNotFound(alert_group_id))
    }

    async fn execute_step(
        &self,
        ctx: &RunContext<'_>,
        step_index: usize,
        step: &EscalationStep,
        state: &EscalationState,
        now: DateTime<Utc>,
    ) -> Result<StepResult, ExecutorError> {
        let next = |outcome| StepResult {
            outcome,
            next_step: step_index + 1,
            repeat_count: state.repeat_count,
            flow: Flow::Continue,
        };
        let debug = ctx.decision == MaintenanceDecision::DebugOnly;

        let result = match step {
            EscalationStep::NotifyUsers { user_ids, tier } => {
                let users: BTreeSet<String> = user_ids.iter().cloned().collect();
                next(self.notify(ctx, step_index, users, *tier).await?)
            }
            EscalationStep::NotifyOnCallSchedule { schedule_id, tier } => {
                match self.outbound.on_call.current_on_call(schedule_id, now).await {
                    Ok(users) => next(self.notify(ctx, step_index, users.into_iter().collect(), *tier).await?),
                    Err(e) => next(StepOutcome::RecipientLookupFailed { error: e.to_string() }),
                }
            }
            EscalationStep::NotifyTeam { team_id, tier } => {
                match self.outbound.on_call.team_members(team_id).await {
                    Ok(users) => next(self.notify(ctx, step_index, users.into_iter().collect(), *tier).await?),
                    Err(e) => next(StepOutcome::RecipientLookupFailed { error: e.to_string() }),
                }
            }
            EscalationStep::NotifyUsersRoundRobin { user_ids } => {
                let users: Vec<String> = user_ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
                if users.is_empty() {
                    next(StepOutcome::NoRecipients)
                } else {
                    let counter = self.services.repo.advance_round_robin(ctx.chain.id, step_index).await?;
                    let pick = usize::try_from(counter % users.len() as u64).unwrap_or_default();
                    let user = BTreeSet::from([users[pick].clone()]);
                    next(self.notify(ctx, step_index, user, NotificationTier::Default).await?)
                }
            }
            EscalationStep::WaitForTimeWindow { window } => {
                if window.contains(now) {
                    next(StepOutcome::TimeWindowPassed)
                } else {
                    let until = window.next_start_after(now);
                    StepResult { flow: Flow::Park(until), ..next(StepOutcome::Parked { until }) }
                }
            }
            EscalationStep::Wait { delay_secs } => {
                let delay = Duration::seconds(i64::try_from(*delay_secs).unwrap_or(i64::MAX));
                let until = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
                StepResult { flow: Flow::Park(until), ..next(StepOutcome::Parked { until }) }
            }
            EscalationStep::TriggerWebhook { webhook_id } => {
                if debug {
                    next(StepOutcome::WebhookSuppressed { webhook_id: webhook_id.clone() })
                } else {
                    let event = WebhookEvent {
                        alert_group_id: ctx.group.id,
                        integration_id: ctx.group.integration_id,
                        step_index,
                        payload: ctx.payload.clone(),
                        maintenance: ctx.decision.mode(),
                    };
                    match self.outbound.webhooks.dispatch(webhook_id, event).await {
                        Ok(()) => {
                            self.services.metrics.metrics.webhook_dispatched();
                            next(StepOutcome::WebhookDispatched { webhook_id: webhook_id.clone() })
                        }
                        Err(e) => next(StepOutcome::WebhookFailed {
                            webhook_id: webhook_id.clone(),
                            error: e.to_string(),
                        }),
                    }
                }
            }
            EscalationStep::Resolve => {
                if debug {
                    next(StepOutcome::ResolveSuppressed)
                } else {
                    self.actions.apply(ctx.group.id, GroupAction::Resolve, Actor::Escalation).await?;
                    StepResult { flow: Flow::Finish, ..next(StepOutcome::Resolved) }
                }
            }
            EscalationStep::RepeatEscalation => {
                if state.repeat_count < MAX_REPEAT_ESCALATIONS {
                    let repeat_count = state.repeat_count + 1;
                    StepResult {
                        outcome: StepOutcome::Repeated { repeat_count },
                        next_step: 0,
                        repeat_count,
                        flow: Flow::Continue,
                    }
                } else {
                    next(StepOutcome::RepeatLimitReached)
                }
            }
        };
        Ok(result)
    }

    /// Delivers to every recipient over every channel of their policy for
    /// `tier`.
    async fn notify(
        &self,
        ctx: &RunContext<'_>,
        step_index: usize,
        users: BTreeSet<String>,
        tier: NotificationTier,
    ) -> Result<StepOutcome, ExecutorError> {
        if users.is_empty() {
            return Ok(StepOutcome::NoRecipients);
        }
        let content = NotificationContent {
            alert_group_id: ctx.group.id,
            integration_id: ctx.group.integration_id,
            step_index,
            tier,
            payload: ctx.payload.clone(),
        };

        let mut attempts = Vec::new();
        for user_id in users {
            for channel in self.channels_for(&user_id, tier).await? {
                let attempt = if ctx.decision == MaintenanceDecision::DebugOnly {
                    DeliveryAttempt { user_id: user_id.clone(), channel, status: AttemptStatus::Suppressed, error: None }
                } else {
                    self.deliver(&user_id, channel, &content).await
                };
                attempts.push(attempt);
            }
        }
        Ok(StepOutcome::Notified { attempts })
    }

    async fn channels_for(&self, user_id: &str, tier: NotificationTier) -> Result<Vec<String>, ExecutorError> {
        let policy = self.services.repo.get_notification_policy(user_id).await?;
        let channels: Vec<String> = policy
            .map(|policy| {
                let entries = match policy.entries(tier) {
                    [] => policy.entries(NotificationTier::Default),
                    entries => entries,
                };
                entries.iter().map(|entry| entry.channel.clone()).collect()
            })
            .unwrap_or_default();
        if channels.is_empty() {
            return Ok(vec![self.default_channel.clone()]);
        }
        Ok(channels)
    }

    async fn deliver(&self, user_id: &str, channel: String, content: &NotificationContent) -> DeliveryAttempt {
        let delivery = self.outbound.notifier.deliver(user_id, &channel, content);
        let (status, error) = match tokio::time::timeout(self.config.delivery_timeout_ms, delivery).await {
            Ok(DeliveryStatus::Sent) => (AttemptStatus::Sent, None),
            Ok(DeliveryStatus::Failed(reason)) => (AttemptStatus::Failed, Some(reason)),
            Err(_) => (
                AttemptStatus::Failed,
                Some(format!("timed out after {} ms", self.config.delivery_timeout_ms.as_millis())),
            ),
        };
        self.services.metrics.metrics.notification(status == AttemptStatus::Sent);
        if let Some(error) = &error {
            tracing::warn!(alert_group_id = content.alert_group_id, user_id, channel, error, "Notification delivery failed.");
        }
        DeliveryAttempt { user_id: user_id.to_string(), channel, status, error }
    }
}

fn is_firing(group: &AlertGroup) -> bool {
    group.status == AlertGroupStatus::Firing && group.root_alert_group_id.is_none()
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::{NaiveTime, TimeZone};

    use super::*;
    use crate::{
        clock::Clock,
        models::{MaintenanceMode, NotificationPolicy, UtcTimeRange, escalation::PolicyEntry},
        notifier::{MockNotifier, NotifierError},
        persistence::traits::{AlertStore, AppRepository},
        test_helpers::{EngineHarness, RecordingNotifier},
    };

    fn users(ids: &[&str]) -> EscalationStep {
        EscalationStep::NotifyUsers {
            user_ids: ids.iter().map(|s| s.to_string()).collect(),
            tier: NotificationTier::Default,
        }
    }

    fn step_outcomes(timeline: &[crate::models::TimelineEntry]) -> Vec<(usize, StepOutcome)> {
        timeline
            .iter()
            .filter_map(|entry| match &entry.event {
                TimelineEvent::StepCompleted { step_index, outcome, .. } => Some((*step_index, outcome.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_walks_chain_to_the_end() {
        let h = EngineHarness::new().await;
        let group = h.group_with_chain(vec![users(&["alice", "bob"]), users(&["carol"])]).await;

        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Finished);

        let sent: Vec<String> = h.notifier.deliveries().into_iter().map(|d| d.user_id).collect();
        assert_eq!(sent, vec!["alice", "bob", "carol"]);
        let timeline = h.repo.timeline(group.id).await.unwrap();
        assert_eq!(step_outcomes(&timeline).len(), 2);
        assert_eq!(timeline.last().unwrap().event, TimelineEvent::EscalationFinished);

        let stored = h.repo.get_alert_group(group.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertGroupStatus::Firing);
        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Stopped);
    }

    #[tokio::test]
    async fn test_policy_channels_by_tier() {
        let h = EngineHarness::new().await;
        h.repo
            .upsert_notification_policy(&NotificationPolicy {
                user_id: "alice".into(),
                default: vec![PolicyEntry { channel: "push".into() }],
                important: vec![PolicyEntry { channel: "sms".into() }, PolicyEntry { channel: "phone".into() }],
            })
            .await
            .unwrap();
        let group = h
            .group_with_chain(vec![EscalationStep::NotifyUsers {
                user_ids: vec!["alice".into(), "zed".into()],
                tier: NotificationTier::Important,
            }])
            .await;

        h.executor.run(group.id).await.unwrap();
        let channels: Vec<(String, String)> =
            h.notifier.deliveries().into_iter().map(|d| (d.user_id, d.channel)).collect();
        assert_eq!(
            channels,
            vec![
                ("alice".to_string(), "sms".to_string()),
                ("alice".to_string(), "phone".to_string()),
                ("zed".to_string(), "push".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_time_window_parks_until_next_start() {
        let h = EngineHarness::new().await;
        h.clock.set(Utc.with_ymd_and_hms(2025, 3, 10, 20, 0, 0).unwrap());
        let window = UtcTimeRange::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        );
        let group = h
            .group_with_chain(vec![EscalationStep::WaitForTimeWindow { window }, users(&["alice"])])
            .await;

        let next_morning = Utc.with_ymd_and_hms(2025, 3, 11, 9, 0, 0).unwrap();
        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Parked { until: next_morning });
        assert!(h.notifier.deliveries().is_empty());
        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Parked { until: next_morning });

        h.clock.set(next_morning);
        assert_eq!(h.repo.take_due_wakeups(next_morning).await.unwrap(), vec![group.id]);
        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Finished);
        assert_eq!(h.notifier.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_is_bounded() {
        let h = EngineHarness::new().await;
        let group = h.group_with_chain(vec![users(&["alice"]), EscalationStep::RepeatEscalation]).await;

        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Finished);
        // One pass plus five repeats.
        assert_eq!(h.notifier.deliveries().len(), 6);
        let outcomes = step_outcomes(&h.repo.timeline(group.id).await.unwrap());
        assert_eq!(outcomes.last().unwrap().1, StepOutcome::RepeatLimitReached);
    }

    #[tokio::test]
    async fn test_round_robin_rotates_between_runs() {
        let h = EngineHarness::new().await;
        let chain = vec![EscalationStep::NotifyUsersRoundRobin { user_ids: vec!["bob".into(), "alice".into()] }];
        let chain = h.harness.create_chain("rr", chain).await;

        let mut picked = Vec::new();
        for key in ["a", "b", "c"] {
            let group = h.group_for_chain(chain.id, key).await;
            h.executor.run(group.id).await.unwrap();
            picked.push(h.notifier.deliveries().pop().unwrap().user_id);
        }
        assert_eq!(picked, vec!["alice", "bob", "alice"]);
    }

    #[tokio::test]
    async fn test_debug_maintenance_records_without_side_effects() {
        let h = EngineHarness::new().await;
        let group = h
            .group_with_chain(vec![
                users(&["alice"]),
                EscalationStep::TriggerWebhook { webhook_id: "ops".into() },
                EscalationStep::Resolve,
            ])
            .await;
        h.maintenance.start(group.integration_id, MaintenanceMode::Debug, StdDuration::from_secs(3600)).await.unwrap();

        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Finished);
        assert!(h.notifier.deliveries().is_empty());
        assert!(h.webhooks.events().is_empty());

        let outcomes = step_outcomes(&h.repo.timeline(group.id).await.unwrap());
        assert!(matches!(&outcomes[0].1, StepOutcome::Notified { attempts } if attempts[0].status == AttemptStatus::Suppressed));
        assert_eq!(outcomes[1].1, StepOutcome::WebhookSuppressed { webhook_id: "ops".into() });
        assert_eq!(outcomes[2].1, StepOutcome::ResolveSuppressed);
        let stored = h.repo.get_alert_group(group.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertGroupStatus::Firing);
    }

    #[tokio::test]
    async fn test_suppress_maintenance_holds_until_expiry() {
        let h = EngineHarness::new().await;
        let group = h.group_with_chain(vec![users(&["alice"])]).await;
        let window = h
            .maintenance
            .start(group.integration_id, MaintenanceMode::Suppress, StdDuration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Suppressed { until: window.expires_at });
        assert!(h.notifier.deliveries().is_empty());

        h.clock.set(window.expires_at);
        h.repo.take_due_wakeups(window.expires_at).await.unwrap();
        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Finished);
        assert_eq!(h.notifier.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_stopping_suppress_maintenance_requeues_held_run() {
        let h = EngineHarness::new().await;
        let group = h.group_with_chain(vec![users(&["alice"])]).await;
        let window = h
            .maintenance
            .start(group.integration_id, MaintenanceMode::Suppress, StdDuration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Suppressed { until: window.expires_at });
        h.harness.queue.take();

        assert!(h.maintenance.stop(group.integration_id).await.unwrap());
        assert_eq!(h.harness.queue.take(), vec![group.id]);
        h.clock.advance(Duration::seconds(5));
        assert!(h.repo.take_due_wakeups(h.clock.now()).await.unwrap().is_empty());

        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Finished);
        assert_eq!(h.notifier.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_replaced_suppress_window_holds_until_the_new_expiry() {
        let h = EngineHarness::new().await;
        let group = h.group_with_chain(vec![users(&["alice"])]).await;
        let integration_id = group.integration_id;
        h.maintenance.start(integration_id, MaintenanceMode::Suppress, StdDuration::from_secs(3600)).await.unwrap();
        h.executor.run(group.id).await.unwrap();
        h.harness.queue.take();

        let shorter = h.maintenance.start(integration_id, MaintenanceMode::Suppress, StdDuration::from_secs(60)).await.unwrap();
        assert_eq!(h.harness.queue.take(), vec![group.id]);
        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Suppressed { until: shorter.expires_at });

        h.maintenance.start(integration_id, MaintenanceMode::Debug, StdDuration::from_secs(60)).await.unwrap();
        assert_eq!(h.harness.queue.take(), vec![group.id]);
        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Finished);
        assert!(h.notifier.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_lapsed_suppress_window_does_not_hold() {
        let h = EngineHarness::new().await;
        let group = h.group_with_chain(vec![users(&["alice"])]).await;
        let window = h
            .maintenance
            .start(group.integration_id, MaintenanceMode::Suppress, StdDuration::from_secs(600))
            .await
            .unwrap();

        // The row outlives its expiry until the timer sweeps it.
        h.clock.set(window.expires_at);
        assert!(h.repo.get_maintenance_window(group.integration_id).await.unwrap().is_some());
        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Finished);
        assert_eq!(h.notifier.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_no_chain_is_recorded_once() {
        let h = EngineHarness::new().await;
        let group = h.harness.fire_alert("grafana", "x").await;

        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::NoChain);
        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Stopped);
        let skipped = h
            .repo
            .timeline(group.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e.event, TimelineEvent::EscalationSkipped { reason: SkipReason::NoChain, .. }))
            .count();
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn test_resolve_step_resolves_by_escalation() {
        let h = EngineHarness::new().await;
        let group = h.group_with_chain(vec![EscalationStep::Resolve, users(&["never"])]).await;

        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Resolved);
        let stored = h.repo.get_alert_group(group.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertGroupStatus::Resolved);
        assert!(h.notifier.deliveries().is_empty());
        let timeline = h.repo.timeline(group.id).await.unwrap();
        assert!(timeline.iter().any(|e| e.event == TimelineEvent::Resolved { actor: Actor::Escalation }));
    }

    #[tokio::test]
    async fn test_lease_coalesces_concurrent_requests() {
        let h = EngineHarness::new().await;
        let group = h.group_with_chain(vec![users(&["alice"])]).await;
        let now = h.clock.now();
        assert!(h.repo.try_acquire_lease(group.id, "other", now, now + Duration::minutes(5)).await.unwrap());

        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::AlreadyRunning);
        assert!(h.notifier.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_failed_and_slow_deliveries_are_recorded() {
        let mut notifier = MockNotifier::new();
        notifier.expect_deliver().returning(|user_id, _, _| {
            if user_id == "alice" {
                DeliveryStatus::Failed("relay refused".into())
            } else {
                DeliveryStatus::Sent
            }
        });
        let h = EngineHarness::with_notifier(Arc::new(notifier)).await;
        let group = h.group_with_chain(vec![users(&["alice", "bob"]), users(&["carol"])]).await;

        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Finished);
        let outcomes = step_outcomes(&h.repo.timeline(group.id).await.unwrap());
        let StepOutcome::Notified { attempts } = &outcomes[0].1 else { panic!("expected attempts") };
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert_eq!(attempts[0].error.as_deref(), Some("relay refused"));
        assert_eq!(attempts[1].status, AttemptStatus::Sent);
        assert_eq!(h.services.metrics.metrics.snapshot().notifications_failed, 1);
    }

    #[tokio::test]
    async fn test_delivery_timeout_counts_as_failure() {
        let h = EngineHarness::with_notifier(Arc::new(RecordingNotifier::slow(StdDuration::from_secs(5)))).await;
        let group = h.group_with_chain(vec![users(&["alice"])]).await;

        h.executor_with_timeout(StdDuration::from_millis(20)).run(group.id).await.unwrap();
        let outcomes = step_outcomes(&h.repo.timeline(group.id).await.unwrap());
        let StepOutcome::Notified { attempts } = &outcomes[0].1 else { panic!("expected attempts") };
        assert_eq!(attempts[0].status, AttemptStatus::Failed);
        assert!(attempts[0].error.as_deref().unwrap().starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_unknown_schedule_is_a_failed_step_not_an_error() {
        let h = EngineHarness::new().await;
        let group = h
            .group_with_chain(vec![
                EscalationStep::NotifyOnCallSchedule { schedule_id: "nope".into(), tier: NotificationTier::Default },
                users(&["alice"]),
            ])
            .await;

        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Finished);
        let outcomes = step_outcomes(&h.repo.timeline(group.id).await.unwrap());
        assert_eq!(
            outcomes[0].1,
            StepOutcome::RecipientLookupFailed { error: NotifierError::UnknownSchedule("nope".into()).to_string() }
        );
        assert_eq!(h.notifier.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_acknowledged_group_stops_and_resumes_after_unack() {
        let h = EngineHarness::new().await;
        let group = h.group_with_chain(vec![users(&["alice"])]).await;
        h.actions.apply(group.id, GroupAction::Acknowledge, Actor::User("a".into())).await.unwrap();
        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Stopped);

        h.actions.apply(group.id, GroupAction::Unacknowledge, Actor::User("a".into())).await.unwrap();
        assert_eq!(h.executor.run(group.id).await.unwrap(), RunOutcome::Finished);
        assert_eq!(h.notifier.deliveries().len(), 1);
    }
}
