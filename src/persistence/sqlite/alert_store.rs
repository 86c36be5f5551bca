//! Implementation of the AlertStore trait for SqliteStateRepository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::{
    db_error,
    rows::{AlertGroupRow, AlertRow, EscalationStateRow, TimelineRow, convert_all},
    to_millis,
};
use crate::{
    models::{
        Alert, AlertGroup, AlertGroupFilter, EscalationState, TimelineEntry, TimelineEvent,
        alert_group::{EscalationEffect, StatusUpdate, Transition},
    },
    persistence::{
        error::PersistenceError,
        sqlite::SqliteStateRepository,
        traits::{AlertStore, GroupedAlert, GroupingRequest, StepCommit},
    },
};

const GROUP_COLUMNS: &str = "alert_group_id, integration_id, matched_rule_id, escalation_chain_id, grouping_key, status, labels, created_at, acknowledged_at, resolved_at, silenced_until, root_alert_group_id";

const DEFAULT_LIST_LIMIT: u32 = 100;

mod group_sql {
    pub const FIND_OPEN: &str = "SELECT alert_group_id, integration_id, matched_rule_id, escalation_chain_id, grouping_key, status, labels, created_at, acknowledged_at, resolved_at, silenced_until, root_alert_group_id FROM alert_groups WHERE integration_id = ? AND grouping_key = ? AND open_for_grouping = 1";
    pub const CLOSE_FOR_GROUPING: &str =
        "UPDATE alert_groups SET open_for_grouping = NULL WHERE alert_group_id = ?";
    pub const INSERT: &str = "INSERT INTO alert_groups (integration_id, matched_rule_id, escalation_chain_id, grouping_key, status, labels, open_for_grouping, created_at) VALUES (?, ?, ?, ?, 'firing', ?, ?, ?) RETURNING alert_group_id, integration_id, matched_rule_id, escalation_chain_id, grouping_key, status, labels, created_at, acknowledged_at, resolved_at, silenced_until, root_alert_group_id";
    pub const GET: &str = "SELECT alert_group_id, integration_id, matched_rule_id, escalation_chain_id, grouping_key, status, labels, created_at, acknowledged_at, resolved_at, silenced_until, root_alert_group_id FROM alert_groups WHERE alert_group_id = ?";
    pub const UPDATE_STATUS: &str = "UPDATE alert_groups SET status = ?, acknowledged_at = ?, resolved_at = ?, silenced_until = ?, open_for_grouping = CASE WHEN ? = 'resolved' THEN NULL ELSE open_for_grouping END WHERE alert_group_id = ? AND status = ?";
    pub const ATTACH: &str = "UPDATE alert_groups SET root_alert_group_id = ? WHERE alert_group_id = ? AND alert_group_id <> ? AND root_alert_group_id IS NULL AND NOT EXISTS (SELECT 1 FROM alert_groups d WHERE d.root_alert_group_id = ?) AND EXISTS (SELECT 1 FROM alert_groups r WHERE r.alert_group_id = ? AND r.root_alert_group_id IS NULL)";
    pub const DETACH: &str = "UPDATE alert_groups SET root_alert_group_id = NULL WHERE alert_group_id = ? AND root_alert_group_id IS ?";
    pub const EXPIRED_SILENCES: &str = "SELECT alert_group_id FROM alert_groups WHERE status = 'silenced' AND silenced_until <= ? ORDER BY alert_group_id";
}

mod alert_sql {
    pub const INSERT: &str = "INSERT INTO alerts (alert_group_id, integration_id, payload, received_at) VALUES (?, ?, ?, ?) RETURNING alert_id, alert_group_id, integration_id, payload, received_at";
    pub const FOR_GROUP: &str = "SELECT alert_id, alert_group_id, integration_id, payload, received_at FROM alerts WHERE alert_group_id = ? ORDER BY alert_id";
}

mod timeline_sql {
    pub const INSERT: &str = "INSERT INTO timeline_entries (alert_group_id, event, created_at) VALUES (?, ?, ?) RETURNING entry_id, alert_group_id, event, created_at";
    pub const FOR_GROUP: &str = "SELECT entry_id, alert_group_id, event, created_at FROM timeline_entries WHERE alert_group_id = ? ORDER BY entry_id";
}

mod escalation_sql {
    pub const INSERT: &str = "INSERT INTO escalation_states (alert_group_id) VALUES (?)";
    pub const GET: &str = "SELECT alert_group_id, next_step, repeat_count, wake_at, finished, lease_owner, lease_expires_at FROM escalation_states WHERE alert_group_id = ?";
    pub const RESTART: &str = "UPDATE escalation_states SET next_step = 0, repeat_count = 0, wake_at = NULL, held = 0, finished = 0 WHERE alert_group_id = ?";
    pub const ACQUIRE_LEASE: &str = "UPDATE escalation_states SET lease_owner = ?, lease_expires_at = ? WHERE alert_group_id = ? AND (lease_owner IS NULL OR lease_expires_at <= ?)";
    pub const RENEW_LEASE: &str = "UPDATE escalation_states SET lease_expires_at = ? WHERE alert_group_id = ? AND lease_owner = ?";
    pub const RELEASE_LEASE: &str = "UPDATE escalation_states SET lease_owner = NULL, lease_expires_at = NULL WHERE alert_group_id = ? AND lease_owner = ?";
    pub const COMMIT_STEP: &str = "UPDATE escalation_states SET next_step = ?, repeat_count = ?, wake_at = ?, held = 0, finished = ? WHERE alert_group_id = ? AND lease_owner = ? AND next_step = ? AND finished = 0";
    pub const FINISH: &str = "UPDATE escalation_states SET finished = 1, wake_at = NULL, held = 0 WHERE alert_group_id = ? AND finished = 0 AND (? IS NULL OR lease_owner = ?)";
    pub const PARK: &str = "UPDATE escalation_states SET wake_at = ?, held = ? WHERE alert_group_id = ? AND lease_owner = ? AND finished = 0";
    pub const TAKE_DUE_WAKEUPS: &str = "UPDATE escalation_states SET wake_at = NULL, held = 0 WHERE wake_at <= ? AND finished = 0 RETURNING alert_group_id";
    pub const RELEASE_HOLDS: &str = "UPDATE escalation_states SET wake_at = NULL, held = 0 WHERE held = 1 AND finished = 0 AND alert_group_id IN (SELECT alert_group_id FROM alert_groups WHERE integration_id = ?) RETURNING alert_group_id";
    pub const RECLAIM_LEASES: &str = "UPDATE escalation_states SET lease_owner = NULL, lease_expires_at = NULL WHERE lease_owner IS NOT NULL AND lease_expires_at <= ? RETURNING alert_group_id";
    pub const RESUMABLE: &str = "SELECT s.alert_group_id FROM escalation_states s JOIN alert_groups g ON g.alert_group_id = s.alert_group_id WHERE g.status = 'firing' AND g.root_alert_group_id IS NULL AND s.finished = 0 AND s.wake_at IS NULL ORDER BY s.alert_group_id";
}

async fn insert_timeline(
    conn: &mut SqliteConnection,
    alert_group_id: i64,
    event: &TimelineEvent,
    at: DateTime<Utc>,
) -> Result<TimelineEntry, PersistenceError> {
    sqlx::query_as::<_, TimelineRow>(timeline_sql::INSERT)
        .bind(alert_group_id)
        .bind(serde_json::to_string(event)?)
        .bind(to_millis(at))
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("insert timeline entry"))?
        .try_into()
}

async fn insert_alert(
    conn: &mut SqliteConnection,
    alert_group_id: i64,
    request: &GroupingRequest,
) -> Result<Alert, PersistenceError> {
    sqlx::query_as::<_, AlertRow>(alert_sql::INSERT)
        .bind(alert_group_id)
        .bind(request.integration_id)
        .bind(serde_json::to_string(&request.payload)?)
        .bind(to_millis(request.received_at))
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("insert alert"))?
        .try_into()
}

fn sorted(mut ids: Vec<i64>) -> Vec<i64> {
    ids.sort_unstable();
    ids
}

impl SqliteStateRepository {
    async fn park(
        &self,
        alert_group_id: i64,
        owner: &str,
        until: DateTime<Utc>,
        held: bool,
    ) -> Result<bool, PersistenceError> {
        let result = self
            .execute_query_with_error_handling(
                "park escalation",
                sqlx::query(escalation_sql::PARK)
                    .bind(to_millis(until))
                    .bind(held)
                    .bind(alert_group_id)
                    .bind(owner)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl AlertStore for SqliteStateRepository {
    #[tracing::instrument(skip(self, request), fields(integration_id = request.integration_id, grouping_key = %request.grouping_key), level = "debug")]
    async fn group_alert(
        &self,
        request: &GroupingRequest,
    ) -> Result<GroupedAlert, PersistenceError> {
        let mut tx = self.begin_write().await?;

        if !request.force_new {
            let open: Option<AlertGroup> = sqlx::query_as::<_, AlertGroupRow>(group_sql::FIND_OPEN)
                .bind(request.integration_id)
                .bind(&request.grouping_key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error("find open alert group"))?
                .map(AlertGroup::try_from)
                .transpose()?;

            if let Some(group) = open {
                if group.created_at >= request.open_since {
                    let alert = insert_alert(&mut tx, group.id, request).await?;
                    insert_timeline(
                        &mut tx,
                        group.id,
                        &TimelineEvent::AlertAppended { alert_id: alert.id },
                        request.received_at,
                    )
                    .await?;
                    tx.commit().await.map_err(db_error("commit grouped alert"))?;
                    tracing::debug!(alert_group_id = group.id, alert_id = alert.id, "Alert appended to open group.");
                    return Ok(GroupedAlert { alert, alert_group: group, created: false });
                }
                // Past the grouping window: the group stays as it is but
                // takes no more alerts.
                sqlx::query(group_sql::CLOSE_FOR_GROUPING)
                    .bind(group.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error("close alert group for grouping"))?;
            }
        }

        let open_for_grouping: Option<i64> = (!request.force_new).then_some(1);
        let group: AlertGroup = sqlx::query_as::<_, AlertGroupRow>(group_sql::INSERT)
            .bind(request.integration_id)
            .bind(request.matched_rule_id)
            .bind(request.escalation_chain_id)
            .bind(&request.grouping_key)
            .bind(serde_json::to_string(&request.labels)?)
            .bind(open_for_grouping)
            .bind(to_millis(request.received_at))
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("insert alert group"))?
            .try_into()?;

        sqlx::query(escalation_sql::INSERT)
            .bind(group.id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("insert escalation state"))?;

        let alert = insert_alert(&mut tx, group.id, request).await?;
        insert_timeline(
            &mut tx,
            group.id,
            &TimelineEvent::Registered { maintenance: request.maintenance },
            request.received_at,
        )
        .await?;
        if let Some(rule_id) = request.matched_rule_id {
            insert_timeline(
                &mut tx,
                group.id,
                &TimelineEvent::RouteAssigned {
                    rule_id,
                    escalation_chain_id: request.escalation_chain_id,
                },
                request.received_at,
            )
            .await?;
        }

        tx.commit().await.map_err(db_error("commit new alert group"))?;
        tracing::debug!(alert_group_id = group.id, alert_id = alert.id, "Alert group created.");
        Ok(GroupedAlert { alert, alert_group: group, created: true })
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn get_alert_group(
        &self,
        alert_group_id: i64,
    ) -> Result<Option<AlertGroup>, PersistenceError> {
        self.execute_query_with_error_handling(
            "get alert group",
            sqlx::query_as::<_, AlertGroupRow>(group_sql::GET)
                .bind(alert_group_id)
                .fetch_optional(&self.pool),
        )
        .await?
        .map(AlertGroup::try_from)
        .transpose()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn list_alert_groups(
        &self,
        filter: &AlertGroupFilter,
    ) -> Result<Vec<AlertGroup>, PersistenceError> {
        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {GROUP_COLUMNS} FROM alert_groups WHERE 1 = 1"));
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(integration_id) = filter.integration_id {
            builder.push(" AND integration_id = ").push_bind(integration_id);
        }
        if let Some((key, value)) = &filter.label {
            let path = format!("$.\"{}\"", key.replace('"', "\\\""));
            builder
                .push(" AND json_extract(labels, ")
                .push_bind(path)
                .push(") = ")
                .push_bind(value.clone());
        }
        let limit = if filter.limit == 0 { DEFAULT_LIST_LIMIT } else { filter.limit };
        builder.push(" ORDER BY alert_group_id DESC LIMIT ").push_bind(i64::from(limit));

        let rows = self
            .execute_query_with_error_handling(
                "list alert groups",
                builder.build_query_as::<AlertGroupRow>().fetch_all(&self.pool),
            )
            .await?;
        convert_all(rows)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn alerts_for_group(&self, alert_group_id: i64) -> Result<Vec<Alert>, PersistenceError> {
        let rows = self
            .execute_query_with_error_handling(
                "list alerts for group",
                sqlx::query_as::<_, AlertRow>(alert_sql::FOR_GROUP)
                    .bind(alert_group_id)
                    .fetch_all(&self.pool),
            )
            .await?;
        convert_all(rows)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn timeline(&self, alert_group_id: i64) -> Result<Vec<TimelineEntry>, PersistenceError> {
        let rows = self
            .execute_query_with_error_handling(
                "get timeline",
                sqlx::query_as::<_, TimelineRow>(timeline_sql::FOR_GROUP)
                    .bind(alert_group_id)
                    .fetch_all(&self.pool),
            )
            .await?;
        convert_all(rows)
    }

    #[tracing::instrument(skip(self, event), level = "debug")]
    async fn append_timeline(
        &self,
        alert_group_id: i64,
        event: &TimelineEvent,
        at: DateTime<Utc>,
    ) -> Result<TimelineEntry, PersistenceError> {
        let mut conn = self.pool.acquire().await.map_err(db_error("acquire connection"))?;
        insert_timeline(&mut conn, alert_group_id, event, at).await
    }

    #[tracing::instrument(skip(self, update, event), fields(from = %transition.from, to = %transition.to), level = "debug")]
    async fn apply_transition(
        &self,
        alert_group_id: i64,
        transition: &Transition,
        update: &StatusUpdate,
        event: &TimelineEvent,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let mut tx = self.begin_write().await?;

        let result = sqlx::query(group_sql::UPDATE_STATUS)
            .bind(update.status.as_str())
            .bind(update.acknowledged_at.map(to_millis))
            .bind(update.resolved_at.map(to_millis))
            .bind(update.silenced_until.map(to_millis))
            .bind(update.status.as_str())
            .bind(alert_group_id)
            .bind(transition.from.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_error("update alert group status"))?;
        if result.rows_affected() == 0 {
            tracing::debug!(alert_group_id, "Status changed concurrently; transition dropped.");
            return Ok(false);
        }

        if transition.effect == EscalationEffect::Restart {
            sqlx::query(escalation_sql::RESTART)
                .bind(alert_group_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error("restart escalation"))?;
        }
        insert_timeline(&mut tx, alert_group_id, event, at).await?;

        tx.commit().await.map_err(db_error("commit status transition"))?;
        Ok(true)
    }

    #[tracing::instrument(skip(self, event), level = "debug")]
    async fn attach_alert_group(
        &self,
        alert_group_id: i64,
        root_alert_group_id: i64,
        event: &TimelineEvent,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let mut tx = self.begin_write().await?;
        let result = sqlx::query(group_sql::ATTACH)
            .bind(root_alert_group_id)
            .bind(alert_group_id)
            .bind(root_alert_group_id)
            .bind(alert_group_id)
            .bind(root_alert_group_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("attach alert group"))?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        insert_timeline(&mut tx, alert_group_id, event, at).await?;
        tx.commit().await.map_err(db_error("commit attach"))?;
        Ok(true)
    }

    #[tracing::instrument(skip(self, event), level = "debug")]
    async fn detach_alert_group(
        &self,
        alert_group_id: i64,
        root_alert_group_id: i64,
        event: &TimelineEvent,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let mut tx = self.begin_write().await?;
        let result = sqlx::query(group_sql::DETACH)
            .bind(alert_group_id)
            .bind(root_alert_group_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("detach alert group"))?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        insert_timeline(&mut tx, alert_group_id, event, at).await?;
        tx.commit().await.map_err(db_error("commit detach"))?;
        Ok(true)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn escalation_state(
        &self,
        alert_group_id: i64,
    ) -> Result<Option<EscalationState>, PersistenceError> {
        self.execute_query_with_error_handling(
            "get escalation state",
            sqlx::query_as::<_, EscalationStateRow>(escalation_sql::GET)
                .bind(alert_group_id)
                .fetch_optional(&self.pool),
        )
        .await?
        .map(EscalationState::try_from)
        .transpose()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn try_acquire_lease(
        &self,
        alert_group_id: i64,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let result = self
            .execute_query_with_error_handling(
                "acquire escalation lease",
                sqlx::query(escalation_sql::ACQUIRE_LEASE)
                    .bind(owner)
                    .bind(to_millis(expires_at))
                    .bind(alert_group_id)
                    .bind(to_millis(now))
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn renew_lease(
        &self,
        alert_group_id: i64,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let result = self
            .execute_query_with_error_handling(
                "renew escalation lease",
                sqlx::query(escalation_sql::RENEW_LEASE)
                    .bind(to_millis(expires_at))
                    .bind(alert_group_id)
                    .bind(owner)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn release_lease(
        &self,
        alert_group_id: i64,
        owner: &str,
    ) -> Result<(), PersistenceError> {
        self.execute_query_with_error_handling(
            "release escalation lease",
            sqlx::query(escalation_sql::RELEASE_LEASE)
                .bind(alert_group_id)
                .bind(owner)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, commit, event), fields(step_index = commit.step_index), level = "debug")]
    async fn commit_step(
        &self,
        alert_group_id: i64,
        owner: &str,
        commit: &StepCommit,
        event: &TimelineEvent,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let mut tx = self.begin_write().await?;
        let result = sqlx::query(escalation_sql::COMMIT_STEP)
            .bind(commit.next_step as i64)
            .bind(i64::from(commit.repeat_count))
            .bind(commit.wake_at.map(to_millis))
            .bind(commit.finished)
            .bind(alert_group_id)
            .bind(owner)
            .bind(commit.step_index as i64)
            .execute(&mut *tx)
            .await
            .map_err(db_error("commit escalation step"))?;
        if result.rows_affected() == 0 {
            tracing::debug!(alert_group_id, owner, "Lease lost or cursor moved; step not committed.");
            return Ok(false);
        }
        insert_timeline(&mut tx, alert_group_id, event, at).await?;
        tx.commit().await.map_err(db_error("commit escalation step"))?;
        Ok(true)
    }

    #[tracing::instrument(skip(self, event), level = "debug")]
    async fn finish_escalation(
        &self,
        alert_group_id: i64,
        owner: Option<&str>,
        event: &TimelineEvent,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let mut tx = self.begin_write().await?;
        let result = sqlx::query(escalation_sql::FINISH)
            .bind(alert_group_id)
            .bind(owner)
            .bind(owner)
            .execute(&mut *tx)
            .await
            .map_err(db_error("finish escalation"))?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        insert_timeline(&mut tx, alert_group_id, event, at).await?;
        tx.commit().await.map_err(db_error("commit escalation finish"))?;
        Ok(true)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn park_escalation(
        &self,
        alert_group_id: i64,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        self.park(alert_group_id, owner, until, false).await
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn hold_escalation(
        &self,
        alert_group_id: i64,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        self.park(alert_group_id, owner, until, true).await
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn release_maintenance_holds(&self, integration_id: i64) -> Result<Vec<i64>, PersistenceError> {
        let ids: Vec<i64> = self
            .execute_query_with_error_handling(
                "release maintenance holds",
                sqlx::query_scalar(escalation_sql::RELEASE_HOLDS)
                    .bind(integration_id)
                    .fetch_all(&self.pool),
            )
            .await?;
        Ok(sorted(ids))
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn take_due_wakeups(&self, now: DateTime<Utc>) -> Result<Vec<i64>, PersistenceError> {
        let ids: Vec<i64> = self
            .execute_query_with_error_handling(
                "take due wakeups",
                sqlx::query_scalar(escalation_sql::TAKE_DUE_WAKEUPS)
                    .bind(to_millis(now))
                    .fetch_all(&self.pool),
            )
            .await?;
        Ok(sorted(ids))
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn expired_silences(&self, now: DateTime<Utc>) -> Result<Vec<i64>, PersistenceError> {
        self.execute_query_with_error_handling(
            "list expired silences",
            sqlx::query_scalar(group_sql::EXPIRED_SILENCES)
                .bind(to_millis(now))
                .fetch_all(&self.pool),
        )
        .await
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn reclaim_expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, PersistenceError> {
        let ids: Vec<i64> = self
            .execute_query_with_error_handling(
                "reclaim expired leases",
                sqlx::query_scalar(escalation_sql::RECLAIM_LEASES)
                    .bind(to_millis(now))
                    .fetch_all(&self.pool),
            )
            .await?;
        if !ids.is_empty() {
            tracing::warn!(count = ids.len(), "Reclaimed expired escalation leases.");
        }
        Ok(sorted(ids))
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn resumable_alert_groups(&self) -> Result<Vec<i64>, PersistenceError> {
        self.execute_query_with_error_handling(
            "list resumable alert groups",
            sqlx::query_scalar(escalation_sql::RESUMABLE).fetch_all(&self.pool),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;
    use crate::{
        models::{
            Actor, AlertGroupStatus, GroupAction, MaintenanceMode, NewIntegration,
            timeline::{SkipReason, StepOutcome},
        },
        persistence::traits::AppRepository,
    };

    async fn setup() -> (SqliteStateRepository, i64) {
        let repo = SqliteStateRepository::new("sqlite::memory:")
            .await
            .expect("Failed to connect to in-memory db");
        repo.run_migrations().await.expect("Failed to run migrations");
        let integration = repo
            .create_integration(
                &NewIntegration { name: "grafana".into(), ..Default::default() },
                None,
                &[],
                t0(),
            )
            .await
            .unwrap();
        (repo, integration.id)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn request(integration_id: i64, key: &str, at: DateTime<Utc>) -> GroupingRequest {
        GroupingRequest {
            integration_id,
            grouping_key: key.into(),
            matched_rule_id: None,
            escalation_chain_id: None,
            payload: json!({ "title": key }),
            labels: BTreeMap::from([("severity".to_string(), "critical".to_string())]),
            received_at: at,
            open_since: at - Duration::hours(24),
            force_new: false,
            maintenance: None,
        }
    }

    async fn transition(
        repo: &SqliteStateRepository,
        group: &AlertGroup,
        action: GroupAction,
        at: DateTime<Utc>,
    ) -> bool {
        let transition = group.status.transition(&action).expect("action not allowed");
        let update = StatusUpdate::for_action(group, &action, transition.to, at);
        repo.apply_transition(
            group.id,
            &transition,
            &update,
            &TimelineEvent::Resolved { actor: Actor::System },
            at,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_group_alert_appends_within_window() {
        let (repo, integration_id) = setup().await;
        let first = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap();
        let second = repo
            .group_alert(&request(integration_id, "k", t0() + Duration::minutes(5)))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.alert_group.id, second.alert_group.id);
        assert_eq!(repo.alerts_for_group(first.alert_group.id).await.unwrap().len(), 2);

        let timeline = repo.timeline(first.alert_group.id).await.unwrap();
        assert!(matches!(timeline[0].event, TimelineEvent::Registered { maintenance: None }));
        assert_eq!(
            timeline.last().unwrap().event,
            TimelineEvent::AlertAppended { alert_id: second.alert.id }
        );
        let state = repo.escalation_state(first.alert_group.id).await.unwrap().unwrap();
        assert_eq!(state.next_step, 0);
        assert!(!state.finished);
    }

    #[tokio::test]
    async fn test_group_alert_closes_stale_group() {
        let (repo, integration_id) = setup().await;
        let first = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap();
        let later = t0() + Duration::hours(25);
        let second = repo.group_alert(&request(integration_id, "k", later)).await.unwrap();

        assert!(second.created);
        assert_ne!(first.alert_group.id, second.alert_group.id);
        let third = repo
            .group_alert(&request(integration_id, "k", later + Duration::minutes(1)))
            .await
            .unwrap();
        assert_eq!(third.alert_group.id, second.alert_group.id);
    }

    #[tokio::test]
    async fn test_force_new_groups_stay_closed() {
        let (repo, integration_id) = setup().await;
        let forced = GroupingRequest { force_new: true, ..request(integration_id, "k", t0()) };
        let a = repo.group_alert(&forced).await.unwrap();
        let b = repo.group_alert(&forced).await.unwrap();
        assert_ne!(a.alert_group.id, b.alert_group.id);

        let regular = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap();
        assert!(regular.created);
    }

    #[tokio::test]
    async fn test_resolved_group_takes_no_more_alerts() {
        let (repo, integration_id) = setup().await;
        let first = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap();
        assert!(transition(&repo, &first.alert_group, GroupAction::Resolve, t0()).await);

        let next = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap();
        assert!(next.created);

        // Unresolving does not reopen the old group for grouping.
        let resolved = repo.get_alert_group(first.alert_group.id).await.unwrap().unwrap();
        assert!(transition(&repo, &resolved, GroupAction::Unresolve, t0()).await);
        let again = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap();
        assert_eq!(again.alert_group.id, next.alert_group.id);
    }

    #[tokio::test]
    async fn test_stale_transition_is_rejected() {
        let (repo, integration_id) = setup().await;
        let grouped = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap();
        assert!(transition(&repo, &grouped.alert_group, GroupAction::Acknowledge, t0()).await);
        // Same snapshot still says firing.
        assert!(!transition(&repo, &grouped.alert_group, GroupAction::Acknowledge, t0()).await);

        let group = repo.get_alert_group(grouped.alert_group.id).await.unwrap().unwrap();
        assert_eq!(group.status, AlertGroupStatus::Acknowledged);
        assert_eq!(group.acknowledged_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_unresolve_restarts_escalation() {
        let (repo, integration_id) = setup().await;
        let grouped = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap();
        let id = grouped.alert_group.id;
        assert!(repo.try_acquire_lease(id, "w", t0(), t0() + Duration::minutes(5)).await.unwrap());
        let commit = StepCommit { step_index: 0, next_step: 1, repeat_count: 0, wake_at: None, finished: true };
        let event = TimelineEvent::StepCompleted {
            step_index: 0,
            outcome: StepOutcome::NoRecipients,
            maintenance: None,
        };
        assert!(repo.commit_step(id, "w", &commit, &event, t0()).await.unwrap());
        repo.release_lease(id, "w").await.unwrap();

        assert!(transition(&repo, &grouped.alert_group, GroupAction::Resolve, t0()).await);
        let resolved = repo.get_alert_group(id).await.unwrap().unwrap();
        assert!(transition(&repo, &resolved, GroupAction::Unresolve, t0()).await);

        let state = repo.escalation_state(id).await.unwrap().unwrap();
        assert_eq!((state.next_step, state.finished), (0, false));
        assert_eq!(repo.resumable_alert_groups().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let (repo, integration_id) = setup().await;
        let id = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap().alert_group.id;
        let ttl = t0() + Duration::minutes(5);

        assert!(repo.try_acquire_lease(id, "a", t0(), ttl).await.unwrap());
        assert!(!repo.try_acquire_lease(id, "b", t0(), ttl).await.unwrap());
        assert!(!repo.renew_lease(id, "b", ttl).await.unwrap());

        // Expired leases are reclaimed.
        assert_eq!(repo.reclaim_expired_leases(ttl).await.unwrap(), vec![id]);
        assert!(repo.try_acquire_lease(id, "b", ttl, ttl + Duration::minutes(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_step_requires_lease_and_cursor() {
        let (repo, integration_id) = setup().await;
        let id = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap().alert_group.id;
        let event = TimelineEvent::StepCompleted {
            step_index: 0,
            outcome: StepOutcome::NoRecipients,
            maintenance: None,
        };
        let commit = StepCommit { step_index: 0, next_step: 1, repeat_count: 0, wake_at: None, finished: false };

        assert!(!repo.commit_step(id, "nobody", &commit, &event, t0()).await.unwrap());
        assert!(repo.try_acquire_lease(id, "a", t0(), t0() + Duration::minutes(5)).await.unwrap());
        assert!(repo.commit_step(id, "a", &commit, &event, t0()).await.unwrap());
        // Replaying the same step is refused.
        assert!(!repo.commit_step(id, "a", &commit, &event, t0()).await.unwrap());

        let steps = repo
            .timeline(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| matches!(e.event, TimelineEvent::StepCompleted { .. }))
            .count();
        assert_eq!(steps, 1);
    }

    #[tokio::test]
    async fn test_wakeups_are_taken_once() {
        let (repo, integration_id) = setup().await;
        let id = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap().alert_group.id;
        repo.try_acquire_lease(id, "a", t0(), t0() + Duration::minutes(5)).await.unwrap();
        let until = t0() + Duration::minutes(10);
        assert!(repo.park_escalation(id, "a", until).await.unwrap());
        repo.release_lease(id, "a").await.unwrap();

        assert!(repo.take_due_wakeups(until - Duration::seconds(1)).await.unwrap().is_empty());
        assert!(repo.resumable_alert_groups().await.unwrap().is_empty());
        assert_eq!(repo.take_due_wakeups(until).await.unwrap(), vec![id]);
        assert!(repo.take_due_wakeups(until).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_clears_only_maintenance_holds() {
        let (repo, integration_id) = setup().await;
        let held = repo.group_alert(&request(integration_id, "held", t0())).await.unwrap().alert_group.id;
        let waiting = repo.group_alert(&request(integration_id, "waiting", t0())).await.unwrap().alert_group.id;
        let until = t0() + Duration::hours(1);
        for (id, hold) in [(held, true), (waiting, false)] {
            repo.try_acquire_lease(id, "a", t0(), t0() + Duration::minutes(5)).await.unwrap();
            if hold {
                assert!(repo.hold_escalation(id, "a", until).await.unwrap());
            } else {
                assert!(repo.park_escalation(id, "a", until).await.unwrap());
            }
            repo.release_lease(id, "a").await.unwrap();
        }

        assert!(repo.release_maintenance_holds(integration_id + 1).await.unwrap().is_empty());
        assert_eq!(repo.release_maintenance_holds(integration_id).await.unwrap(), vec![held]);
        assert!(repo.release_maintenance_holds(integration_id).await.unwrap().is_empty());
        assert_eq!(repo.escalation_state(held).await.unwrap().unwrap().wake_at, None);
        assert_eq!(repo.escalation_state(waiting).await.unwrap().unwrap().wake_at, Some(until));
    }

    #[tokio::test]
    async fn test_finish_escalation_once() {
        let (repo, integration_id) = setup().await;
        let id = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap().alert_group.id;
        let event = TimelineEvent::EscalationSkipped {
            reason: SkipReason::MaintenanceSuppressed,
            maintenance: Some(MaintenanceMode::Suppress),
        };
        assert!(repo.finish_escalation(id, None, &event, t0()).await.unwrap());
        assert!(!repo.finish_escalation(id, None, &event, t0()).await.unwrap());
        assert!(repo.resumable_alert_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attach_rules() {
        let (repo, integration_id) = setup().await;
        let root = repo.group_alert(&request(integration_id, "root", t0())).await.unwrap().alert_group.id;
        let child = repo.group_alert(&request(integration_id, "child", t0())).await.unwrap().alert_group.id;
        let other = repo.group_alert(&request(integration_id, "other", t0())).await.unwrap().alert_group.id;
        let event = |root| TimelineEvent::Attached { actor: Actor::User("alice".into()), root_alert_group_id: root };

        assert!(!repo.attach_alert_group(root, root, &event(root), t0()).await.unwrap());
        assert!(repo.attach_alert_group(child, root, &event(root), t0()).await.unwrap());
        // Already attached.
        assert!(!repo.attach_alert_group(child, other, &event(other), t0()).await.unwrap());
        // Root has dependents.
        assert!(!repo.attach_alert_group(root, other, &event(other), t0()).await.unwrap());
        // Target is attached.
        assert!(!repo.attach_alert_group(other, child, &event(child), t0()).await.unwrap());
        assert!(repo.resumable_alert_groups().await.unwrap().iter().all(|id| *id != child));

        let detach = TimelineEvent::Unattached { actor: Actor::System, root_alert_group_id: root };
        assert!(!repo.detach_alert_group(child, other, &detach, t0()).await.unwrap());
        assert!(repo.detach_alert_group(child, root, &detach, t0()).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_alert_groups_filters() {
        let (repo, integration_id) = setup().await;
        let a = repo.group_alert(&request(integration_id, "a", t0())).await.unwrap().alert_group;
        let mut warning = request(integration_id, "b", t0());
        warning.labels = BTreeMap::from([("severity".to_string(), "warning".to_string())]);
        let b = repo.group_alert(&warning).await.unwrap().alert_group;
        transition(&repo, &a, GroupAction::Acknowledge, t0()).await;

        let all = repo.list_alert_groups(&AlertGroupFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|g| g.id).collect::<Vec<_>>(), vec![b.id, a.id]);

        let acked = repo
            .list_alert_groups(&AlertGroupFilter {
                status: Some(AlertGroupStatus::Acknowledged),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(acked.iter().map(|g| g.id).collect::<Vec<_>>(), vec![a.id]);

        let by_label = repo
            .list_alert_groups(&AlertGroupFilter {
                label: Some(("severity".into(), "warning".into())),
                integration_id: Some(integration_id),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_label.iter().map(|g| g.id).collect::<Vec<_>>(), vec![b.id]);
    }

    #[tokio::test]
    async fn test_expired_silences() {
        let (repo, integration_id) = setup().await;
        let group = repo.group_alert(&request(integration_id, "k", t0())).await.unwrap().alert_group;
        let action = GroupAction::Silence { duration: std::time::Duration::from_secs(600) };
        transition(&repo, &group, action, t0()).await;

        assert!(repo.expired_silences(t0() + Duration::minutes(9)).await.unwrap().is_empty());
        assert_eq!(repo.expired_silences(t0() + Duration::minutes(10)).await.unwrap(), vec![group.id]);
    }
}
