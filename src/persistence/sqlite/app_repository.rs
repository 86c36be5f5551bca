//! Implementation of the AppRepository trait for SqliteStateRepository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::{
    db_error,
    rows::{
        EscalationChainRow, HeartbeatRow, IntegrationRow, MaintenanceWindowRow, RoutingRuleRow,
        convert_all,
    },
    to_millis,
};
use crate::{
    models::{
        EscalationChain, EscalationChainConfig, HeartbeatConfig, Integration, MaintenanceWindow,
        NewIntegration, NewRoutingRule, NotificationPolicy, RouteFilter, RoutingRule,
    },
    persistence::{error::PersistenceError, sqlite::SqliteStateRepository, traits::AppRepository},
};

mod integration_sql {
    pub const INSERT: &str = "INSERT INTO integrations (name, grouping_template, acknowledge_condition, resolve_condition, created_at) VALUES (?, ?, ?, ?, ?) RETURNING integration_id, name, grouping_template, acknowledge_condition, resolve_condition, created_at, deleted_at";
    pub const UPDATE: &str = "UPDATE integrations SET name = ?, grouping_template = ?, acknowledge_condition = ?, resolve_condition = ? WHERE integration_id = ? AND deleted_at IS NULL RETURNING integration_id, name, grouping_template, acknowledge_condition, resolve_condition, created_at, deleted_at";
    pub const GET: &str = "SELECT integration_id, name, grouping_template, acknowledge_condition, resolve_condition, created_at, deleted_at FROM integrations WHERE integration_id = ?";
    pub const GET_ACTIVE_BY_NAME: &str = "SELECT integration_id, name, grouping_template, acknowledge_condition, resolve_condition, created_at, deleted_at FROM integrations WHERE name = ? AND deleted_at IS NULL";
    pub const LIST_ACTIVE: &str = "SELECT integration_id, name, grouping_template, acknowledge_condition, resolve_condition, created_at, deleted_at FROM integrations WHERE deleted_at IS NULL ORDER BY integration_id";
    pub const SOFT_DELETE: &str =
        "UPDATE integrations SET deleted_at = ? WHERE integration_id = ? AND deleted_at IS NULL";
}

mod rule_sql {
    pub const INSERT: &str = "INSERT INTO routing_rules (integration_id, position, filter, is_default, escalation_chain_id, chat_destinations) VALUES (?, ?, ?, ?, ?, ?) RETURNING rule_id, integration_id, position, filter, escalation_chain_id, chat_destinations";
    pub const GET: &str = "SELECT rule_id, integration_id, position, filter, escalation_chain_id, chat_destinations FROM routing_rules WHERE rule_id = ?";
    pub const LIST_FOR_INTEGRATION: &str = "SELECT rule_id, integration_id, position, filter, escalation_chain_id, chat_destinations FROM routing_rules WHERE integration_id = ? ORDER BY position";
    pub const LIST_ACTIVE: &str = "SELECT r.rule_id, r.integration_id, r.position, r.filter, r.escalation_chain_id, r.chat_destinations FROM routing_rules r JOIN integrations i ON i.integration_id = r.integration_id WHERE i.deleted_at IS NULL ORDER BY r.integration_id, r.position";
    pub const COUNT_FOR_INTEGRATION: &str =
        "SELECT COUNT(*) FROM routing_rules WHERE integration_id = ?";
    pub const RULE_AT_POSITION: &str =
        "SELECT rule_id FROM routing_rules WHERE integration_id = ? AND position = ?";
    pub const UPDATE: &str = "UPDATE routing_rules SET filter = ?, escalation_chain_id = ?, chat_destinations = ? WHERE rule_id = ? RETURNING rule_id, integration_id, position, filter, escalation_chain_id, chat_destinations";
    pub const DELETE: &str = "DELETE FROM routing_rules WHERE rule_id = ?";
    pub const DELETE_FOR_INTEGRATION: &str = "DELETE FROM routing_rules WHERE integration_id = ?";
    pub const SET_POSITION: &str = "UPDATE routing_rules SET position = ? WHERE rule_id = ?";
    // Positions are unique per integration, so shifts go through negative
    // values first: p -> -(p + 1) -> final.
    pub const PARK_RANGE: &str = "UPDATE routing_rules SET position = -(position + 1) WHERE integration_id = ? AND position BETWEEN ? AND ?";
    pub const UNPARK_SHIFT_UP: &str = "UPDATE routing_rules SET position = -position WHERE integration_id = ? AND position < 0";
    pub const UNPARK_SHIFT_DOWN: &str = "UPDATE routing_rules SET position = -position - 2 WHERE integration_id = ? AND position < 0";
    pub const COUNT_USING_CHAIN: &str =
        "SELECT COUNT(*) FROM routing_rules WHERE escalation_chain_id = ?";
}

mod chain_sql {
    pub const INSERT: &str = "INSERT INTO escalation_chains (name, steps, ephemeral, created_at, updated_at) VALUES (?, ?, ?, ?, ?) RETURNING chain_id, name, steps, ephemeral, created_at, updated_at";
    pub const UPDATE: &str = "UPDATE escalation_chains SET name = ?, steps = ?, updated_at = ? WHERE chain_id = ? RETURNING chain_id, name, steps, ephemeral, created_at, updated_at";
    pub const GET: &str = "SELECT chain_id, name, steps, ephemeral, created_at, updated_at FROM escalation_chains WHERE chain_id = ?";
    pub const GET_BY_NAME: &str = "SELECT chain_id, name, steps, ephemeral, created_at, updated_at FROM escalation_chains WHERE name = ? AND ephemeral = 0";
    pub const LIST: &str = "SELECT chain_id, name, steps, ephemeral, created_at, updated_at FROM escalation_chains WHERE ephemeral = 0 ORDER BY chain_id";
    pub const DELETE: &str = "DELETE FROM escalation_chains WHERE chain_id = ?";
    pub const ADVANCE_ROUND_ROBIN: &str = "INSERT INTO round_robin_cursors (chain_id, step_index, counter) VALUES (?, ?, 0) ON CONFLICT (chain_id, step_index) DO UPDATE SET counter = counter + 1 RETURNING counter";
}

mod policy_sql {
    pub const GET: &str = "SELECT policy FROM notification_policies WHERE user_id = ?";
    pub const UPSERT: &str = "INSERT INTO notification_policies (user_id, policy) VALUES (?, ?) ON CONFLICT (user_id) DO UPDATE SET policy = excluded.policy";
}

mod maintenance_sql {
    pub const GET: &str = "SELECT integration_id, mode, started_at, expires_at FROM maintenance_windows WHERE integration_id = ?";
    pub const UPSERT: &str = "INSERT INTO maintenance_windows (integration_id, mode, started_at, expires_at) VALUES (?, ?, ?, ?) ON CONFLICT (integration_id) DO UPDATE SET mode = excluded.mode, started_at = excluded.started_at, expires_at = excluded.expires_at";
    pub const DELETE: &str = "DELETE FROM maintenance_windows WHERE integration_id = ?";
    pub const DELETE_IF_EXPIRES_AT: &str =
        "DELETE FROM maintenance_windows WHERE integration_id = ? AND expires_at = ?";
    pub const LIST: &str = "SELECT integration_id, mode, started_at, expires_at FROM maintenance_windows ORDER BY integration_id";
}

mod heartbeat_sql {
    pub const UPSERT: &str = "INSERT INTO heartbeats (integration_id, interval_seconds, last_seen_at, alerted) VALUES (?, ?, ?, 0) ON CONFLICT (integration_id) DO UPDATE SET interval_seconds = excluded.interval_seconds";
    pub const GET: &str = "SELECT integration_id, interval_seconds, last_seen_at, alerted, alert_group_id FROM heartbeats WHERE integration_id = ?";
    pub const LIST_ACTIVE: &str = "SELECT h.integration_id, h.interval_seconds, h.last_seen_at, h.alerted, h.alert_group_id FROM heartbeats h JOIN integrations i ON i.integration_id = h.integration_id WHERE i.deleted_at IS NULL ORDER BY h.integration_id";
    pub const PING: &str = "UPDATE heartbeats SET last_seen_at = ?, alerted = 0, alert_group_id = NULL WHERE integration_id = ?";
    pub const OPEN_EPISODE: &str = "UPDATE heartbeats SET alerted = 1, alert_group_id = NULL WHERE integration_id = ? AND alerted = 0 AND last_seen_at = ?";
    pub const ABANDON_EPISODE: &str = "UPDATE heartbeats SET alerted = 0 WHERE integration_id = ? AND alerted = 1 AND alert_group_id IS NULL";
    pub const SET_EPISODE_GROUP: &str =
        "UPDATE heartbeats SET alert_group_id = ? WHERE integration_id = ? AND alerted = 1";
    pub const DELETE: &str = "DELETE FROM heartbeats WHERE integration_id = ?";
}

/// Slot that holds a moving rule while its neighbours shift.
const PARKED_POSITION: i64 = u32::MAX as i64;

fn to_i64(value: u64, what: &str) -> Result<i64, PersistenceError> {
    i64::try_from(value).map_err(|_| PersistenceError::InvalidInput(format!("{what} out of range")))
}

async fn insert_rule(
    conn: &mut SqliteConnection,
    integration_id: i64,
    position: i64,
    filter: &RouteFilter,
    escalation_chain_id: Option<i64>,
    chat_destinations: &[String],
) -> Result<RoutingRule, PersistenceError> {
    let row = sqlx::query_as::<_, RoutingRuleRow>(rule_sql::INSERT)
        .bind(integration_id)
        .bind(position)
        .bind(serde_json::to_string(filter)?)
        .bind(filter.is_match_all())
        .bind(escalation_chain_id)
        .bind(serde_json::to_string(chat_destinations)?)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("insert routing rule"))?;
    row.try_into()
}

async fn count_rules(conn: &mut SqliteConnection, integration_id: i64) -> Result<i64, PersistenceError> {
    sqlx::query_scalar::<_, i64>(rule_sql::COUNT_FOR_INTEGRATION)
        .bind(integration_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("count routing rules"))
}

async fn fetch_rule(
    conn: &mut SqliteConnection,
    rule_id: i64,
) -> Result<RoutingRule, PersistenceError> {
    sqlx::query_as::<_, RoutingRuleRow>(rule_sql::GET)
        .bind(rule_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("get routing rule"))?
        .ok_or_else(|| PersistenceError::NotFound(format!("routing rule {rule_id}")))?
        .try_into()
}

/// Shifts positions `lo..=hi` of an integration by one, up or down.
async fn shift_positions(
    conn: &mut SqliteConnection,
    integration_id: i64,
    lo: i64,
    hi: i64,
    up: bool,
) -> Result<(), PersistenceError> {
    if lo > hi {
        return Ok(());
    }
    sqlx::query(rule_sql::PARK_RANGE)
        .bind(integration_id)
        .bind(lo)
        .bind(hi)
        .execute(&mut *conn)
        .await
        .map_err(db_error("park routing rule positions"))?;
    let unpark = if up { rule_sql::UNPARK_SHIFT_UP } else { rule_sql::UNPARK_SHIFT_DOWN };
    sqlx::query(unpark)
        .bind(integration_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("shift routing rule positions"))?;
    Ok(())
}

#[async_trait]
impl AppRepository for SqliteStateRepository {
    #[tracing::instrument(skip(self, integration, default_destinations), level = "debug")]
    async fn create_integration(
        &self,
        integration: &NewIntegration,
        default_chain_id: Option<i64>,
        default_destinations: &[String],
        now: DateTime<Utc>,
    ) -> Result<Integration, PersistenceError> {
        tracing::debug!(name = %integration.name, "Creating integration.");
        let mut tx = self.begin_write().await?;

        let created: Integration = sqlx::query_as::<_, IntegrationRow>(integration_sql::INSERT)
            .bind(&integration.name)
            .bind(&integration.grouping_template)
            .bind(&integration.acknowledge_condition)
            .bind(&integration.resolve_condition)
            .bind(to_millis(now))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| match db_error("insert integration")(e) {
                PersistenceError::Conflict(_) => {
                    PersistenceError::AlreadyExists(format!("integration '{}'", integration.name))
                }
                other => other,
            })?
            .try_into()?;

        insert_rule(&mut tx, created.id, 0, &RouteFilter::MatchAll, default_chain_id, default_destinations)
            .await?;

        tx.commit().await.map_err(db_error("commit integration"))?;
        tracing::info!(integration_id = created.id, name = %created.name, "Integration created.");
        Ok(created)
    }

    #[tracing::instrument(skip(self, integration), level = "debug")]
    async fn update_integration(
        &self,
        integration_id: i64,
        integration: &NewIntegration,
    ) -> Result<Integration, PersistenceError> {
        self.execute_query_with_error_handling(
            "update integration",
            sqlx::query_as::<_, IntegrationRow>(integration_sql::UPDATE)
                .bind(&integration.name)
                .bind(&integration.grouping_template)
                .bind(&integration.acknowledge_condition)
                .bind(&integration.resolve_condition)
                .bind(integration_id)
                .fetch_optional(&self.pool),
        )
        .await?
        .ok_or_else(|| PersistenceError::NotFound(format!("integration {integration_id}")))?
        .try_into()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn get_integration(
        &self,
        integration_id: i64,
    ) -> Result<Option<Integration>, PersistenceError> {
        self.execute_query_with_error_handling(
            "get integration",
            sqlx::query_as::<_, IntegrationRow>(integration_sql::GET)
                .bind(integration_id)
                .fetch_optional(&self.pool),
        )
        .await?
        .map(Integration::try_from)
        .transpose()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn get_active_integration_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Integration>, PersistenceError> {
        self.execute_query_with_error_handling(
            "get integration by name",
            sqlx::query_as::<_, IntegrationRow>(integration_sql::GET_ACTIVE_BY_NAME)
                .bind(name)
                .fetch_optional(&self.pool),
        )
        .await?
        .map(Integration::try_from)
        .transpose()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn list_integrations(&self) -> Result<Vec<Integration>, PersistenceError> {
        let rows = self
            .execute_query_with_error_handling(
                "list integrations",
                sqlx::query_as::<_, IntegrationRow>(integration_sql::LIST_ACTIVE)
                    .fetch_all(&self.pool),
            )
            .await?;
        convert_all(rows)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn delete_integration(
        &self,
        integration_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut tx = self.begin_write().await?;
        let result = sqlx::query(integration_sql::SOFT_DELETE)
            .bind(to_millis(now))
            .bind(integration_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("soft-delete integration"))?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(format!("integration {integration_id}")));
        }
        sqlx::query(heartbeat_sql::DELETE)
            .bind(integration_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("delete heartbeat"))?;
        sqlx::query(maintenance_sql::DELETE)
            .bind(integration_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("delete maintenance window"))?;
        tx.commit().await.map_err(db_error("commit integration deletion"))?;
        tracing::info!(integration_id, "Integration soft-deleted.");
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn list_routing_rules(
        &self,
        integration_id: i64,
    ) -> Result<Vec<RoutingRule>, PersistenceError> {
        let rows = self
            .execute_query_with_error_handling(
                "list routing rules",
                sqlx::query_as::<_, RoutingRuleRow>(rule_sql::LIST_FOR_INTEGRATION)
                    .bind(integration_id)
                    .fetch_all(&self.pool),
            )
            .await?;
        convert_all(rows)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn list_all_routing_rules(&self) -> Result<Vec<RoutingRule>, PersistenceError> {
        let rows = self
            .execute_query_with_error_handling(
                "list all routing rules",
                sqlx::query_as::<_, RoutingRuleRow>(rule_sql::LIST_ACTIVE).fetch_all(&self.pool),
            )
            .await?;
        convert_all(rows)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn get_routing_rule(
        &self,
        rule_id: i64,
    ) -> Result<Option<RoutingRule>, PersistenceError> {
        self.execute_query_with_error_handling(
            "get routing rule",
            sqlx::query_as::<_, RoutingRuleRow>(rule_sql::GET).bind(rule_id).fetch_optional(&self.pool),
        )
        .await?
        .map(RoutingRule::try_from)
        .transpose()
    }

    #[tracing::instrument(skip(self, rule), level = "debug")]
    async fn insert_routing_rule(
        &self,
        integration_id: i64,
        rule: &NewRoutingRule,
        position: Option<u32>,
    ) -> Result<RoutingRule, PersistenceError> {
        if rule.filter.is_match_all() {
            return Err(PersistenceError::InvalidInput(
                "only the default rule may match everything".into(),
            ));
        }
        let mut tx = self.begin_write().await?;

        let count = count_rules(&mut tx, integration_id).await?;
        if count == 0 {
            return Err(PersistenceError::NotFound(format!("integration {integration_id}")));
        }
        let default_position = count - 1;
        let target = position.map_or(default_position, |p| i64::from(p).min(default_position));

        shift_positions(&mut tx, integration_id, target, default_position, true).await?;
        let created = insert_rule(
            &mut tx,
            integration_id,
            target,
            &rule.filter,
            rule.escalation_chain_id,
            &rule.chat_destinations,
        )
        .await?;

        tx.commit().await.map_err(db_error("commit routing rule"))?;
        tracing::info!(integration_id, rule_id = created.id, position = created.position, "Routing rule created.");
        Ok(created)
    }

    #[tracing::instrument(skip(self, rule), level = "debug")]
    async fn update_routing_rule(
        &self,
        rule_id: i64,
        rule: &NewRoutingRule,
    ) -> Result<RoutingRule, PersistenceError> {
        self.execute_query_with_error_handling(
            "update routing rule",
            sqlx::query_as::<_, RoutingRuleRow>(rule_sql::UPDATE)
                .bind(serde_json::to_string(&rule.filter)?)
                .bind(rule.escalation_chain_id)
                .bind(serde_json::to_string(&rule.chat_destinations)?)
                .bind(rule_id)
                .fetch_optional(&self.pool),
        )
        .await?
        .ok_or_else(|| PersistenceError::NotFound(format!("routing rule {rule_id}")))?
        .try_into()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn delete_routing_rule(&self, rule_id: i64) -> Result<RoutingRule, PersistenceError> {
        let mut tx = self.begin_write().await?;

        let rule = fetch_rule(&mut tx, rule_id).await?;
        if rule.is_default() {
            return Err(PersistenceError::InvalidInput(
                "the default routing rule cannot be deleted".into(),
            ));
        }
        sqlx::query(rule_sql::DELETE)
            .bind(rule_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("delete routing rule"))?;

        let count = count_rules(&mut tx, rule.integration_id).await?;
        shift_positions(&mut tx, rule.integration_id, i64::from(rule.position) + 1, count, false)
            .await?;

        tx.commit().await.map_err(db_error("commit routing rule deletion"))?;
        tracing::info!(rule_id, integration_id = rule.integration_id, "Routing rule deleted.");
        Ok(rule)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn move_routing_rule(
        &self,
        rule_id: i64,
        from: u32,
        to: u32,
        expected_rule_at_to: Option<i64>,
    ) -> Result<RoutingRule, PersistenceError> {
        let mut tx = self.begin_write().await?;

        let rule = fetch_rule(&mut tx, rule_id).await?;
        if rule.is_default() {
            return Err(PersistenceError::InvalidInput(
                "the default routing rule cannot be moved".into(),
            ));
        }
        if rule.position != from {
            return Err(PersistenceError::Conflict(format!(
                "routing rule {rule_id} is at position {}, not {from}",
                rule.position
            )));
        }
        let default_position = count_rules(&mut tx, rule.integration_id).await? - 1;
        let (from, to) = (i64::from(from), i64::from(to));
        if to >= default_position {
            return Err(PersistenceError::InvalidInput(
                "a routing rule cannot move past the default rule".into(),
            ));
        }
        let occupant: Option<i64> = sqlx::query_scalar(rule_sql::RULE_AT_POSITION)
            .bind(rule.integration_id)
            .bind(to)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("get rule at position"))?;
        if let Some(expected) = expected_rule_at_to
            && occupant != Some(expected)
        {
            return Err(PersistenceError::Conflict(format!(
                "position {to} is held by {occupant:?}, not rule {expected}"
            )));
        }
        if from == to {
            return Ok(rule);
        }

        // Park the moved rule out of the way, shift the rules between, drop
        // the moved rule into place.
        sqlx::query(rule_sql::SET_POSITION)
            .bind(PARKED_POSITION)
            .bind(rule_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("park moved rule"))?;
        if from < to {
            shift_positions(&mut tx, rule.integration_id, from + 1, to, false).await?;
        } else {
            shift_positions(&mut tx, rule.integration_id, to, from - 1, true).await?;
        }
        sqlx::query(rule_sql::SET_POSITION)
            .bind(to)
            .bind(rule_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("place moved rule"))?;

        let moved = fetch_rule(&mut tx, rule_id).await?;
        tx.commit().await.map_err(db_error("commit routing rule move"))?;
        tracing::info!(rule_id, from, to, "Routing rule moved.");
        Ok(moved)
    }

    #[tracing::instrument(skip(self, rules, default_destinations), level = "debug")]
    async fn replace_routing_rules(
        &self,
        integration_id: i64,
        rules: &[NewRoutingRule],
        default_chain_id: Option<i64>,
        default_destinations: &[String],
    ) -> Result<Vec<RoutingRule>, PersistenceError> {
        if rules.iter().any(|r| r.filter.is_match_all()) {
            return Err(PersistenceError::InvalidInput(
                "only the default rule may match everything".into(),
            ));
        }
        let mut tx = self.begin_write().await?;
        sqlx::query(rule_sql::DELETE_FOR_INTEGRATION)
            .bind(integration_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("delete routing rules"))?;

        let mut stored = Vec::with_capacity(rules.len() + 1);
        for (position, rule) in rules.iter().enumerate() {
            stored.push(
                insert_rule(
                    &mut tx,
                    integration_id,
                    position as i64,
                    &rule.filter,
                    rule.escalation_chain_id,
                    &rule.chat_destinations,
                )
                .await?,
            );
        }
        stored.push(
            insert_rule(
                &mut tx,
                integration_id,
                rules.len() as i64,
                &RouteFilter::MatchAll,
                default_chain_id,
                default_destinations,
            )
            .await?,
        );

        tx.commit().await.map_err(db_error("commit routing rules"))?;
        tracing::debug!(integration_id, count = stored.len(), "Routing rules replaced.");
        Ok(stored)
    }

    #[tracing::instrument(skip(self, chain), level = "debug")]
    async fn create_escalation_chain(
        &self,
        chain: &EscalationChainConfig,
        ephemeral: bool,
        now: DateTime<Utc>,
    ) -> Result<EscalationChain, PersistenceError> {
        let row = sqlx::query_as::<_, EscalationChainRow>(chain_sql::INSERT)
            .bind(&chain.name)
            .bind(serde_json::to_string(&chain.steps)?)
            .bind(ephemeral)
            .bind(to_millis(now))
            .bind(to_millis(now))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match db_error("insert escalation chain")(e) {
                PersistenceError::Conflict(_) => {
                    PersistenceError::AlreadyExists(format!("escalation chain '{}'", chain.name))
                }
                other => other,
            })?;
        row.try_into()
    }

    #[tracing::instrument(skip(self, chain), level = "debug")]
    async fn update_escalation_chain(
        &self,
        chain_id: i64,
        chain: &EscalationChainConfig,
        now: DateTime<Utc>,
    ) -> Result<EscalationChain, PersistenceError> {
        self.execute_query_with_error_handling(
            "update escalation chain",
            sqlx::query_as::<_, EscalationChainRow>(chain_sql::UPDATE)
                .bind(&chain.name)
                .bind(serde_json::to_string(&chain.steps)?)
                .bind(to_millis(now))
                .bind(chain_id)
                .fetch_optional(&self.pool),
        )
        .await?
        .ok_or_else(|| PersistenceError::NotFound(format!("escalation chain {chain_id}")))?
        .try_into()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn get_escalation_chain(
        &self,
        chain_id: i64,
    ) -> Result<Option<EscalationChain>, PersistenceError> {
        self.execute_query_with_error_handling(
            "get escalation chain",
            sqlx::query_as::<_, EscalationChainRow>(chain_sql::GET)
                .bind(chain_id)
                .fetch_optional(&self.pool),
        )
        .await?
        .map(EscalationChain::try_from)
        .transpose()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn get_escalation_chain_by_name(
        &self,
        name: &str,
    ) -> Result<Option<EscalationChain>, PersistenceError> {
        self.execute_query_with_error_handling(
            "get escalation chain by name",
            sqlx::query_as::<_, EscalationChainRow>(chain_sql::GET_BY_NAME)
                .bind(name)
                .fetch_optional(&self.pool),
        )
        .await?
        .map(EscalationChain::try_from)
        .transpose()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn list_escalation_chains(&self) -> Result<Vec<EscalationChain>, PersistenceError> {
        let rows = self
            .execute_query_with_error_handling(
                "list escalation chains",
                sqlx::query_as::<_, EscalationChainRow>(chain_sql::LIST).fetch_all(&self.pool),
            )
            .await?;
        convert_all(rows)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn delete_escalation_chain(&self, chain_id: i64) -> Result<(), PersistenceError> {
        let mut tx = self.begin_write().await?;
        let references: i64 = sqlx::query_scalar(rule_sql::COUNT_USING_CHAIN)
            .bind(chain_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("count chain references"))?;
        if references > 0 {
            return Err(PersistenceError::Conflict(format!(
                "escalation chain {chain_id} is referenced by {references} routing rule(s)"
            )));
        }
        let result = sqlx::query(chain_sql::DELETE)
            .bind(chain_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("delete escalation chain"))?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(format!("escalation chain {chain_id}")));
        }
        tx.commit().await.map_err(db_error("commit escalation chain deletion"))?;
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn advance_round_robin(
        &self,
        chain_id: i64,
        step_index: usize,
    ) -> Result<u64, PersistenceError> {
        let counter: i64 = self
            .execute_query_with_error_handling(
                "advance round robin",
                sqlx::query_scalar(chain_sql::ADVANCE_ROUND_ROBIN)
                    .bind(chain_id)
                    .bind(step_index as i64)
                    .fetch_one(&self.pool),
            )
            .await?;
        u64::try_from(counter).map_err(|e| PersistenceError::SerializationError(e.to_string()))
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn get_notification_policy(
        &self,
        user_id: &str,
    ) -> Result<Option<NotificationPolicy>, PersistenceError> {
        let policy: Option<String> = self
            .execute_query_with_error_handling(
                "get notification policy",
                sqlx::query_scalar(policy_sql::GET).bind(user_id).fetch_optional(&self.pool),
            )
            .await?;
        policy.map(|p| serde_json::from_str(&p).map_err(PersistenceError::from)).transpose()
    }

    #[tracing::instrument(skip(self, policy), fields(user_id = %policy.user_id), level = "debug")]
    async fn upsert_notification_policy(
        &self,
        policy: &NotificationPolicy,
    ) -> Result<(), PersistenceError> {
        self.execute_query_with_error_handling(
            "upsert notification policy",
            sqlx::query(policy_sql::UPSERT)
                .bind(&policy.user_id)
                .bind(serde_json::to_string(policy)?)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn get_maintenance_window(
        &self,
        integration_id: i64,
    ) -> Result<Option<MaintenanceWindow>, PersistenceError> {
        self.execute_query_with_error_handling(
            "get maintenance window",
            sqlx::query_as::<_, MaintenanceWindowRow>(maintenance_sql::GET)
                .bind(integration_id)
                .fetch_optional(&self.pool),
        )
        .await?
        .map(MaintenanceWindow::try_from)
        .transpose()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn upsert_maintenance_window(
        &self,
        window: &MaintenanceWindow,
    ) -> Result<(), PersistenceError> {
        self.execute_query_with_error_handling(
            "upsert maintenance window",
            sqlx::query(maintenance_sql::UPSERT)
                .bind(window.integration_id)
                .bind(window.mode.as_str())
                .bind(to_millis(window.started_at))
                .bind(to_millis(window.expires_at))
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn delete_maintenance_window(
        &self,
        integration_id: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, PersistenceError> {
        let query = match expires_at {
            Some(at) => sqlx::query(maintenance_sql::DELETE_IF_EXPIRES_AT)
                .bind(integration_id)
                .bind(to_millis(at)),
            None => sqlx::query(maintenance_sql::DELETE).bind(integration_id),
        };
        let result = self
            .execute_query_with_error_handling("delete maintenance window", query.execute(&self.pool))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn list_maintenance_windows(&self) -> Result<Vec<MaintenanceWindow>, PersistenceError> {
        let rows = self
            .execute_query_with_error_handling(
                "list maintenance windows",
                sqlx::query_as::<_, MaintenanceWindowRow>(maintenance_sql::LIST)
                    .fetch_all(&self.pool),
            )
            .await?;
        convert_all(rows)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn upsert_heartbeat(
        &self,
        integration_id: i64,
        interval_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatConfig, PersistenceError> {
        self.execute_query_with_error_handling(
            "upsert heartbeat",
            sqlx::query(heartbeat_sql::UPSERT)
                .bind(integration_id)
                .bind(to_i64(interval_seconds, "heartbeat interval")?)
                .bind(to_millis(now))
                .execute(&self.pool),
        )
        .await?;
        self.get_heartbeat(integration_id)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(format!("heartbeat {integration_id}")))
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn get_heartbeat(
        &self,
        integration_id: i64,
    ) -> Result<Option<HeartbeatConfig>, PersistenceError> {
        self.execute_query_with_error_handling(
            "get heartbeat",
            sqlx::query_as::<_, HeartbeatRow>(heartbeat_sql::GET)
                .bind(integration_id)
                .fetch_optional(&self.pool),
        )
        .await?
        .map(HeartbeatConfig::try_from)
        .transpose()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn list_heartbeats(&self) -> Result<Vec<HeartbeatConfig>, PersistenceError> {
        let rows = self
            .execute_query_with_error_handling(
                "list heartbeats",
                sqlx::query_as::<_, HeartbeatRow>(heartbeat_sql::LIST_ACTIVE).fetch_all(&self.pool),
            )
            .await?;
        convert_all(rows)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn record_heartbeat_ping(
        &self,
        integration_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<HeartbeatConfig>, PersistenceError> {
        let mut tx = self.begin_write().await?;
        let previous: Option<HeartbeatConfig> = sqlx::query_as::<_, HeartbeatRow>(heartbeat_sql::GET)
            .bind(integration_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("get heartbeat"))?
            .map(HeartbeatConfig::try_from)
            .transpose()?;
        if previous.is_none() {
            return Ok(None);
        }
        sqlx::query(heartbeat_sql::PING)
            .bind(to_millis(now))
            .bind(integration_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("record heartbeat ping"))?;
        tx.commit().await.map_err(db_error("commit heartbeat ping"))?;
        Ok(previous)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn open_heartbeat_episode(
        &self,
        integration_id: i64,
        last_seen_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let result = self
            .execute_query_with_error_handling(
                "open heartbeat episode",
                sqlx::query(heartbeat_sql::OPEN_EPISODE)
                    .bind(integration_id)
                    .bind(to_millis(last_seen_at))
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn set_heartbeat_episode_group(
        &self,
        integration_id: i64,
        alert_group_id: i64,
    ) -> Result<bool, PersistenceError> {
        let result = self
            .execute_query_with_error_handling(
                "set heartbeat episode group",
                sqlx::query(heartbeat_sql::SET_EPISODE_GROUP)
                    .bind(alert_group_id)
                    .bind(integration_id)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn abandon_heartbeat_episode(&self, integration_id: i64) -> Result<bool, PersistenceError> {
        let result = self
            .execute_query_with_error_handling(
                "abandon heartbeat episode",
                sqlx::query(heartbeat_sql::ABANDON_EPISODE).bind(integration_id).execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn delete_heartbeat(&self, integration_id: i64) -> Result<bool, PersistenceError> {
        let result = self
            .execute_query_with_error_handling(
                "delete heartbeat",
                sqlx::query(heartbeat_sql::DELETE).bind(integration_id).execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::models::{EscalationStep, MaintenanceMode, NotificationTier};

    async fn setup_test_db() -> SqliteStateRepository {
        let repo = SqliteStateRepository::new("sqlite::memory:")
            .await
            .expect("Failed to connect to in-memory db");
        repo.run_migrations().await.expect("Failed to run migrations");
        repo
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn template(expr: &str) -> NewRoutingRule {
        NewRoutingRule {
            filter: RouteFilter::Template(expr.into()),
            escalation_chain_id: None,
            chat_destinations: vec![],
        }
    }

    async fn create_integration(repo: &SqliteStateRepository, name: &str) -> Integration {
        repo.create_integration(
            &NewIntegration { name: name.into(), ..Default::default() },
            None,
            &[],
            now(),
        )
        .await
        .unwrap()
    }

    fn filters(rules: &[RoutingRule]) -> Vec<RouteFilter> {
        rules.iter().map(|r| r.filter.clone()).collect()
    }

    #[tokio::test]
    async fn test_create_integration_creates_default_rule() {
        let repo = setup_test_db().await;
        let integration = create_integration(&repo, "grafana").await;

        let rules = repo.list_routing_rules(integration.id).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].is_default());
        assert_eq!(rules[0].position, 0);
    }

    #[tokio::test]
    async fn test_duplicate_active_integration_name_is_rejected() {
        let repo = setup_test_db().await;
        let first = create_integration(&repo, "grafana").await;
        let duplicate = repo
            .create_integration(
                &NewIntegration { name: "grafana".into(), ..Default::default() },
                None,
                &[],
                now(),
            )
            .await;
        assert!(matches!(duplicate, Err(PersistenceError::AlreadyExists(_))));

        // The name is free again once the first integration is deleted.
        repo.delete_integration(first.id, now()).await.unwrap();
        create_integration(&repo, "grafana").await;
        assert!(repo.get_integration(first.id).await.unwrap().unwrap().is_deleted());
    }

    #[tokio::test]
    async fn test_insert_rules_stay_before_default() {
        let repo = setup_test_db().await;
        let integration = create_integration(&repo, "grafana").await;

        repo.insert_routing_rule(integration.id, &template("a"), None).await.unwrap();
        repo.insert_routing_rule(integration.id, &template("b"), None).await.unwrap();
        repo.insert_routing_rule(integration.id, &template("first"), Some(0)).await.unwrap();
        repo.insert_routing_rule(integration.id, &template("clamped"), Some(99)).await.unwrap();

        let rules = repo.list_routing_rules(integration.id).await.unwrap();
        assert_eq!(
            filters(&rules),
            vec![
                RouteFilter::Template("first".into()),
                RouteFilter::Template("a".into()),
                RouteFilter::Template("b".into()),
                RouteFilter::Template("clamped".into()),
                RouteFilter::MatchAll,
            ]
        );
        let positions: Vec<u32> = rules.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_delete_rule_densifies_and_default_is_protected() {
        let repo = setup_test_db().await;
        let integration = create_integration(&repo, "grafana").await;
        let a = repo.insert_routing_rule(integration.id, &template("a"), None).await.unwrap();
        repo.insert_routing_rule(integration.id, &template("b"), None).await.unwrap();

        repo.delete_routing_rule(a.id).await.unwrap();
        let rules = repo.list_routing_rules(integration.id).await.unwrap();
        assert_eq!(rules.iter().map(|r| r.position).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(rules[0].filter, RouteFilter::Template("b".into()));

        let default = rules.last().unwrap();
        assert!(matches!(
            repo.delete_routing_rule(default.id).await,
            Err(PersistenceError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_move_rule_both_directions() {
        let repo = setup_test_db().await;
        let integration = create_integration(&repo, "grafana").await;
        let a = repo.insert_routing_rule(integration.id, &template("a"), None).await.unwrap();
        let b = repo.insert_routing_rule(integration.id, &template("b"), None).await.unwrap();
        let c = repo.insert_routing_rule(integration.id, &template("c"), None).await.unwrap();

        repo.move_routing_rule(a.id, 0, 2, Some(c.id)).await.unwrap();
        let rules = repo.list_routing_rules(integration.id).await.unwrap();
        assert_eq!(rules.iter().map(|r| r.id).take(3).collect::<Vec<_>>(), vec![b.id, c.id, a.id]);

        repo.move_routing_rule(a.id, 2, 0, None).await.unwrap();
        let rules = repo.list_routing_rules(integration.id).await.unwrap();
        assert_eq!(rules.iter().map(|r| r.id).take(3).collect::<Vec<_>>(), vec![a.id, b.id, c.id]);
        assert_eq!(rules.iter().map(|r| r.position).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_move_rule_rejects_drift_and_default_crossing() {
        let repo = setup_test_db().await;
        let integration = create_integration(&repo, "grafana").await;
        let a = repo.insert_routing_rule(integration.id, &template("a"), None).await.unwrap();
        let b = repo.insert_routing_rule(integration.id, &template("b"), None).await.unwrap();

        // Caller thinks `a` is at position 1.
        assert!(matches!(
            repo.move_routing_rule(a.id, 1, 0, None).await,
            Err(PersistenceError::Conflict(_))
        ));
        // Caller thinks `a` occupies the target.
        assert!(matches!(
            repo.move_routing_rule(b.id, 1, 0, Some(b.id)).await,
            Err(PersistenceError::Conflict(_))
        ));
        // Target is the default rule's slot.
        assert!(matches!(
            repo.move_routing_rule(a.id, 0, 2, None).await,
            Err(PersistenceError::InvalidInput(_))
        ));

        let rules = repo.list_routing_rules(integration.id).await.unwrap();
        assert_eq!(rules.iter().map(|r| r.id).take(2).collect::<Vec<_>>(), vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_replace_routing_rules_appends_default() {
        let repo = setup_test_db().await;
        let integration = create_integration(&repo, "grafana").await;
        repo.insert_routing_rule(integration.id, &template("old"), None).await.unwrap();

        let stored = repo
            .replace_routing_rules(integration.id, &[template("x"), template("y")], None, &["#ops".into()])
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored[2].is_default());
        assert_eq!(stored[2].chat_destinations, vec!["#ops".to_string()]);
        assert_eq!(repo.list_routing_rules(integration.id).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn test_chain_delete_refused_while_referenced() {
        let repo = setup_test_db().await;
        let integration = create_integration(&repo, "grafana").await;
        let chain = repo
            .create_escalation_chain(
                &EscalationChainConfig {
                    name: "primary".into(),
                    steps: vec![EscalationStep::NotifyUsers {
                        user_ids: vec!["alice".into()],
                        tier: NotificationTier::Default,
                    }],
                },
                false,
                now(),
            )
            .await
            .unwrap();
        let rule = repo
            .insert_routing_rule(
                integration.id,
                &NewRoutingRule { escalation_chain_id: Some(chain.id), ..template("x") },
                None,
            )
            .await
            .unwrap();

        assert!(matches!(
            repo.delete_escalation_chain(chain.id).await,
            Err(PersistenceError::Conflict(_))
        ));
        repo.delete_routing_rule(rule.id).await.unwrap();
        repo.delete_escalation_chain(chain.id).await.unwrap();
        assert!(repo.get_escalation_chain(chain.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ephemeral_chains_are_hidden_and_unnamed() {
        let repo = setup_test_db().await;
        let config = EscalationChainConfig { name: "page".into(), steps: vec![] };
        repo.create_escalation_chain(&config, true, now()).await.unwrap();
        repo.create_escalation_chain(&config, true, now()).await.unwrap();

        assert!(repo.list_escalation_chains().await.unwrap().is_empty());
        assert!(repo.get_escalation_chain_by_name("page").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_round_robin_counter_per_step() {
        let repo = setup_test_db().await;
        assert_eq!(repo.advance_round_robin(1, 0).await.unwrap(), 0);
        assert_eq!(repo.advance_round_robin(1, 0).await.unwrap(), 1);
        assert_eq!(repo.advance_round_robin(1, 1).await.unwrap(), 0);
        assert_eq!(repo.advance_round_robin(1, 0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_maintenance_conditional_delete() {
        let repo = setup_test_db().await;
        let integration = create_integration(&repo, "grafana").await;
        let window = MaintenanceWindow {
            integration_id: integration.id,
            mode: MaintenanceMode::Debug,
            started_at: now(),
            expires_at: now() + Duration::hours(1),
        };
        repo.upsert_maintenance_window(&window).await.unwrap();

        let replaced = MaintenanceWindow { expires_at: now() + Duration::hours(3), ..window.clone() };
        repo.upsert_maintenance_window(&replaced).await.unwrap();

        // A stale timer for the first window must not remove the replacement.
        assert!(!repo.delete_maintenance_window(integration.id, Some(window.expires_at)).await.unwrap());
        assert_eq!(repo.get_maintenance_window(integration.id).await.unwrap(), Some(replaced.clone()));
        assert!(repo.delete_maintenance_window(integration.id, Some(replaced.expires_at)).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_episode_lifecycle() {
        let repo = setup_test_db().await;
        let integration = create_integration(&repo, "cron").await;
        let hb = repo.upsert_heartbeat(integration.id, 60, now()).await.unwrap();
        assert!(!hb.alerted);

        assert!(repo.open_heartbeat_episode(integration.id, hb.last_seen_at).await.unwrap());
        assert!(repo.abandon_heartbeat_episode(integration.id).await.unwrap());
        assert!(repo.open_heartbeat_episode(integration.id, hb.last_seen_at).await.unwrap());
        assert!(!repo.open_heartbeat_episode(integration.id, hb.last_seen_at).await.unwrap());
        assert!(repo.set_heartbeat_episode_group(integration.id, 42).await.unwrap());
        // An episode with a group stays open.
        assert!(!repo.abandon_heartbeat_episode(integration.id).await.unwrap());

        let previous = repo
            .record_heartbeat_ping(integration.id, now() + Duration::seconds(90))
            .await
            .unwrap()
            .unwrap();
        assert!(previous.alerted);
        assert_eq!(previous.alert_group_id, Some(42));

        let current = repo.get_heartbeat(integration.id).await.unwrap().unwrap();
        assert!(!current.alerted);
        assert_eq!(current.last_seen_at, now() + Duration::seconds(90));
    }

    #[tokio::test]
    async fn test_deleted_integration_drops_heartbeat() {
        let repo = setup_test_db().await;
        let integration = create_integration(&repo, "cron").await;
        repo.upsert_heartbeat(integration.id, 60, now()).await.unwrap();

        repo.delete_integration(integration.id, now()).await.unwrap();
        assert!(repo.list_heartbeats().await.unwrap().is_empty());
        assert!(matches!(
            repo.delete_integration(integration.id, now()).await,
            Err(PersistenceError::NotFound(_))
        ));
    }
}
