use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{NotifierError, OnCallResolver};
use crate::models::on_call::{ScheduleConfig, TeamConfig};

/// Resolves schedules and teams from static configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticOnCallResolver {
    schedules: HashMap<String, ScheduleConfig>,
    teams: HashMap<String, TeamConfig>,
}

impl StaticOnCallResolver {
    /// Indexes the given schedules and teams by id.
    pub fn new(schedules: Vec<ScheduleConfig>, teams: Vec<TeamConfig>) -> Self {
        Self {
            schedules: schedules.into_iter().map(|s| (s.id.clone(), s)).collect(),
            teams: teams.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }
}

#[async_trait]
impl OnCallResolver for StaticOnCallResolver {
    async fn current_on_call(
        &self,
        schedule_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, NotifierError> {
        let schedule = self
            .schedules
            .get(schedule_id)
            .ok_or_else(|| NotifierError::UnknownSchedule(schedule_id.to_string()))?;
        let users: BTreeSet<&String> = schedule
            .layers
            .iter()
            .filter(|layer| layer.window.is_none_or(|w| w.contains(at)))
            .flat_map(|layer| layer.users.iter())
            .collect();
        Ok(users.into_iter().cloned().collect())
    }

    async fn team_members(&self, team_id: &str) -> Result<Vec<String>, NotifierError> {
        self.teams
            .get(team_id)
            .map(|team| team.members.clone())
            .ok_or_else(|| NotifierError::UnknownTeam(team_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveTime, TimeZone};

    use super::*;
    use crate::models::{UtcTimeRange, on_call::ScheduleLayer};

    fn resolver() -> StaticOnCallResolver {
        let hours = |from: u32, to: u32| {
            UtcTimeRange::new(
                NaiveTime::from_hms_opt(from, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(to, 0, 0).unwrap(),
            )
        };
        StaticOnCallResolver::new(
            vec![ScheduleConfig {
                id: "primary".into(),
                layers: vec![
                    ScheduleLayer { users: vec!["day".into()], window: Some(hours(9, 21)) },
                    ScheduleLayer { users: vec!["night".into()], window: Some(hours(21, 9)) },
                    ScheduleLayer { users: vec!["lead".into(), "day".into()], window: None },
                ],
            }],
            vec![TeamConfig { id: "sre".into(), members: vec!["a".into(), "b".into()] }],
        )
    }

    #[tokio::test]
    async fn test_layers_by_time_of_day() {
        let resolver = resolver();
        let noon = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        assert_eq!(resolver.current_on_call("primary", noon).await.unwrap(), vec!["day", "lead"]);
        assert_eq!(
            resolver.current_on_call("primary", midnight).await.unwrap(),
            vec!["day", "lead", "night"]
        );
    }

    #[tokio::test]
    async fn test_unknown_ids_are_errors() {
        let resolver = resolver();
        assert!(matches!(
            resolver.current_on_call("nope", Utc::now()).await,
            Err(NotifierError::UnknownSchedule(_))
        ));
        assert!(matches!(resolver.team_members("nope").await, Err(NotifierError::UnknownTeam(_))));
        assert_eq!(resolver.team_members("sre").await.unwrap(), vec!["a", "b"]);
    }
}
