//! Direct paging requests.

use serde::{Deserialize, Serialize};

use crate::models::escalation::NotificationTier;

/// Kind of a paged participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResponderType {
    /// A single user.
    User,
    /// Every member of a team.
    Team,
}

/// A participant of a direct-paging request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Responder {
    /// User or team.
    #[serde(rename = "type")]
    pub responder_type: ResponderType,
    /// External id.
    pub id: String,
    /// Policy tier.
    #[serde(default)]
    pub tier: NotificationTier,
}

/// A request to page people directly, bypassing routing rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PagingRequest {
    /// Integration the page is recorded under.
    pub integration_id: i64,
    /// Short title.
    pub title: String,
    /// Optional body.
    #[serde(default)]
    pub message: Option<String>,
    /// Who to page.
    pub responders: Vec<Responder>,
}
