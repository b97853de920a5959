//! Ledger entities and the inputs used to create them

use crate::{
    DecisionId, DecisionStatus, MemberRole, ParticipantRole, ProjectId, ProjectStatus,
    SourceKind, TagName, Timestamp, UserId, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Maximum length of a project name.
pub const MAX_PROJECT_NAME_LEN: usize = 200;

/// Maximum length of a decision title.
pub const MAX_DECISION_TITLE_LEN: usize = 500;

// ============================================================================
// PROJECTS
// ============================================================================

/// A project groups members and the decisions they record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub owner_id: UserId,
    #[serde(default)]
    pub status: ProjectStatus,
    /// Chat channels whose messages feed this project.
    #[serde(default)]
    pub slack_channels: Vec<String>,
    /// Channel that receives decision announcements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_channel: Option<String>,
    /// Decisions captured from meetings start out confirmed.
    #[serde(default)]
    pub auto_confirm_meeting_decisions: bool,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    pub version: u64,
}

impl Project {
    pub fn is_archived(&self) -> bool {
        self.status == ProjectStatus::Archived
    }
}

/// Membership of a user in a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ProjectMember {
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub role: MemberRole,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub joined_at: Timestamp,
    pub version: u64,
}

/// Input for creating a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProject {
    pub name: String,
    pub owner_id: UserId,
    pub description: Option<String>,
    pub slack_channels: Vec<String>,
    pub notification_channel: Option<String>,
    pub auto_confirm_meeting_decisions: bool,
}

impl NewProject {
    pub fn new(name: impl Into<String>, owner_id: UserId) -> Self {
        Self {
            name: name.into(),
            owner_id,
            description: None,
            slack_channels: Vec::new(),
            notification_channel: None,
            auto_confirm_meeting_decisions: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_slack_channel(mut self, channel: impl Into<String>) -> Self {
        self.slack_channels.push(channel.into());
        self
    }

    pub fn with_notification_channel(mut self, channel: impl Into<String>) -> Self {
        self.notification_channel = Some(channel.into());
        self
    }

    pub fn with_auto_confirm_meeting_decisions(mut self, enabled: bool) -> Self {
        self.auto_confirm_meeting_decisions = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name("name", &self.name, MAX_PROJECT_NAME_LEN)
    }
}

/// Partial update of a project's settings. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSettingsUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub slack_channels: Option<Vec<String>>,
    pub notification_channel: Option<String>,
    pub auto_confirm_meeting_decisions: Option<bool>,
}

impl ProjectSettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.slack_channels.is_none()
            && self.notification_channel.is_none()
            && self.auto_confirm_meeting_decisions.is_none()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.name {
            Some(name) => validate_name("name", name, MAX_PROJECT_NAME_LEN),
            None => Ok(()),
        }
    }

    /// Apply the update to a copy of `project`. Version and timestamps are left to the caller.
    pub fn apply_to(&self, project: &Project) -> Project {
        let mut updated = project.clone();
        if let Some(name) = &self.name {
            updated.name = name.clone();
        }
        if let Some(description) = &self.description {
            updated.description = Some(description.clone());
        }
        if let Some(channels) = &self.slack_channels {
            updated.slack_channels = channels.clone();
        }
        if let Some(channel) = &self.notification_channel {
            updated.notification_channel = Some(channel.clone());
        }
        if let Some(enabled) = self.auto_confirm_meeting_decisions {
            updated.auto_confirm_meeting_decisions = enabled;
        }
        updated
    }
}

// ============================================================================
// DECISIONS
// ============================================================================

/// Provenance of a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DecisionSource {
    pub kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub timestamp: Option<Timestamp>,
}

impl DecisionSource {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            channel: None,
            url: None,
            timestamp: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A recorded decision.
///
/// `created_at` and `project_id` never change. `supersedes_id` is written once,
/// at creation. `status` only moves forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Decision {
    pub id: DecisionId,
    pub project_id: ProjectId,
    pub title: String,
    pub body: String,
    /// Message text the decision was extracted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
    pub status: DecisionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes_id: Option<DecisionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DecisionSource>,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub updated_at: Timestamp,
    pub version: u64,
}

/// A participant requested while creating a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSpec {
    pub user_id: UserId,
    pub role: ParticipantRole,
}

/// Input for creating a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDecision {
    pub project_id: ProjectId,
    pub title: String,
    pub body: String,
    pub raw_content: Option<String>,
    pub participants: Vec<ParticipantSpec>,
    pub supersedes_id: Option<DecisionId>,
    pub author_id: Option<UserId>,
    pub source: Option<DecisionSource>,
}

impl NewDecision {
    pub fn new(project_id: ProjectId, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            project_id,
            title: title.into(),
            body: body.into(),
            raw_content: None,
            participants: Vec::new(),
            supersedes_id: None,
            author_id: None,
            source: None,
        }
    }

    pub fn with_participant(mut self, user_id: UserId, role: ParticipantRole) -> Self {
        self.participants.push(ParticipantSpec { user_id, role });
        self
    }

    pub fn superseding(mut self, decision_id: DecisionId) -> Self {
        self.supersedes_id = Some(decision_id);
        self
    }

    pub fn with_author(mut self, author_id: UserId) -> Self {
        self.author_id = Some(author_id);
        self
    }

    pub fn with_source(mut self, source: DecisionSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_raw_content(mut self, raw_content: impl Into<String>) -> Self {
        self.raw_content = Some(raw_content.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name("title", &self.title, MAX_DECISION_TITLE_LEN)?;

        let mut seen = HashSet::new();
        for participant in &self.participants {
            if !seen.insert(&participant.user_id) {
                return Err(ValidationError::InvalidValue {
                    field: "participants".to_string(),
                    reason: format!("{} is listed more than once", participant.user_id),
                });
            }
        }
        Ok(())
    }
}

/// A user attached to a decision's approval flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct DecisionParticipant {
    pub decision_id: DecisionId,
    pub user_id: UserId,
    pub role: ParticipantRole,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub added_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<String>, format = "date-time"))]
    pub responded_at: Option<Timestamp>,
    pub version: u64,
}

// ============================================================================
// TAGS
// ============================================================================

/// The item a tag hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum TagTarget {
    Project(ProjectId),
    Decision(DecisionId),
}

/// Association of a label with a project or decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Tag {
    pub target: TagTarget,
    pub name: TagName,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub created_at: Timestamp,
    pub version: u64,
}

fn validate_name(field: &str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: field.to_string(),
        });
    }
    let actual = value.chars().count();
    if actual > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    #[test]
    fn test_new_decision_rejects_duplicate_participants() {
        let input = NewDecision::new(ProjectId::new(), "Adopt LMDB", "")
            .with_participant(user("U001"), ParticipantRole::Decider)
            .with_participant(user("U001"), ParticipantRole::Approver);
        assert!(matches!(
            input.validate(),
            Err(ValidationError::InvalidValue { ref field, .. }) if field == "participants"
        ));
    }

    #[test]
    fn test_blank_title_rejected() {
        let input = NewDecision::new(ProjectId::new(), "   ", "body");
        assert_eq!(
            input.validate(),
            Err(ValidationError::RequiredFieldMissing {
                field: "title".to_string()
            })
        );
    }

    #[test]
    fn test_settings_update_applies_only_given_fields() {
        let now = Utc::now();
        let project = Project {
            id: ProjectId::new(),
            name: "Backend Rewrite".to_string(),
            description: None,
            owner_id: user("U001"),
            status: ProjectStatus::Active,
            slack_channels: vec!["#backend".to_string()],
            notification_channel: None,
            auto_confirm_meeting_decisions: false,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        let update = ProjectSettingsUpdate {
            auto_confirm_meeting_decisions: Some(true),
            notification_channel: Some("#backend-decisions".to_string()),
            ..Default::default()
        };

        let updated = update.apply_to(&project);
        assert_eq!(updated.name, project.name);
        assert_eq!(updated.slack_channels, project.slack_channels);
        assert!(updated.auto_confirm_meeting_decisions);
        assert_eq!(
            updated.notification_channel.as_deref(),
            Some("#backend-decisions")
        );
        assert!(ProjectSettingsUpdate::default().is_empty());
    }

    #[test]
    fn test_decision_optional_fields_roundtrip() {
        let now = crate::truncate_to_micros(Utc::now());
        let bare = Decision {
            id: DecisionId::new(),
            project_id: ProjectId::new(),
            title: "Use DynamoDB".to_string(),
            body: String::new(),
            raw_content: None,
            status: DecisionStatus::Open,
            supersedes_id: None,
            author_id: None,
            source: None,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        let json = serde_json::to_value(&bare).unwrap();
        assert!(json.get("supersedes_id").is_none());
        assert_eq!(serde_json::from_value::<Decision>(json).unwrap(), bare);

        let full = Decision {
            supersedes_id: Some(DecisionId::new()),
            author_id: Some(user("U002")),
            source: Some(
                DecisionSource::new(SourceKind::Slack)
                    .with_channel("#backend")
                    .with_timestamp(now),
            ),
            ..bare
        };
        let json = serde_json::to_value(&full).unwrap();
        assert_eq!(serde_json::from_value::<Decision>(json).unwrap(), full);
    }

    #[cfg(feature = "openapi")]
    #[test]
    fn test_schema_documents_timestamps_as_date_time() -> Result<(), String> {
        use utoipa::PartialSchema;

        let format = |schema: serde_json::Value, field: &str| {
            schema["properties"][field]["format"].as_str().map(str::to_string)
        };
        let to_json = |schema| serde_json::to_value(schema).map_err(|e| e.to_string());

        let decision = to_json(Decision::schema())?;
        assert_eq!(format(decision.clone(), "created_at").as_deref(), Some("date-time"));
        assert_eq!(format(decision, "updated_at").as_deref(), Some("date-time"));
        let participant = to_json(DecisionParticipant::schema())?;
        assert_eq!(format(participant, "responded_at").as_deref(), Some("date-time"));
        let member = to_json(ProjectMember::schema())?;
        assert_eq!(format(member, "joined_at").as_deref(), Some("date-time"));
        let tag = to_json(Tag::schema())?;
        assert_eq!(format(tag, "created_at").as_deref(), Some("date-time"));
        Ok(())
    }
}
