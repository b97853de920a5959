//! Enum types for ledger entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// PARSING
// ============================================================================

/// Error when parsing an unknown enum string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {kind}: {value}")]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! db_str_traits {
    ($name:ident) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_db_str())
            }
        }

        impl FromStr for $name {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_db_str(s)
            }
        }
    };
}

// ============================================================================
// ENTITY KIND
// ============================================================================

/// Discriminator for the heterogeneous items sharing the ledger keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Project,
    ProjectMember,
    Decision,
    DecisionParticipant,
    Tag,
}

impl EntityKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            EntityKind::Project => "PROJECT",
            EntityKind::ProjectMember => "PROJECT_MEMBER",
            EntityKind::Decision => "DECISION",
            EntityKind::DecisionParticipant => "DECISION_PARTICIPANT",
            EntityKind::Tag => "TAG",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "PROJECT" => Ok(EntityKind::Project),
            "PROJECT_MEMBER" => Ok(EntityKind::ProjectMember),
            "DECISION" => Ok(EntityKind::Decision),
            "DECISION_PARTICIPANT" => Ok(EntityKind::DecisionParticipant),
            "TAG" => Ok(EntityKind::Tag),
            _ => Err(EnumParseError {
                kind: "entity kind",
                value: s.to_string(),
            }),
        }
    }
}

db_str_traits!(EntityKind);

// ============================================================================
// DECISION STATUS
// ============================================================================

/// Lifecycle status of a decision.
///
/// Transitions only move forward:
///
/// | from \ to  | open | confirmed | superseded |
/// |------------|------|-----------|------------|
/// | open       | no   | yes       | yes        |
/// | confirmed  | no   | no        | yes        |
/// | superseded | no   | no        | no         |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Open,
    Confirmed,
    Superseded,
}

impl DecisionStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [DecisionStatus; 3] = [
        DecisionStatus::Open,
        DecisionStatus::Confirmed,
        DecisionStatus::Superseded,
    ];

    pub fn as_db_str(&self) -> &'static str {
        match self {
            DecisionStatus::Open => "open",
            DecisionStatus::Confirmed => "confirmed",
            DecisionStatus::Superseded => "superseded",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "open" => Ok(DecisionStatus::Open),
            "confirmed" => Ok(DecisionStatus::Confirmed),
            "superseded" => Ok(DecisionStatus::Superseded),
            _ => Err(EnumParseError {
                kind: "decision status",
                value: s.to_string(),
            }),
        }
    }

    /// Statuses reachable from this one in a single transition.
    pub fn successors(&self) -> &'static [DecisionStatus] {
        match self {
            DecisionStatus::Open => &[DecisionStatus::Confirmed, DecisionStatus::Superseded],
            DecisionStatus::Confirmed => &[DecisionStatus::Superseded],
            DecisionStatus::Superseded => &[],
        }
    }

    pub fn can_transition_to(&self, next: DecisionStatus) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }
}

db_str_traits!(DecisionStatus);

// ============================================================================
// ROLES
// ============================================================================

/// Role of a user within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(MemberRole::Owner),
            "admin" => Ok(MemberRole::Admin),
            "member" => Ok(MemberRole::Member),
            _ => Err(EnumParseError {
                kind: "member role",
                value: s.to_string(),
            }),
        }
    }
}

db_str_traits!(MemberRole);

/// Role of a user in a decision's approval flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Proposer,
    Decider,
    Approver,
    Contributor,
}

impl ParticipantRole {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ParticipantRole::Proposer => "proposer",
            ParticipantRole::Decider => "decider",
            ParticipantRole::Approver => "approver",
            ParticipantRole::Contributor => "contributor",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "proposer" => Ok(ParticipantRole::Proposer),
            "decider" => Ok(ParticipantRole::Decider),
            "approver" => Ok(ParticipantRole::Approver),
            "contributor" => Ok(ParticipantRole::Contributor),
            _ => Err(EnumParseError {
                kind: "participant role",
                value: s.to_string(),
            }),
        }
    }
}

db_str_traits!(ParticipantRole);

// ============================================================================
// PROJECT STATUS / DECISION SOURCE
// ============================================================================

/// Soft-delete marker for projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Active,
    Archived,
}

impl ProjectStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ProjectStatus::Active => "active",
            ProjectStatus::Archived => "archived",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "active" => Ok(ProjectStatus::Active),
            "archived" => Ok(ProjectStatus::Archived),
            _ => Err(EnumParseError {
                kind: "project status",
                value: s.to_string(),
            }),
        }
    }
}

db_str_traits!(ProjectStatus);

/// Where a decision was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Slack,
    Meeting,
    Manual,
}

impl SourceKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            SourceKind::Slack => "slack",
            SourceKind::Meeting => "meeting",
            SourceKind::Manual => "manual",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "slack" => Ok(SourceKind::Slack),
            "meeting" => Ok(SourceKind::Meeting),
            "manual" => Ok(SourceKind::Manual),
            _ => Err(EnumParseError {
                kind: "source kind",
                value: s.to_string(),
            }),
        }
    }
}

db_str_traits!(SourceKind);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_exhaustive() {
        use DecisionStatus::*;
        let legal = [(Open, Confirmed), (Open, Superseded), (Confirmed, Superseded)];

        for from in DecisionStatus::ALL {
            for to in DecisionStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
        assert!(Superseded.is_terminal());
        assert!(!Open.is_terminal());
    }

    #[test]
    fn test_status_db_str_roundtrip() {
        for status in DecisionStatus::ALL {
            assert_eq!(DecisionStatus::from_db_str(status.as_db_str()), Ok(status));
        }
        assert_eq!("CONFIRMED".parse::<DecisionStatus>(), Ok(DecisionStatus::Confirmed));
        assert!("reopened".parse::<DecisionStatus>().is_err());
    }

    #[test]
    fn test_entity_kind_matches_serde() {
        let json = serde_json::to_string(&EntityKind::ProjectMember).unwrap();
        assert_eq!(json, "\"PROJECT_MEMBER\"");
        assert_eq!(
            EntityKind::from_db_str("DECISION_PARTICIPANT"),
            Ok(EntityKind::DecisionParticipant)
        );
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Admin".parse::<MemberRole>(), Ok(MemberRole::Admin));
        assert_eq!("decider".parse::<ParticipantRole>(), Ok(ParticipantRole::Decider));
        let err = "chair".parse::<ParticipantRole>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid participant role: chair");
    }
}
