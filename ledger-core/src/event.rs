//! Outbound change events consumed by downstream indexers

use crate::{EntityKind, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// What a committed write did to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Position of a change in the feed.
///
/// `global` orders every change in the store; `partition` counts changes
/// within the item's partition key and increases by one per change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SequenceToken {
    pub global: u64,
    pub partition: u64,
}

impl PartialOrd for SequenceToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceToken {
    fn cmp(&self, other: &Self) -> Ordering {
        self.global
            .cmp(&other.global)
            .then(self.partition.cmp(&other.partition))
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:020}.{:020}", self.global, self.partition)
    }
}

/// One committed primary write, with before and after images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ChangeEvent {
    pub entity_kind: EntityKind,
    pub operation: ChangeOperation,
    pub partition_key: String,
    pub sort_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub after: Option<Value>,
    /// Item version after the write. Deletes carry the deleted version plus one.
    pub version: u64,
    pub sequence_token: SequenceToken,
    #[cfg_attr(feature = "openapi", schema(value_type = String, format = "date-time"))]
    pub committed_at: Timestamp,
}

impl ChangeEvent {
    /// Whether a consumer holding `applied_version` of this item should apply the event.
    pub fn is_newer_than(&self, applied_version: Option<u64>) -> bool {
        applied_version.map_or(true, |applied| self.version > applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_sequence_tokens_order_by_global_position() {
        let a = SequenceToken { global: 4, partition: 9 };
        let b = SequenceToken { global: 5, partition: 1 };
        assert!(a < b);
        assert_eq!(a.to_string().len(), 41);
    }

    #[test]
    fn test_idempotent_application_by_version() {
        let event = ChangeEvent {
            entity_kind: EntityKind::Decision,
            operation: ChangeOperation::Update,
            partition_key: "DECISION#1".to_string(),
            sort_key: "METADATA".to_string(),
            before: None,
            after: Some(serde_json::json!({"version": 3})),
            version: 3,
            sequence_token: SequenceToken { global: 10, partition: 3 },
            committed_at: Utc::now(),
        };
        assert!(event.is_newer_than(None));
        assert!(event.is_newer_than(Some(2)));
        assert!(!event.is_newer_than(Some(3)));
    }
}
