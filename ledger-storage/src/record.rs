//! Typed records stored under the ledger key codec.

use ledger_core::{
    Decision, DecisionParticipant, EntityKind, LedgerResult, Project, ProjectMember,
    StorageError, Tag,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::keys::{ItemKey, PrimaryKey};
use crate::store::StoredItem;

/// Trait for entities persisted as primary items.
///
/// Every record knows its own key and carries the version used for
/// optimistic concurrency.
pub trait LedgerRecord: Serialize + DeserializeOwned + Clone + Send + Sync {
    const KIND: EntityKind;

    fn item_key(&self) -> ItemKey;

    fn version(&self) -> u64;

    fn primary_key(&self) -> PrimaryKey {
        self.item_key().primary()
    }

    fn to_body(&self) -> LedgerResult<Value> {
        serde_json::to_value(self).map_err(|e| {
            StorageError::Serialization {
                what: Self::KIND.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn to_stored(&self) -> LedgerResult<StoredItem> {
        Ok(StoredItem {
            key: self.primary_key(),
            version: self.version(),
            body: self.to_body()?,
        })
    }

    fn from_body(body: &Value) -> LedgerResult<Self> {
        Self::deserialize(body).map_err(|e| {
            StorageError::Serialization {
                what: Self::KIND.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn from_stored(item: &StoredItem) -> LedgerResult<Self> {
        Self::from_body(&item.body)
    }
}

impl LedgerRecord for Project {
    const KIND: EntityKind = EntityKind::Project;

    fn item_key(&self) -> ItemKey {
        ItemKey::Project {
            project_id: self.id,
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl LedgerRecord for ProjectMember {
    const KIND: EntityKind = EntityKind::ProjectMember;

    fn item_key(&self) -> ItemKey {
        ItemKey::Member {
            project_id: self.project_id,
            user_id: self.user_id.clone(),
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl LedgerRecord for Decision {
    const KIND: EntityKind = EntityKind::Decision;

    fn item_key(&self) -> ItemKey {
        ItemKey::Decision {
            decision_id: self.id,
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl LedgerRecord for DecisionParticipant {
    const KIND: EntityKind = EntityKind::DecisionParticipant;

    fn item_key(&self) -> ItemKey {
        ItemKey::Participant {
            decision_id: self.decision_id,
            user_id: self.user_id.clone(),
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl LedgerRecord for Tag {
    const KIND: EntityKind = EntityKind::Tag;

    fn item_key(&self) -> ItemKey {
        ItemKey::Tag {
            target: self.target,
            name: self.name.clone(),
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}
