//! Key codec for the single-table layout.
//!
//! Every item lives under a `(partition key, sort key)` pair built from a
//! type tag and identifiers joined by `#`:
//!
//! | item | partition key | sort key |
//! |---|---|---|
//! | project | `PROJECT#<id>` | `METADATA` |
//! | member | `PROJECT#<id>` | `MEMBER#<user>` |
//! | decision | `DECISION#<id>` | `METADATA` |
//! | participant | `DECISION#<id>` | `PARTICIPANT#<user>` |
//! | tag | `PROJECT#<id>` or `DECISION#<id>` | `TAG#<name>` |
//!
//! Stored byte keys append a NUL between segments. Key components are
//! validated to contain neither `#` nor control characters, so both the
//! string and byte encodings decode unambiguously.

use std::fmt;
use std::ops::Bound;

use ledger_core::{
    DecisionId, DecisionStatus, EntityKind, LedgerError, LedgerResult, ProjectId, StorageError,
    TagName, TagTarget, Timestamp, UserId, KEY_SEPARATOR,
};
use serde::{Deserialize, Serialize};

pub const PROJECT_PREFIX: &str = "PROJECT";
pub const DECISION_PREFIX: &str = "DECISION";
pub const MEMBER_PREFIX: &str = "MEMBER";
pub const PARTICIPANT_PREFIX: &str = "PARTICIPANT";
pub const TAG_PREFIX: &str = "TAG";
pub const METADATA_SORT_KEY: &str = "METADATA";

const BYTE_DELIMITER: u8 = 0x00;
const PARTITION_END: u8 = 0x01;
// Never produced by UTF-8, so it sorts after every continuation of a prefix.
const PREFIX_END: u8 = 0xff;

/// Render a timestamp as a fixed-width sort key component.
///
/// `2024-01-01T00:00:00.000000Z`: lexicographic order equals chronological order.
pub fn sort_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub fn project_partition(id: &ProjectId) -> String {
    format!("{}{}{}", PROJECT_PREFIX, KEY_SEPARATOR, id)
}

pub fn decision_partition(id: &DecisionId) -> String {
    format!("{}{}{}", DECISION_PREFIX, KEY_SEPARATOR, id)
}

fn tagged(prefix: &str, value: &str) -> String {
    format!("{}{}{}", prefix, KEY_SEPARATOR, value)
}

fn corrupt(partition_key: &str, sort_key: &str) -> LedgerError {
    LedgerError::InvalidIdentifier {
        field: "item_key".to_string(),
        value: format!("{}/{}", partition_key, sort_key),
        reason: "does not match any entity key layout".to_string(),
    }
}

// ============================================================================
// PRIMARY KEYS
// ============================================================================

/// Logical key of a ledger item, one variant per entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKey {
    Project {
        project_id: ProjectId,
    },
    Member {
        project_id: ProjectId,
        user_id: UserId,
    },
    Decision {
        decision_id: DecisionId,
    },
    Participant {
        decision_id: DecisionId,
        user_id: UserId,
    },
    Tag {
        target: TagTarget,
        name: TagName,
    },
}

impl ItemKey {
    pub fn kind(&self) -> EntityKind {
        match self {
            ItemKey::Project { .. } => EntityKind::Project,
            ItemKey::Member { .. } => EntityKind::ProjectMember,
            ItemKey::Decision { .. } => EntityKind::Decision,
            ItemKey::Participant { .. } => EntityKind::DecisionParticipant,
            ItemKey::Tag { .. } => EntityKind::Tag,
        }
    }

    pub fn partition_key(&self) -> String {
        match self {
            ItemKey::Project { project_id } | ItemKey::Member { project_id, .. } => {
                project_partition(project_id)
            }
            ItemKey::Decision { decision_id } | ItemKey::Participant { decision_id, .. } => {
                decision_partition(decision_id)
            }
            ItemKey::Tag { target, .. } => match target {
                TagTarget::Project(id) => project_partition(id),
                TagTarget::Decision(id) => decision_partition(id),
            },
        }
    }

    pub fn sort_key(&self) -> String {
        match self {
            ItemKey::Project { .. } | ItemKey::Decision { .. } => METADATA_SORT_KEY.to_string(),
            ItemKey::Member { user_id, .. } => tagged(MEMBER_PREFIX, user_id.as_str()),
            ItemKey::Participant { user_id, .. } => tagged(PARTICIPANT_PREFIX, user_id.as_str()),
            ItemKey::Tag { name, .. } => tagged(TAG_PREFIX, name.as_str()),
        }
    }

    pub fn primary(&self) -> PrimaryKey {
        PrimaryKey {
            partition: self.partition_key(),
            sort: self.sort_key(),
        }
    }

    /// Logical identifier for error messages (`<project>` or `<project>/<user>` etc.).
    pub fn id_string(&self) -> String {
        match self {
            ItemKey::Project { project_id } => project_id.to_string(),
            ItemKey::Member {
                project_id,
                user_id,
            } => format!("{}/{}", project_id, user_id),
            ItemKey::Decision { decision_id } => decision_id.to_string(),
            ItemKey::Participant {
                decision_id,
                user_id,
            } => format!("{}/{}", decision_id, user_id),
            ItemKey::Tag { target, name } => match target {
                TagTarget::Project(id) => format!("{}/{}", id, name),
                TagTarget::Decision(id) => format!("{}/{}", id, name),
            },
        }
    }

    /// Recover the logical key from a primary key pair.
    pub fn decode(partition_key: &str, sort_key: &str) -> LedgerResult<ItemKey> {
        let (type_tag, id) = partition_key
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| corrupt(partition_key, sort_key))?;
        let (sort_tag, sort_value) = match sort_key.split_once(KEY_SEPARATOR) {
            Some((tag, value)) => (tag, Some(value)),
            None => (sort_key, None),
        };

        match (type_tag, sort_tag, sort_value) {
            (PROJECT_PREFIX, METADATA_SORT_KEY, None) => Ok(ItemKey::Project {
                project_id: ProjectId::parse(id)?,
            }),
            (PROJECT_PREFIX, MEMBER_PREFIX, Some(user)) => Ok(ItemKey::Member {
                project_id: ProjectId::parse(id)?,
                user_id: UserId::new(user)?,
            }),
            (PROJECT_PREFIX, TAG_PREFIX, Some(name)) => Ok(ItemKey::Tag {
                target: TagTarget::Project(ProjectId::parse(id)?),
                name: TagName::new(name)?,
            }),
            (DECISION_PREFIX, METADATA_SORT_KEY, None) => Ok(ItemKey::Decision {
                decision_id: DecisionId::parse(id)?,
            }),
            (DECISION_PREFIX, PARTICIPANT_PREFIX, Some(user)) => Ok(ItemKey::Participant {
                decision_id: DecisionId::parse(id)?,
                user_id: UserId::new(user)?,
            }),
            (DECISION_PREFIX, TAG_PREFIX, Some(name)) => Ok(ItemKey::Tag {
                target: TagTarget::Decision(DecisionId::parse(id)?),
                name: TagName::new(name)?,
            }),
            _ => Err(corrupt(partition_key, sort_key)),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition_key(), self.sort_key())
    }
}

/// Physical `(partition, sort)` pair as stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub partition: String,
    pub sort: String,
}

impl PrimaryKey {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }

    /// Encode as `partition 0x00 sort`.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.partition.len() + self.sort.len() + 1);
        bytes.extend_from_slice(self.partition.as_bytes());
        bytes.push(BYTE_DELIMITER);
        bytes.extend_from_slice(self.sort.as_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut parts = bytes.splitn(2, |b| *b == BYTE_DELIMITER);
        let partition = std::str::from_utf8(parts.next()?).ok()?;
        let sort = std::str::from_utf8(parts.next()?).ok()?;
        Some(Self::new(partition, sort))
    }

    pub fn to_item_key(&self) -> LedgerResult<ItemKey> {
        ItemKey::decode(&self.partition, &self.sort)
    }

    pub(crate) fn describe(&self) -> String {
        format!("{}/{}", self.partition, self.sort)
    }
}

impl From<&ItemKey> for PrimaryKey {
    fn from(key: &ItemKey) -> Self {
        key.primary()
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.sort)
    }
}

// ============================================================================
// SECONDARY INDEXES
// ============================================================================

/// Which attributes an index entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// A full snapshot of the projected entity.
    All,
    /// Only the target primary key.
    KeysOnly,
}

/// The four derived indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexName {
    /// GSI1: `user_id` -> memberships, sorted by `joined_at`.
    UserProjects,
    /// GSI2: `project_id` -> decisions, sorted by `created_at`.
    ProjectDecisions,
    /// GSI3: `<status>#<project_id>` -> decisions, sorted by `created_at`.
    StatusFilter,
    /// GSI4: `supersedes_id` -> superseding decision.
    Supersedes,
}

impl IndexName {
    pub const ALL: [IndexName; 4] = [
        IndexName::UserProjects,
        IndexName::ProjectDecisions,
        IndexName::StatusFilter,
        IndexName::Supersedes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexName::UserProjects => "GSI1-UserProjects",
            IndexName::ProjectDecisions => "GSI2-ProjectDecisions",
            IndexName::StatusFilter => "GSI3-StatusFilter",
            IndexName::Supersedes => "GSI4-Supersedes",
        }
    }

    pub fn projection(&self) -> Projection {
        match self {
            IndexName::Supersedes => Projection::KeysOnly,
            _ => Projection::All,
        }
    }

    fn tag_byte(&self) -> u8 {
        match self {
            IndexName::UserProjects => b'1',
            IndexName::ProjectDecisions => b'2',
            IndexName::StatusFilter => b'3',
            IndexName::Supersedes => b'4',
        }
    }

    fn from_tag_byte(byte: u8) -> Option<Self> {
        match byte {
            b'1' => Some(IndexName::UserProjects),
            b'2' => Some(IndexName::ProjectDecisions),
            b'3' => Some(IndexName::StatusFilter),
            b'4' => Some(IndexName::Supersedes),
            _ => None,
        }
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GSI3 partition value: `<status>#<project_id>`.
pub fn status_partition(status: DecisionStatus, project_id: &ProjectId) -> String {
    format!("{}{}{}", status.as_db_str(), KEY_SEPARATOR, project_id)
}

/// Index key of one entry. Several entries may share an index key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey {
    pub index: IndexName,
    pub partition: String,
    pub sort: String,
}

impl IndexKey {
    pub fn user_projects(user_id: &UserId, joined_at: &Timestamp) -> Self {
        Self {
            index: IndexName::UserProjects,
            partition: user_id.as_str().to_string(),
            sort: sort_timestamp(joined_at),
        }
    }

    pub fn project_decisions(project_id: &ProjectId, created_at: &Timestamp) -> Self {
        Self {
            index: IndexName::ProjectDecisions,
            partition: project_id.to_string(),
            sort: sort_timestamp(created_at),
        }
    }

    pub fn status_filter(
        status: DecisionStatus,
        project_id: &ProjectId,
        created_at: &Timestamp,
    ) -> Self {
        Self {
            index: IndexName::StatusFilter,
            partition: status_partition(status, project_id),
            sort: sort_timestamp(created_at),
        }
    }

    pub fn supersedes(decision_id: &DecisionId) -> Self {
        Self {
            index: IndexName::Supersedes,
            partition: decision_id.to_string(),
            sort: String::new(),
        }
    }
}

/// Stored key of an index entry: the index key followed by the target item's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexEntryKey {
    pub index_key: IndexKey,
    pub target: PrimaryKey,
}

impl IndexEntryKey {
    pub fn new(index_key: IndexKey, target: PrimaryKey) -> Self {
        Self { index_key, target }
    }

    pub fn index(&self) -> IndexName {
        self.index_key.index
    }

    /// Encode as `tag partition 0x00 sort 0x00 target_partition 0x00 target_sort`.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = index_partition_prefix(self.index_key.index, &self.index_key.partition);
        bytes.extend_from_slice(self.index_key.sort.as_bytes());
        bytes.push(BYTE_DELIMITER);
        bytes.extend_from_slice(&self.target.encode());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&tag, rest) = bytes.split_first()?;
        let index = IndexName::from_tag_byte(tag)?;
        let mut parts = rest.splitn(4, |b| *b == BYTE_DELIMITER);
        let partition = std::str::from_utf8(parts.next()?).ok()?;
        let sort = std::str::from_utf8(parts.next()?).ok()?;
        let target_partition = std::str::from_utf8(parts.next()?).ok()?;
        let target_sort = std::str::from_utf8(parts.next()?).ok()?;
        Some(Self {
            index_key: IndexKey {
                index,
                partition: partition.to_string(),
                sort: sort.to_string(),
            },
            target: PrimaryKey::new(target_partition, target_sort),
        })
    }

    pub(crate) fn describe(&self) -> String {
        format!(
            "{}:{}/{} -> {}",
            self.index_key.index, self.index_key.partition, self.index_key.sort, self.target
        )
    }
}

pub(crate) fn decode_index_key(bytes: &[u8]) -> LedgerResult<IndexEntryKey> {
    IndexEntryKey::decode(bytes).ok_or_else(|| {
        StorageError::CorruptKey {
            location: "index".to_string(),
        }
        .into()
    })
}

// ============================================================================
// RANGES
// ============================================================================

/// Condition on the sort key within one partition. String bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortCondition {
    All,
    Equals(String),
    BeginsWith(String),
    Between { from: String, to: String },
    AtLeast(String),
    AtMost(String),
}

impl SortCondition {
    /// Condition matching sort timestamps in `[since, until]`.
    pub fn time_range(since: Option<&Timestamp>, until: Option<&Timestamp>) -> Self {
        match (since, until) {
            (None, None) => SortCondition::All,
            (Some(from), None) => SortCondition::AtLeast(sort_timestamp(from)),
            (None, Some(to)) => SortCondition::AtMost(sort_timestamp(to)),
            (Some(from), Some(to)) => SortCondition::Between {
                from: sort_timestamp(from),
                to: sort_timestamp(to),
            },
        }
    }
}

/// Byte range over encoded keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Bound<Vec<u8>>,
    pub upper: Bound<Vec<u8>>,
}

impl KeyRange {
    /// Range of keys stored under `prefix` (which ends with the partition delimiter)
    /// satisfying `condition`.
    fn within(prefix: Vec<u8>, condition: &SortCondition) -> Self {
        let extend = |tail: &[u8], last: Option<u8>| {
            let mut key = prefix.clone();
            key.extend_from_slice(tail);
            if let Some(byte) = last {
                key.push(byte);
            }
            key
        };
        let mut end = prefix.clone();
        if let Some(last) = end.last_mut() {
            *last = PARTITION_END;
        }

        let (lower, upper) = match condition {
            SortCondition::All => (Bound::Included(prefix.clone()), Bound::Excluded(end)),
            SortCondition::Equals(value) => (
                Bound::Included(extend(value.as_bytes(), None)),
                Bound::Excluded(extend(value.as_bytes(), Some(PARTITION_END))),
            ),
            SortCondition::BeginsWith(value) => (
                Bound::Included(extend(value.as_bytes(), None)),
                Bound::Excluded(extend(value.as_bytes(), Some(PREFIX_END))),
            ),
            SortCondition::Between { from, to } => (
                Bound::Included(extend(from.as_bytes(), None)),
                Bound::Excluded(extend(to.as_bytes(), Some(PARTITION_END))),
            ),
            SortCondition::AtLeast(from) => {
                (Bound::Included(extend(from.as_bytes(), None)), Bound::Excluded(end))
            }
            SortCondition::AtMost(to) => (
                Bound::Included(prefix.clone()),
                Bound::Excluded(extend(to.as_bytes(), Some(PARTITION_END))),
            ),
        };
        Self { lower, upper }
    }

    /// Range of primary items in `partition`.
    pub fn items(partition: &str, condition: &SortCondition) -> Self {
        let mut prefix = partition.as_bytes().to_vec();
        prefix.push(BYTE_DELIMITER);
        Self::within(prefix, condition)
    }

    /// Range of index entries in `partition` of `index`.
    pub fn index(index: IndexName, partition: &str, condition: &SortCondition) -> Self {
        Self::within(index_partition_prefix(index, partition), condition)
    }

    /// Narrow the range to keys strictly after (ascending) or before (descending) `cursor`.
    pub fn resume_after(mut self, cursor: &[u8], descending: bool) -> Self {
        if descending {
            let tighter = match &self.upper {
                Bound::Included(upper) | Bound::Excluded(upper) => cursor <= upper.as_slice(),
                Bound::Unbounded => true,
            };
            if tighter {
                self.upper = Bound::Excluded(cursor.to_vec());
            }
        } else {
            let tighter = match &self.lower {
                Bound::Included(lower) | Bound::Excluded(lower) => cursor >= lower.as_slice(),
                Bound::Unbounded => true,
            };
            if tighter {
                self.lower = Bound::Excluded(cursor.to_vec());
            }
        }
        self
    }

    /// Whether no key can fall in the range. Ordered map range calls panic on such ranges.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let above = match &self.lower {
            Bound::Included(lo) => key >= lo.as_slice(),
            Bound::Excluded(lo) => key > lo.as_slice(),
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(hi) => key <= hi.as_slice(),
            Bound::Excluded(hi) => key < hi.as_slice(),
            Bound::Unbounded => true,
        };
        above && below
    }

    pub fn as_slices(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        (as_slice_bound(&self.lower), as_slice_bound(&self.upper))
    }
}

fn as_slice_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_slice()),
        Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn index_partition_prefix(index: IndexName, partition: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(partition.len() + 2);
    bytes.push(index.tag_byte());
    bytes.extend_from_slice(partition.as_bytes());
    bytes.push(BYTE_DELIMITER);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use uuid::Uuid;

    fn arb_component() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_\\-\\. ]{1,24}"
    }

    fn arb_item_key() -> impl Strategy<Value = ItemKey> {
        let project = any::<u128>().prop_map(|n| ProjectId::from_uuid(Uuid::from_u128(n)));
        let decision = any::<u128>().prop_map(|n| DecisionId::from_uuid(Uuid::from_u128(n)));
        prop_oneof![
            project.clone().prop_map(|project_id| ItemKey::Project { project_id }),
            (project.clone(), arb_component()).prop_map(|(project_id, u)| ItemKey::Member {
                project_id,
                user_id: UserId::new(u).unwrap(),
            }),
            decision.clone().prop_map(|decision_id| ItemKey::Decision { decision_id }),
            (decision.clone(), arb_component()).prop_map(|(decision_id, u)| {
                ItemKey::Participant {
                    decision_id,
                    user_id: UserId::new(u).unwrap(),
                }
            }),
            (project, arb_component()).prop_map(|(id, n)| ItemKey::Tag {
                target: TagTarget::Project(id),
                name: TagName::new(n).unwrap(),
            }),
            (decision, arb_component()).prop_map(|(id, n)| ItemKey::Tag {
                target: TagTarget::Decision(id),
                name: TagName::new(n).unwrap(),
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_item_keys_decode_to_themselves(key in arb_item_key()) {
            let primary = key.primary();
            prop_assert_eq!(primary.to_item_key().unwrap(), key.clone());
            prop_assert_eq!(PrimaryKey::decode(&primary.encode()), Some(primary));
        }

        #[test]
        fn prop_partition_range_holds_exactly_its_items(a in arb_item_key(), b in arb_item_key()) {
            let range = KeyRange::items(&a.partition_key(), &SortCondition::All);
            prop_assert!(range.contains(&a.primary().encode()));
            prop_assert_eq!(
                range.contains(&b.primary().encode()),
                a.partition_key() == b.partition_key()
            );
        }
    }

    #[test]
    fn test_layout_matches_table_design() {
        let project_id = ProjectId::from_uuid(Uuid::nil());
        let key = ItemKey::Member {
            project_id,
            user_id: UserId::new("U001").unwrap(),
        };
        assert_eq!(
            key.partition_key(),
            "PROJECT#00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(key.sort_key(), "MEMBER#U001");
        assert_eq!(key.kind(), EntityKind::ProjectMember);
        assert_eq!(
            status_partition(DecisionStatus::Superseded, &project_id),
            "superseded#00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_decode_rejects_foreign_layouts() {
        for (pk, sk) in [
            ("PROJECT#not-a-uuid", "METADATA"),
            ("USER#00000000-0000-0000-0000-000000000000", "METADATA"),
            ("PROJECT#00000000-0000-0000-0000-000000000000", "PARTICIPANT#U1"),
            ("DECISION#00000000-0000-0000-0000-000000000000", "MEMBER#U1"),
            ("PROJECT#00000000-0000-0000-0000-000000000000", "METADATA#extra"),
            ("PROJECT", "METADATA"),
        ] {
            assert!(matches!(
                ItemKey::decode(pk, sk),
                Err(LedgerError::InvalidIdentifier { .. })
            ), "{pk}/{sk}");
        }
    }

    #[test]
    fn test_sort_timestamps_are_fixed_width() {
        let base = Utc.with_ymd_and_hms(2024, 3, 15, 9, 5, 3).unwrap();
        let a = sort_timestamp(&base);
        let b = sort_timestamp(&(base + Duration::microseconds(1)));
        let c = sort_timestamp(&(base + Duration::days(400)));
        assert_eq!(a, "2024-03-15T09:05:03.000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b && b < c);
    }

    #[test]
    fn test_index_entry_roundtrip_and_uniqueness() {
        let project_id = ProjectId::new();
        let ts = Utc::now();
        let key = IndexKey::project_decisions(&project_id, &ts);
        let first = IndexEntryKey::new(
            key.clone(),
            ItemKey::Decision { decision_id: DecisionId::new() }.primary(),
        );
        let second = IndexEntryKey::new(
            key,
            ItemKey::Decision { decision_id: DecisionId::new() }.primary(),
        );
        assert_ne!(first.encode(), second.encode());
        assert_eq!(IndexEntryKey::decode(&first.encode()), Some(first.clone()));

        let gsi4 = IndexEntryKey::new(IndexKey::supersedes(&DecisionId::new()), first.target.clone());
        assert_eq!(IndexEntryKey::decode(&gsi4.encode()), Some(gsi4));
    }

    #[test]
    fn test_every_index_roundtrips_through_its_tag() {
        let target = ItemKey::Decision { decision_id: DecisionId::new() }.primary();
        for index in IndexName::ALL {
            let key = IndexEntryKey::new(
                IndexKey {
                    index,
                    partition: "p".to_string(),
                    sort: "s".to_string(),
                },
                target.clone(),
            );
            assert_eq!(IndexEntryKey::decode(&key.encode()), Some(key.clone()));
            let expected = if index == IndexName::Supersedes {
                Projection::KeysOnly
            } else {
                Projection::All
            };
            assert_eq!(index.projection(), expected, "{}", index.as_str());
        }
    }

    #[test]
    fn test_between_is_inclusive_for_index_entries() {
        let project_id = ProjectId::new();
        let t = |secs| Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap();
        let entry = |secs| {
            IndexEntryKey::new(
                IndexKey::project_decisions(&project_id, &t(secs)),
                ItemKey::Decision { decision_id: DecisionId::new() }.primary(),
            )
            .encode()
        };
        let range = KeyRange::index(
            IndexName::ProjectDecisions,
            &project_id.to_string(),
            &SortCondition::time_range(Some(&t(10)), Some(&t(20))),
        );
        assert!(!range.contains(&entry(9)));
        assert!(range.contains(&entry(10)));
        assert!(range.contains(&entry(20)));
        assert!(!range.contains(&entry(21)));
    }

    #[test]
    fn test_begins_with_stays_inside_prefix() {
        let project_id = ProjectId::new();
        let partition = project_partition(&project_id);
        let range = KeyRange::items(&partition, &SortCondition::BeginsWith("MEMBER#".to_string()));
        let member = ItemKey::Member {
            project_id,
            user_id: UserId::new("U9").unwrap(),
        };
        let tag = ItemKey::Tag {
            target: TagTarget::Project(project_id),
            name: TagName::new("launch").unwrap(),
        };
        assert!(range.contains(&member.primary().encode()));
        assert!(!range.contains(&tag.primary().encode()));
        assert!(!range.contains(&ItemKey::Project { project_id }.primary().encode()));
    }

    #[test]
    fn test_inverted_and_exhausted_ranges_are_empty() {
        let inverted = KeyRange::items(
            "DECISION#x",
            &SortCondition::Between {
                from: "b".to_string(),
                to: "a".to_string(),
            },
        );
        assert!(inverted.is_empty());

        let range = KeyRange::items("DECISION#x", &SortCondition::All);
        let last = match &range.upper {
            Bound::Excluded(hi) => hi.clone(),
            _ => unreachable!(),
        };
        assert!(range.resume_after(&last, false).is_empty());
    }
}
