//! Identity types for ledger entities

use crate::{LedgerError, LedgerResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Separator between the segments of every primary and index key.
pub const KEY_SEPARATOR: char = '#';

/// Maximum byte length of a free-form key component (user ids, tag names).
/// Sized so every index entry key fits LMDB's 511-byte key limit.
pub const MAX_KEY_COMPONENT_LEN: usize = 128;

/// Check that a value can be embedded in a key without ambiguity.
///
/// Rejects empty values, values longer than [`MAX_KEY_COMPONENT_LEN`] bytes,
/// values containing [`KEY_SEPARATOR`], and values containing control
/// characters (NUL included, which the storage layer uses as a byte delimiter).
pub fn validate_key_component(field: &str, value: &str) -> LedgerResult<()> {
    let reject = |reason: String| {
        Err(LedgerError::InvalidIdentifier {
            field: field.to_string(),
            value: value.to_string(),
            reason,
        })
    };

    if value.is_empty() {
        return reject("must not be empty".to_string());
    }
    if value.len() > MAX_KEY_COMPONENT_LEN {
        return reject(format!(
            "is {} bytes, limit is {}",
            value.len(),
            MAX_KEY_COMPONENT_LEN
        ));
    }
    if value.contains(KEY_SEPARATOR) {
        return reject(format!("contains the key separator '{}'", KEY_SEPARATOR));
    }
    if value.chars().any(char::is_control) {
        return reject("contains a control character".to_string());
    }
    Ok(())
}

macro_rules! uuid_id_type {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh UUIDv7 identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Parse the hyphenated form used inside keys.
            pub fn parse(value: &str) -> LedgerResult<Self> {
                Uuid::parse_str(value)
                    .map(Self)
                    .map_err(|e| LedgerError::InvalidIdentifier {
                        field: $field.to_string(),
                        value: value.to_string(),
                        reason: e.to_string(),
                    })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = LedgerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

macro_rules! key_component_type {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw value.
            pub fn new(value: impl Into<String>) -> LedgerResult<Self> {
                let value = value.into();
                validate_key_component($field, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = LedgerError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = LedgerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

uuid_id_type!(
    /// Immutable project identifier.
    ProjectId,
    "project_id"
);

uuid_id_type!(
    /// Immutable decision identifier.
    DecisionId,
    "decision_id"
);

key_component_type!(
    /// Chat-platform user identifier (e.g. `U001`).
    UserId,
    "user_id"
);

key_component_type!(
    /// Tag label attached to a project or decision.
    TagName,
    "tag_name"
);

/// Source of fresh identifiers for newly created entities.
pub trait IdGenerator: Send + Sync {
    fn next_uuid(&self) -> Uuid;
}

/// Production generator using timestamp-sortable UUIDv7 values.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn next_uuid(&self) -> Uuid {
        Uuid::now_v7()
    }
}
