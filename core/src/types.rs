//! Shared primitive types used across the lifecycle service.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable, unique identifier for a simulation record.
pub type SimulationId = String;

/// Links an outbound dispatch to its eventual webhook callback.
pub type CorrelationId = String;

/// The storage key of an owner (`user:<id>` or `guest:<session>`).
pub type OwnerKey = String;

/// Who a simulation belongs to. Guests are identified by their
/// ephemeral session key and draw from the guest tier quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum OwnerRef {
    User(String),
    Guest(String),
}

impl OwnerRef {
    pub fn key(&self) -> OwnerKey {
        match self {
            Self::User(id) => format!("user:{id}"),
            Self::Guest(session) => format!("guest:{session}"),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Guest(_) => "guest",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Guest(id) => id,
        }
    }

    /// Inverse of `key()`. Returns None for unknown prefixes.
    pub fn from_key(key: &str) -> Option<Self> {
        let (kind, id) = key.split_once(':')?;
        match kind {
            "user" => Some(Self::User(id.to_string())),
            "guest" => Some(Self::Guest(id.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
