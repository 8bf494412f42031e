//! Shared identifiers and small value types used across the crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier (UUID-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniqueId(pub Uuid);

impl UniqueId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UniqueId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// Prefixed identifier newtypes. Display renders `<prefix>_<uuid>` and
// `FromStr` accepts the same form (prefix optional).
macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub UniqueId);

        impl $name {
            pub fn new() -> Self {
                Self(UniqueId::new())
            }

            /// Display prefix for this identifier kind.
            pub const PREFIX: &'static str = $prefix;
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s
                    .strip_prefix(concat!($prefix, "_"))
                    .unwrap_or(s);
                Uuid::parse_str(raw).map(|uuid| Self(UniqueId::from_uuid(uuid)))
            }
        }
    };
}

prefixed_id!(
    /// Identifier of a registered resource. Stable for the resource's lifetime.
    ResourceId,
    "res"
);
prefixed_id!(
    /// Identifier of a field.
    FieldId,
    "fld"
);
prefixed_id!(
    /// Identifier of a team.
    TeamId,
    "team"
);
prefixed_id!(
    /// Identifier of an adhesive binding.
    BindingId,
    "bind"
);
prefixed_id!(
    /// Identifier of a flow edge.
    EdgeId,
    "edge"
);

/// Actors (models) are registered as `Model` resources, so an actor is
/// addressed by its resource id.
pub type ActorId = ResourceId;

/// A scope that flow edges connect: either a team or a bare field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ScopeId {
    Team(TeamId),
    Field(FieldId),
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Team(id) => write!(f, "{}", id),
            Self::Field(id) => write!(f, "{}", id),
        }
    }
}

impl From<TeamId> for ScopeId {
    fn from(id: TeamId) -> Self {
        Self::Team(id)
    }
}

impl From<FieldId> for ScopeId {
    fn from(id: FieldId) -> Self {
        Self::Field(id)
    }
}

/// Timestamp wrapper for consistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_display_and_parse() {
        let id = ResourceId::new();
        let s = id.to_string();
        assert!(s.starts_with("res_"));

        let parsed: ResourceId = s.parse().unwrap();
        assert_eq!(parsed, id);

        let bare: ResourceId = id.0.to_string().parse().unwrap();
        assert_eq!(bare, id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("team_not-a-uuid".parse::<TeamId>().is_err());
    }

    #[test]
    fn test_scope_id_from() {
        let team = TeamId::new();
        let scope: ScopeId = team.into();
        assert_eq!(scope, ScopeId::Team(team));
        assert!(scope.to_string().starts_with("team_"));
    }
}
