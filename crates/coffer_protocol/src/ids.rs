//! Typed identifiers shared by the server, store, and agent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub const fn from_uuid(value: Uuid) -> Self {
                Self(value)
            }

            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(
    /// Stable identity of an agent, assigned on first registration.
    AgentId
);
uuid_id!(
    /// Identity of a backup policy.
    PolicyId
);
uuid_id!(
    /// Identity of a storage destination.
    DestinationId
);
uuid_id!(
    /// Identity of one job. Time-ordered (UUIDv7) so primary-key order is
    /// creation order.
    JobId
);
uuid_id!(
    /// Identity of a cached snapshot record (the engine's own snapshot id is
    /// a separate opaque string).
    SnapshotId
);

impl AgentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl PolicyId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl DestinationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl SnapshotId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_roundtrip() {
        let id = AgentId::generate();
        let parsed: AgentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn job_ids_are_time_ordered() {
        let a = JobId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = JobId::generate();
        // UUIDv7 leads with a millisecond timestamp, so both the byte order
        // and the canonical string order follow creation order.
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn nil_is_nil() {
        assert!(JobId::nil().is_nil());
        assert!(!JobId::generate().is_nil());
    }
}
