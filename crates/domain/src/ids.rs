use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn to_uuid(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

// Core entity IDs
define_id!(KingdomId);
define_id!(SettlementId);
define_id!(StructureId);
define_id!(WorldEventId);

// Untyped entity ID used inside EntityRef, where the entity kind travels
// alongside it
define_id!(EntityId);

// Branch/timeline IDs
define_id!(BranchId);

impl From<KingdomId> for EntityId {
    fn from(value: KingdomId) -> Self {
        Self(value.to_uuid())
    }
}

impl From<SettlementId> for EntityId {
    fn from(value: SettlementId) -> Self {
        Self(value.to_uuid())
    }
}

impl From<StructureId> for EntityId {
    fn from(value: StructureId) -> Self {
        Self(value.to_uuid())
    }
}

impl From<WorldEventId> for EntityId {
    fn from(value: WorldEventId) -> Self {
        Self(value.to_uuid())
    }
}
