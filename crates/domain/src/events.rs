//! Mutation and invalidation event types.
//!
//! Consumers of invalidation events see *invalidation*, not raw mutation:
//! events are published only after the invalidation set has been computed and
//! the corresponding cache entries deleted. Subscribers must not assume the
//! cache has been re-populated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::refs::{EntityRef, FieldRef};

/// Notification that entity state changed, as delivered by the state store's
/// mutation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationNotice {
    pub entity: EntityRef,
    pub changed_fields: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

impl MutationNotice {
    /// Field references for every changed field.
    pub fn changed_field_refs(&self) -> Vec<FieldRef> {
        self.changed_fields
            .iter()
            .map(|field| self.entity.field(field.clone()))
            .collect()
    }
}

/// Why an invalidation happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvalidationCause {
    /// A source field's stored value changed.
    FieldChanged,
    /// A parent/child hierarchy relationship changed (entity added, removed,
    /// or re-parented).
    HierarchyChanged,
    /// A branch merge landed; affected fields on the target branch are
    /// invalidated wholesale rather than reconciled value-by-value.
    BranchMerge,
    /// Operator-requested flush.
    Manual,
}

/// Published after cache deletion for one top-level change, carrying the full
/// affected set so downstream consumers need not re-derive it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    /// The field whose change triggered the cascade.
    pub changed: FieldRef,
    pub cause: InvalidationCause,
    /// Every field reference whose cache entry was deleted, the changed
    /// field included.
    pub affected: Vec<FieldRef>,
    pub occurred_at: DateTime<Utc>,
}
