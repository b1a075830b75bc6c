//! Entity state snapshots as supplied by the external state store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::expression::Value;
use crate::refs::EntityRef;

/// The effective state of one entity on one branch, as of a point in time.
///
/// Fetching is the state store's job; this type only carries the result.
/// `as_of` is `None` for current-state ("latest") snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub entity: EntityRef,
    /// Stored (non-computed) field values.
    pub fields: HashMap<String, Value>,
    pub as_of: Option<DateTime<Utc>>,
}

impl StateSnapshot {
    pub fn latest(entity: EntityRef) -> Self {
        Self {
            entity,
            fields: HashMap::new(),
            as_of: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Lightweight entity listing entry for cached hierarchy queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySummary {
    pub entity: EntityRef,
    pub name: String,
}
