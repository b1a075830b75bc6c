//! Invalidation fence.
//!
//! A monotonically increasing epoch per field reference, shared by the
//! coordinator (write side) and the read service. The coordinator advances a
//! field's epoch before deleting its cache keys; an evaluation captures the
//! epoch when it starts and, once the epoch has moved, neither caches its
//! result nor hands it to readers that joined after the move. A read that
//! begins after an invalidation completes therefore never observes a value
//! computed from pre-mutation state.

use dashmap::DashMap;

use loreforge_domain::FieldRef;

#[derive(Debug, Default)]
pub struct InvalidationFence {
    epochs: DashMap<FieldRef, u64>,
}

impl InvalidationFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current epoch of a field. Never-invalidated fields sit at zero.
    pub fn epoch(&self, field: &FieldRef) -> u64 {
        self.epochs.get(field).map(|entry| *entry).unwrap_or(0)
    }

    /// Advance the field's epoch. Called before its cache keys are deleted.
    pub fn bump(&self, field: &FieldRef) {
        *self.epochs.entry(field.clone()).or_insert(0) += 1;
    }
}
