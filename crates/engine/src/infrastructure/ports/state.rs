// Port traits define the full contract - many methods are for future use
#![allow(dead_code)]

//! State store port.
//!
//! The relational/spatial store owns entity persistence, branch lineage, and
//! geometry; this engine only consumes snapshots, hierarchy listings, and the
//! mutation stream through this trait.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use loreforge_domain::{BranchId, EntityKind, EntityRef, EntitySummary, MutationNotice, StateSnapshot};

use super::error::StateStoreError;

/// Stream of entity-mutation notifications.
pub type MutationStream = Pin<Box<dyn Stream<Item = MutationNotice> + Send>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStorePort: Send + Sync {
    /// Resolve the effective state snapshot for an entity on a branch.
    /// `as_of` of `None` means current ("latest") state.
    async fn fetch_state(
        &self,
        entity: &EntityRef,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<StateSnapshot>, StateStoreError>;

    /// Direct children of an entity in the containment hierarchy
    /// (Kingdom -> Settlement, Settlement -> Structure), on the entity's
    /// branch.
    async fn children(
        &self,
        entity: &EntityRef,
        child_kind: EntityKind,
    ) -> Result<Vec<EntitySummary>, StateStoreError>;

    /// The branch this branch was forked from, `None` for a root branch.
    async fn parent_branch(&self, branch: BranchId) -> Result<Option<BranchId>, StateStoreError>;

    /// Run a spatial query against the store. The engine never computes
    /// geometry itself; it only caches these results.
    async fn spatial_query(
        &self,
        query_type: &str,
        params: &serde_json::Value,
        branch: BranchId,
    ) -> Result<serde_json::Value, StateStoreError>;

    /// Subscribe to entity-mutation notifications.
    fn subscribe_to_mutations(&self) -> MutationStream;
}
