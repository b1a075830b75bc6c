//! Version/Branch Resolver.
//!
//! The state store does the actual fetching; this module owns the
//! cache-keying and branch-consistency rules:
//!
//! - every key is branch-qualified, never silently shared across branches;
//! - current-state queries use a canonical "latest" key (no `as_of` segment)
//!   so one invalidation clears the live value without enumerating history;
//! - historical queries append the `as_of` instant and never participate in
//!   invalidation (a snapshot of the past is immutable, TTL bounds it);
//! - after a branch fork, a miss on the child branch may legitimately fall
//!   back to ancestor branches' keys, then write back under the child's key
//!   so repeated reads stop paying the ancestor-lookup cost.
//!
//! Key formats are part of the operational surface and must stay stable:
//!
//! ```text
//! {prefix}:{entityType}:{entityId}:{branchId}:{field}[:{asOf}]
//! {prefix}:list:{parentType}:{parentId}:{branchId}
//! {prefix}:spatial:{queryType}:{paramHash}:{branchId}
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use loreforge_domain::{BranchId, EntityRef, FieldRef, StateSnapshot};

use crate::infrastructure::ports::{StateStoreError, StateStorePort};

/// Deterministic cache-key construction. Identical inputs always produce the
/// same key.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Canonical "latest" key for a computed field.
    pub fn field_key(&self, field: &FieldRef) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.prefix,
            field.entity.kind.key_name(),
            field.entity.id,
            field.entity.branch,
            field.field
        )
    }

    /// Historical key for an explicitly as-of read.
    pub fn field_key_as_of(&self, field: &FieldRef, as_of: DateTime<Utc>) -> String {
        format!("{}:{}", self.field_key(field), as_of.timestamp_millis())
    }

    /// Prefix covering every field (and historical variant) of one entity on
    /// one branch. Used for whole-entity invalidation.
    pub fn entity_prefix(&self, entity: &EntityRef) -> String {
        format!(
            "{}:{}:{}:{}:",
            self.prefix,
            entity.kind.key_name(),
            entity.id,
            entity.branch
        )
    }

    /// Key for a cached child listing of a parent entity.
    pub fn list_key(&self, parent: &EntityRef) -> String {
        format!(
            "{}:list:{}:{}:{}",
            self.prefix,
            parent.kind.key_name(),
            parent.id,
            parent.branch
        )
    }

    /// Key for a cached spatial query result. Parameters are hashed through
    /// their canonical JSON form so logically equal queries share a key.
    pub fn spatial_key(
        &self,
        query_type: &str,
        params: &serde_json::Value,
        branch: BranchId,
    ) -> String {
        let canonical = params.to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        let param_hash = &hex::encode(digest)[..16];
        format!("{}:spatial:{}:{}:{}", self.prefix, query_type, param_hash, branch)
    }

    /// Prefix for one entity kind across all entities and branches.
    /// Statistics only.
    pub fn kind_prefix(&self, kind: loreforge_domain::EntityKind) -> String {
        format!("{}:{}:", self.prefix, kind.key_name())
    }

    pub fn list_prefix(&self) -> String {
        format!("{}:list:", self.prefix)
    }

    pub fn spatial_prefix(&self) -> String {
        format!("{}:spatial:", self.prefix)
    }
}

/// Resolves effective state and branch lineage through the state store.
pub struct VersionResolver {
    state: Arc<dyn StateStorePort>,
}

/// Branch ancestry walks are capped to guard against lineage cycles in a
/// corrupted store.
const MAX_BRANCH_DEPTH: usize = 32;

impl VersionResolver {
    pub fn new(state: Arc<dyn StateStorePort>) -> Self {
        Self { state }
    }

    /// Effective state snapshot for an entity; `as_of` of `None` resolves
    /// current state.
    pub async fn resolve(
        &self,
        entity: &EntityRef,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<StateSnapshot>, StateStoreError> {
        self.state.fetch_state(entity, as_of).await
    }

    /// The branch itself followed by its ancestors, nearest first. A child
    /// branch's cache may fall back along this chain for fields it has not
    /// diverged on.
    pub async fn branch_ancestry(
        &self,
        branch: BranchId,
    ) -> Result<Vec<BranchId>, StateStoreError> {
        let mut chain = vec![branch];
        let mut current = branch;
        while let Some(parent) = self.state.parent_branch(current).await? {
            if chain.contains(&parent) || chain.len() >= MAX_BRANCH_DEPTH {
                tracing::warn!(branch = %branch, "branch lineage cycle or excessive depth; truncating ancestry walk");
                break;
            }
            chain.push(parent);
            current = parent;
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loreforge_domain::{EntityId, EntityKind};

    fn keys() -> KeyBuilder {
        KeyBuilder::new("lf")
    }

    fn entity() -> EntityRef {
        EntityRef::new(EntityKind::Settlement, EntityId::new(), BranchId::new())
    }

    #[test]
    fn field_key_is_branch_qualified_and_stable() {
        let entity = entity();
        let field = entity.field("totalDefense");
        let key = keys().field_key(&field);
        assert_eq!(
            key,
            format!("lf:settlement:{}:{}:totalDefense", entity.id, entity.branch)
        );
        // Identical inputs, identical key.
        assert_eq!(keys().field_key(&field), key);
    }

    #[test]
    fn same_field_on_different_branches_never_shares_a_key() {
        let entity = entity();
        let field = entity.field("totalDefense");
        let forked = field.on_branch(BranchId::new());
        assert_ne!(keys().field_key(&field), keys().field_key(&forked));
    }

    #[test]
    fn as_of_key_extends_the_latest_key() {
        let field = entity().field("population");
        let as_of: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().expect("valid date");
        let latest = keys().field_key(&field);
        let historical = keys().field_key_as_of(&field, as_of);
        assert!(historical.starts_with(&latest));
        assert_ne!(historical, latest);
    }

    #[test]
    fn entity_prefix_covers_its_field_keys() {
        let entity = entity();
        let prefix = keys().entity_prefix(&entity);
        assert!(keys().field_key(&entity.field("a")).starts_with(&prefix));
        assert!(keys().field_key(&entity.field("b")).starts_with(&prefix));
    }

    #[test]
    fn spatial_key_is_deterministic_per_params() {
        let branch = BranchId::new();
        let params = serde_json::json!({"radius": 5, "center": [10, 20]});
        let first = keys().spatial_key("withinRadius", &params, branch);
        let second = keys().spatial_key("withinRadius", &params, branch);
        assert_eq!(first, second);

        let other = serde_json::json!({"radius": 6, "center": [10, 20]});
        assert_ne!(keys().spatial_key("withinRadius", &other, branch), first);
    }
}
