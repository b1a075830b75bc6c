//! Entity and field references - the unit of identity for caching and
//! invalidation.
//!
//! An `EntityRef` is unique per live entity within a branch. A forked branch
//! creates new references that alias parent-branch state until the field in
//! question diverges; the engine resolves that aliasing at cache-lookup time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{BranchId, EntityId};

/// The closed set of entity kinds the campaign data model knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Kingdom,
    Settlement,
    Structure,
    WorldEvent,
}

impl EntityKind {
    /// All kinds, in a fixed order. Used for graph sharding and statistics.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Kingdom,
        EntityKind::Settlement,
        EntityKind::Structure,
        EntityKind::WorldEvent,
    ];

    /// Stable lowercase name used in cache keys. Must not change once
    /// deployed; operators match on these prefixes.
    pub fn key_name(&self) -> &'static str {
        match self {
            EntityKind::Kingdom => "kingdom",
            EntityKind::Settlement => "settlement",
            EntityKind::Structure => "structure",
            EntityKind::WorldEvent => "worldevent",
        }
    }

    /// Index into fixed-size per-kind tables (graph shards).
    pub fn index(&self) -> usize {
        match self {
            EntityKind::Kingdom => 0,
            EntityKind::Settlement => 1,
            EntityKind::Structure => 2,
            EntityKind::WorldEvent => 3,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key_name())
    }
}

/// Identity of one entity on one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
    pub branch: BranchId,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<EntityId>, branch: BranchId) -> Self {
        Self {
            kind,
            id: id.into(),
            branch,
        }
    }

    /// The same entity viewed on a different branch.
    pub fn on_branch(&self, branch: BranchId) -> Self {
        Self { branch, ..*self }
    }

    /// A field of this entity.
    pub fn field(&self, name: impl Into<String>) -> FieldRef {
        FieldRef {
            entity: *self,
            field: name.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.kind, self.id, self.branch)
    }
}

/// A leaf or computed field of an entity. Computed fields are never written
/// directly; only evaluation produces their values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRef {
    pub entity: EntityRef,
    pub field: String,
}

impl FieldRef {
    pub fn new(entity: EntityRef, field: impl Into<String>) -> Self {
        Self {
            entity,
            field: field.into(),
        }
    }

    /// The same field on a different branch.
    pub fn on_branch(&self, branch: BranchId) -> Self {
        Self {
            entity: self.entity.on_branch(branch),
            field: self.field.clone(),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.field)
    }
}

/// Relation kind for a dependency edge that crosses entity boundaries.
///
/// Hierarchy edges ride on the same graph as field-level data dependencies,
/// so one traversal serves both "field X depends on field Y" and "parent
/// entity depends on child entity" invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HierarchyRel {
    /// The source field belongs to a parent of the dependent's entity.
    ParentOf,
    /// The source field belongs to a child of the dependent's entity
    /// (e.g. a Settlement aggregate reading Structure fields).
    ChildOf,
}

/// Directed dependency edge: `source` feeds `dependent`.
///
/// Invalidation walks edges in this direction; evaluation order walks them
/// in reverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyEdge {
    pub source: FieldRef,
    pub dependent: FieldRef,
    /// Set when the edge crosses entity boundaries via the hierarchy.
    pub relation: Option<HierarchyRel>,
}

impl DependencyEdge {
    pub fn new(source: FieldRef, dependent: FieldRef) -> Self {
        Self {
            source,
            dependent,
            relation: None,
        }
    }

    pub fn hierarchy(source: FieldRef, dependent: FieldRef, relation: HierarchyRel) -> Self {
        Self {
            source,
            dependent,
            relation: Some(relation),
        }
    }
}
