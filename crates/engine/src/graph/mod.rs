//! Dependency Graph Manager.
//!
//! A directed graph of "computed field depends on source fields", shared by
//! every evaluation and invalidation in the engine. Edges point from source
//! to dependent, so invalidation walks edges forward and evaluation order
//! walks them backward.
//!
//! The graph is acyclic by construction: an edge set that would close a cycle
//! is rejected atomically at registration time, and the evaluation that
//! produced it fails. Hierarchy relationships (Settlement <-> Structure,
//! Kingdom <-> Settlement) are ordinary edges tagged with a relation kind, so
//! one traversal serves both field-level and parent/child invalidation.
//!
//! # Concurrency
//!
//! Read-mostly workload: evaluations read the graph far more often than they
//! rewrite edges. Storage is sharded by the entity kind of the keyed field,
//! one reader-writer lock per shard, always acquired in `EntityKind::index()`
//! order. Traversals are CPU-only; locks are never held across await points.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use loreforge_domain::{DependencyEdge, EntityKind, EntityRef, FieldRef, HierarchyRel};

/// Errors from graph operations.
///
/// `Unavailable` is fatal to invalidation (an un-invalidated cache entry is a
/// correctness bug, not a performance one) and is retried by the coordinator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    #[error("Dependency graph unavailable: {0}")]
    Unavailable(String),

    #[error("Cycle detected: {source_field} already depends on {dependent}")]
    Cycle {
        source_field: FieldRef,
        dependent: FieldRef,
    },
}

#[derive(Default)]
struct GraphShard {
    /// Outgoing edges keyed by source field (source's entity kind == shard).
    forward: HashMap<FieldRef, Vec<DependencyEdge>>,
    /// Incoming edges keyed by dependent field (dependent's kind == shard).
    /// This is the replacement unit: a re-evaluation swaps the whole set.
    incoming: HashMap<FieldRef, Vec<DependencyEdge>>,
}

/// The shared dependency graph. One instance per engine.
pub struct DependencyGraph {
    shards: Vec<RwLock<GraphShard>>,
    /// First-seen sequence per field, for deterministic topo tie-breaking.
    insertion_seq: RwLock<HashMap<FieldRef, u64>>,
    next_seq: AtomicU64,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        let shards = EntityKind::ALL
            .iter()
            .map(|_| RwLock::new(GraphShard::default()))
            .collect();
        Self {
            shards,
            insertion_seq: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Replace all dependencies of `dependent` with `sources`.
    ///
    /// Stale edges from the field's previous evaluation are removed, not
    /// merely shadowed, so dependencies the rule no longer reads stop
    /// triggering invalidation. If the new edge set would create a cycle the
    /// call fails and the graph is left unchanged.
    pub fn record_dependencies(
        &self,
        dependent: &FieldRef,
        sources: &[(FieldRef, Option<HierarchyRel>)],
    ) -> Result<(), GraphError> {
        let mut guards = self.write_all()?;

        // Reject before mutating: if any source is reachable from the
        // dependent along existing forward edges, the new reverse edge would
        // close a cycle. The dependent itself counts as reachable, which
        // also rejects direct self-dependencies.
        let reachable = reachable_from(&guards_as_read(&guards), dependent);
        for (source, _) in sources {
            if reachable.contains(source) {
                return Err(GraphError::Cycle {
                    source_field: source.clone(),
                    dependent: dependent.clone(),
                });
            }
        }

        // Drop the previous edge set for this dependent.
        let dep_shard = dependent.entity.kind.index();
        if let Some(old_edges) = guards[dep_shard].incoming.remove(dependent) {
            for old in old_edges {
                let src_shard = old.source.entity.kind.index();
                if let Some(out) = guards[src_shard].forward.get_mut(&old.source) {
                    out.retain(|edge| edge.dependent != *dependent);
                    if out.is_empty() {
                        guards[src_shard].forward.remove(&old.source);
                    }
                }
            }
        }

        // Install the new set, first occurrence winning on duplicate sources.
        let mut seen = HashSet::new();
        let mut edges = Vec::new();
        for (source, relation) in sources {
            if !seen.insert(source.clone()) {
                continue;
            }
            let edge = DependencyEdge {
                source: source.clone(),
                dependent: dependent.clone(),
                relation: *relation,
            };
            let src_shard = source.entity.kind.index();
            guards[src_shard]
                .forward
                .entry(source.clone())
                .or_default()
                .push(edge.clone());
            edges.push(edge);
        }
        guards[dep_shard].incoming.insert(dependent.clone(), edges);
        drop(guards);

        self.assign_seq(dependent)?;
        for (source, _) in sources {
            self.assign_seq(source)?;
        }
        Ok(())
    }

    /// All fields transitively invalidated by a change to `field`, in BFS
    /// discovery order, deduplicated, the field itself excluded. Terminates
    /// because the graph is acyclic by construction.
    pub fn reverse_dependents(&self, field: &FieldRef) -> Result<Vec<FieldRef>, GraphError> {
        let guards = self.read_all()?;
        let mut visited: HashSet<FieldRef> = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();
        visited.insert(field.clone());
        queue.push_back(field.clone());

        while let Some(current) = queue.pop_front() {
            let shard = current.entity.kind.index();
            if let Some(edges) = guards[shard].forward.get(&current) {
                for edge in edges {
                    if visited.insert(edge.dependent.clone()) {
                        order.push(edge.dependent.clone());
                        queue.push_back(edge.dependent.clone());
                    }
                }
            }
        }
        Ok(order)
    }

    /// Topological evaluation order for `requested` and all their ancestors
    /// (transitive sources): sources come before dependents. Ties are broken
    /// by first-registration order so batch evaluation is deterministic.
    pub fn evaluation_order(&self, requested: &[FieldRef]) -> Result<Vec<FieldRef>, GraphError> {
        let guards = self.read_all()?;

        // Collect the restricted node set: requested fields plus ancestors.
        let mut nodes: Vec<FieldRef> = Vec::new();
        let mut seen: HashSet<FieldRef> = HashSet::new();
        let mut queue: VecDeque<FieldRef> = VecDeque::new();
        for field in requested {
            if seen.insert(field.clone()) {
                nodes.push(field.clone());
                queue.push_back(field.clone());
            }
        }
        while let Some(current) = queue.pop_front() {
            let shard = current.entity.kind.index();
            if let Some(edges) = guards[shard].incoming.get(&current) {
                for edge in edges {
                    if seen.insert(edge.source.clone()) {
                        nodes.push(edge.source.clone());
                        queue.push_back(edge.source.clone());
                    }
                }
            }
        }

        // Kahn's algorithm over the restricted subgraph, by node index.
        let index_of: HashMap<&FieldRef, usize> =
            nodes.iter().enumerate().map(|(i, node)| (node, i)).collect();
        let mut indegree = vec![0usize; nodes.len()];
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            let shard = node.entity.kind.index();
            if let Some(edges) = guards[shard].incoming.get(node) {
                for edge in edges {
                    if let Some(&source) = index_of.get(&edge.source) {
                        indegree[i] += 1;
                        adjacency[source].push(i);
                    }
                }
            }
        }

        let seq_guard = self
            .insertion_seq
            .read()
            .map_err(|_| GraphError::Unavailable("insertion-order index poisoned".to_string()))?;
        // Primary key: first-registration sequence. Unregistered fields sort
        // last, tie-broken by discovery (request) order via the node index.
        let sort_key = |i: &usize| (seq_guard.get(&nodes[*i]).copied().unwrap_or(u64::MAX), *i);

        let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
        ready.sort_by_key(sort_key);

        let mut order = Vec::with_capacity(nodes.len());
        while !ready.is_empty() {
            let next = ready.remove(0);
            order.push(nodes[next].clone());
            for &dependent in &adjacency[next] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.push(dependent);
                }
            }
            ready.sort_by_key(sort_key);
        }
        Ok(order)
    }

    /// Every field of `entity` the graph knows about, whether as an edge
    /// source or as a dependent, sorted by field name. Hierarchy invalidation
    /// seeds from these when the changed field itself (the parent pointer)
    /// carries no edges of its own.
    pub fn entity_fields(&self, entity: &EntityRef) -> Result<Vec<FieldRef>, GraphError> {
        let guards = self.read_all()?;
        let shard = &guards[entity.kind.index()];
        let mut fields: Vec<FieldRef> = Vec::new();
        for field in shard.forward.keys().chain(shard.incoming.keys()) {
            if field.entity == *entity && !fields.contains(field) {
                fields.push(field.clone());
            }
        }
        fields.sort_by(|a, b| a.field.cmp(&b.field));
        Ok(fields)
    }

    /// Whether the graph holds a dependency set for `field`. Used to decide
    /// if edges must be rebuilt from a cached entry after a cold start.
    pub fn has_dependencies(&self, field: &FieldRef) -> Result<bool, GraphError> {
        let guards = self.read_all()?;
        let shard = field.entity.kind.index();
        Ok(guards[shard].incoming.contains_key(field))
    }

    /// The current dependency set of `field` (introspection and tests).
    pub fn dependencies_of(&self, field: &FieldRef) -> Result<Vec<DependencyEdge>, GraphError> {
        let guards = self.read_all()?;
        let shard = field.entity.kind.index();
        Ok(guards[shard].incoming.get(field).cloned().unwrap_or_default())
    }

    fn read_all(&self) -> Result<Vec<RwLockReadGuard<'_, GraphShard>>, GraphError> {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .map_err(|_| GraphError::Unavailable("graph shard poisoned".to_string()))
            })
            .collect()
    }

    fn write_all(&self) -> Result<Vec<RwLockWriteGuard<'_, GraphShard>>, GraphError> {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .write()
                    .map_err(|_| GraphError::Unavailable("graph shard poisoned".to_string()))
            })
            .collect()
    }

    fn assign_seq(&self, field: &FieldRef) -> Result<(), GraphError> {
        let mut guard = self
            .insertion_seq
            .write()
            .map_err(|_| GraphError::Unavailable("insertion-order index poisoned".to_string()))?;
        if !guard.contains_key(field) {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            guard.insert(field.clone(), seq);
        }
        Ok(())
    }

    /// Poison the first shard by panicking while holding its write lock.
    /// Exists so coordinator retry behavior can be exercised.
    #[cfg(test)]
    pub fn poison_for_tests(&self) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.shards[0].write();
            panic!("poisoning graph shard for test");
        }));
        assert!(result.is_err());
    }
}

/// Every field reachable from `start` along forward edges, `start` included.
fn reachable_from(
    guards: &[&GraphShard],
    start: &FieldRef,
) -> HashSet<FieldRef> {
    let mut visited: HashSet<FieldRef> = HashSet::new();
    let mut queue = VecDeque::new();
    visited.insert(start.clone());
    queue.push_back(start.clone());
    while let Some(current) = queue.pop_front() {
        let shard = current.entity.kind.index();
        if let Some(edges) = guards[shard].forward.get(&current) {
            for edge in edges {
                if visited.insert(edge.dependent.clone()) {
                    queue.push_back(edge.dependent.clone());
                }
            }
        }
    }
    visited
}

fn guards_as_read<'a>(guards: &'a [RwLockWriteGuard<'_, GraphShard>]) -> Vec<&'a GraphShard> {
    guards.iter().map(|guard| &**guard).collect()
}
