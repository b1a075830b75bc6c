//! Computed Field Service - the public read path.
//!
//! Cache-aside orchestration: try the cache, on miss evaluate in dependency
//! order against resolved state, store the result, and register the edges the
//! evaluation read. Concurrent misses on the same field are coalesced into a
//! single in-flight evaluation; a caller that times out abandons its wait
//! without aborting the shared evaluation, which still populates the cache.
//!
//! The cache is a pure accelerator: every cache failure is treated as a miss
//! and logged, never surfaced to the caller. The dependency graph is
//! different - without recorded edges a result cannot be invalidated, so a
//! value computed while the graph is unavailable is returned but not cached.
//!
//! Evaluations are fenced against concurrent invalidation: each one captures
//! the field's invalidation epoch when it starts, and a result whose epoch
//! has moved is neither cached nor handed to readers that arrived after the
//! invalidation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, instrument, warn};

use loreforge_domain::{
    EntityKind, EntityRef, EntitySummary, EvalContext, EvalError, FieldRef, HierarchyRel, Value,
};

use crate::fence::InvalidationFence;
use crate::graph::{DependencyGraph, GraphError};
use crate::infrastructure::ports::{CacheStorePort, ClockPort, StateStoreError, StateStorePort};
use crate::resolver::{KeyBuilder, VersionResolver};
use crate::rules::{aggregate, RuleRegistry, TtlClass};
use crate::settings::EngineSettings;
use crate::stats::{CacheCounters, CacheStatistics};

/// Historical (as-of) evaluation recursion cap. The live path is protected
/// by the graph's cycle rejection instead.
const MAX_AS_OF_DEPTH: usize = 32;

/// Why a computed value could not be produced. Distinct from an explicit
/// null value, so UIs can tell "no value" from "failed to compute".
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnavailableReason {
    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("Entity not found")]
    EntityNotFound,

    #[error("State store unavailable: {0}")]
    StateStore(String),

    #[error("Evaluation aborted")]
    Aborted,
}

/// Outcome of one computed-field read.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOutcome {
    Available(Value),
    Unavailable(UnavailableReason),
}

impl FieldOutcome {
    pub fn is_available(&self) -> bool {
        matches!(self, FieldOutcome::Available(_))
    }
}

/// Wire form of a computed-field cache entry.
///
/// `Tombstone` marks a key the coordinator invalidated: the value is pending
/// re-evaluation on that branch, so the branch-fork fallback must not stand
/// in an ancestor branch's entry for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub(crate) enum CacheEntry {
    Value(CachedComputation),
    Tombstone,
}

/// The evaluated value plus the field references it depended on, kept so
/// dependency edges can be rebuilt from a warm cache after a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CachedComputation {
    value: Value,
    depends_on: Vec<CachedDependency>,
    computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CachedDependency {
    source: FieldRef,
    relation: Option<HierarchyRel>,
}

/// What a cache lookup for a computed field found.
enum Lookup {
    Hit(FieldOutcome),
    Miss,
    /// An invalidation tombstone: re-evaluate on this branch, do not fall
    /// back to an ancestor entry.
    Diverged,
}

/// Shared result of one in-flight evaluation, tagged with the invalidation
/// epoch the evaluation started under.
type SharedOutcome = watch::Receiver<Option<(u64, FieldOutcome)>>;

/// The orchestrator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ComputedFieldService {
    inner: Arc<Inner>,
}

struct Inner {
    graph: Arc<DependencyGraph>,
    fence: Arc<InvalidationFence>,
    cache: Arc<dyn CacheStorePort>,
    state: Arc<dyn StateStorePort>,
    resolver: VersionResolver,
    clock: Arc<dyn ClockPort>,
    rules: RuleRegistry,
    keys: KeyBuilder,
    settings: EngineSettings,
    counters: CacheCounters,
    /// At most one in-flight evaluation per field reference.
    inflight: DashMap<FieldRef, SharedOutcome>,
}

impl ComputedFieldService {
    pub fn new(
        graph: Arc<DependencyGraph>,
        fence: Arc<InvalidationFence>,
        cache: Arc<dyn CacheStorePort>,
        state: Arc<dyn StateStorePort>,
        clock: Arc<dyn ClockPort>,
        rules: RuleRegistry,
        settings: EngineSettings,
    ) -> Self {
        let keys = KeyBuilder::new(settings.key_prefix.clone());
        let resolver = VersionResolver::new(state.clone());
        Self {
            inner: Arc::new(Inner {
                graph,
                fence,
                cache,
                state,
                resolver,
                clock,
                rules,
                keys,
                settings,
                counters: CacheCounters::new(),
                inflight: DashMap::new(),
            }),
        }
    }

    /// Current value of one field. Stored fields are read through; computed
    /// fields go through the cache-aside path.
    #[instrument(skip(self), fields(entity = %entity, field))]
    pub async fn get_computed_field(&self, entity: EntityRef, field: &str) -> FieldOutcome {
        self.get_field(entity.field(field)).await
    }

    /// A batch of fields on one entity, evaluated in dependency order.
    /// Failures are per-field: one unavailable field never aborts its
    /// siblings.
    pub async fn get_computed_fields(
        &self,
        entity: EntityRef,
        fields: &[&str],
    ) -> HashMap<String, FieldOutcome> {
        let requested: Vec<FieldRef> = fields.iter().map(|name| entity.field(*name)).collect();
        let order = match self.inner.graph.evaluation_order(&requested) {
            Ok(order) => order,
            Err(err) => {
                warn!(%err, "dependency graph unavailable for batch ordering, using request order");
                requested.clone()
            }
        };

        let mut results = HashMap::new();
        for field in &order {
            let outcome = self.get_field(field.clone()).await;
            if requested.contains(field) {
                results.insert(field.field.clone(), outcome);
            }
        }
        for field in &requested {
            if !results.contains_key(&field.field) {
                let outcome = self.get_field(field.clone()).await;
                results.insert(field.field.clone(), outcome);
            }
        }
        results
    }

    /// Historical read at an explicit point in time. Results are cached
    /// under an as-of-qualified key; they are immutable and never
    /// invalidated, so only the TTL bounds them, and no dependency edges are
    /// registered.
    pub async fn get_computed_field_as_of(
        &self,
        entity: EntityRef,
        field: &str,
        as_of: DateTime<Utc>,
    ) -> FieldOutcome {
        self.get_field_as_of(entity.field(field), as_of, 0).await
    }

    /// Cached child listing of a parent entity. The store remains
    /// authoritative; its errors propagate, cache errors do not.
    pub async fn get_entity_list(
        &self,
        parent: EntityRef,
        child_kind: EntityKind,
    ) -> Result<Vec<EntitySummary>, StateStoreError> {
        let key = self.inner.keys.list_key(&parent);
        match self.inner.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<EntitySummary>>(&raw) {
                Ok(listing) => {
                    self.inner.counters.record_hit();
                    return Ok(listing);
                }
                Err(err) => warn!(%key, %err, "dropping undecodable list cache entry"),
            },
            Ok(None) => {}
            Err(err) => warn!(%key, %err, "cache unavailable for list lookup, treating as miss"),
        }
        self.inner.counters.record_miss();

        let listing = self.inner.state.children(&parent, child_kind).await?;
        match serde_json::to_string(&listing) {
            Ok(raw) => {
                if let Err(err) = self
                    .inner
                    .cache
                    .put(&key, raw, self.inner.settings.list_ttl())
                    .await
                {
                    warn!(%key, %err, "failed to cache entity list");
                }
            }
            Err(err) => warn!(%key, %err, "failed to serialize entity list"),
        }
        Ok(listing)
    }

    /// Cached spatial query result. The engine performs no geometry itself;
    /// it only caches what the store computed.
    pub async fn get_spatial_result(
        &self,
        query_type: &str,
        params: &serde_json::Value,
        branch: loreforge_domain::BranchId,
    ) -> Result<serde_json::Value, StateStoreError> {
        let key = self.inner.keys.spatial_key(query_type, params, branch);
        match self.inner.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(result) => {
                    self.inner.counters.record_hit();
                    return Ok(result);
                }
                Err(err) => warn!(%key, %err, "dropping undecodable spatial cache entry"),
            },
            Ok(None) => {}
            Err(err) => warn!(%key, %err, "cache unavailable for spatial lookup, treating as miss"),
        }
        self.inner.counters.record_miss();

        let result = self
            .inner
            .state
            .spatial_query(query_type, params, branch)
            .await?;
        if let Err(err) = self
            .inner
            .cache
            .put(&key, result.to_string(), self.inner.settings.spatial_ttl())
            .await
        {
            warn!(%key, %err, "failed to cache spatial result");
        }
        Ok(result)
    }

    /// Monitoring snapshot. Backend failures degrade to zeroes.
    pub async fn get_cache_statistics(&self) -> CacheStatistics {
        let (hit_rate, miss_rate) = self.inner.counters.rates();
        let eviction_count = match self.inner.cache.eviction_count().await {
            Ok(count) => count,
            Err(err) => {
                warn!(%err, "cache unavailable for eviction count");
                0
            }
        };

        let mut prefixes: Vec<String> = EntityKind::ALL
            .iter()
            .map(|kind| self.inner.keys.kind_prefix(*kind))
            .collect();
        prefixes.push(self.inner.keys.list_prefix());
        prefixes.push(self.inner.keys.spatial_prefix());

        let mut key_count_by_prefix = HashMap::new();
        for prefix in prefixes {
            let count = match self.inner.cache.count_by_prefix(&prefix).await {
                Ok(count) => count,
                Err(err) => {
                    warn!(%prefix, %err, "cache unavailable for key count");
                    0
                }
            };
            key_count_by_prefix.insert(prefix, count);
        }

        CacheStatistics {
            hit_rate,
            miss_rate,
            eviction_count,
            key_count_by_prefix,
        }
    }

    fn get_field(&self, field: FieldRef) -> BoxFuture<'_, FieldOutcome> {
        Box::pin(async move {
            let kind = field.entity.kind;
            if !self.inner.rules.is_computed(kind, &field.field) {
                return self.read_stored_field(&field).await;
            }

            let key = self.inner.keys.field_key(&field);
            match self.cache_lookup(&field, &key).await {
                Lookup::Hit(outcome) => {
                    self.inner.counters.record_hit();
                    return outcome;
                }
                Lookup::Miss => {
                    if let Some(outcome) = self.fork_fallback(&field).await {
                        self.inner.counters.record_hit();
                        return outcome;
                    }
                }
                Lookup::Diverged => {}
            }
            self.inner.counters.record_miss();
            self.coalesced_evaluate(field).await
        })
    }

    /// Stored (non-computed) fields read through to the state store; caching
    /// them is the store's own concern.
    async fn read_stored_field(&self, field: &FieldRef) -> FieldOutcome {
        match self.inner.resolver.resolve(&field.entity, None).await {
            Ok(Some(snapshot)) => match snapshot.fields.get(&field.field) {
                Some(value) => FieldOutcome::Available(value.clone()),
                None => FieldOutcome::Unavailable(UnavailableReason::Eval(EvalError::missing(
                    field.field.clone(),
                ))),
            },
            Ok(None) => FieldOutcome::Unavailable(UnavailableReason::EntityNotFound),
            Err(err) => FieldOutcome::Unavailable(UnavailableReason::StateStore(err.to_string())),
        }
    }

    async fn cache_lookup(&self, field: &FieldRef, key: &str) -> Lookup {
        match self.inner.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(CacheEntry::Value(cached)) => {
                    self.ensure_edges(field, &cached.depends_on);
                    Lookup::Hit(FieldOutcome::Available(cached.value))
                }
                Ok(CacheEntry::Tombstone) => Lookup::Diverged,
                Err(err) => {
                    warn!(%key, %err, "dropping undecodable cache entry");
                    Lookup::Miss
                }
            },
            Ok(None) => Lookup::Miss,
            Err(err) => {
                warn!(%key, %err, "cache unavailable, treating as miss");
                Lookup::Miss
            }
        }
    }

    /// After a fork, a child branch may reuse an ancestor branch's cache
    /// entry for a field it has not diverged on. On a hit the entry is
    /// written back under the child's key so future reads skip the walk.
    async fn fork_fallback(&self, field: &FieldRef) -> Option<FieldOutcome> {
        let ancestry = match self
            .inner
            .resolver
            .branch_ancestry(field.entity.branch)
            .await
        {
            Ok(ancestry) => ancestry,
            Err(err) => {
                warn!(%err, "branch ancestry unavailable, skipping fork fallback");
                return None;
            }
        };

        for ancestor in ancestry.iter().skip(1) {
            let ancestor_field = field.on_branch(*ancestor);
            let ancestor_key = self.inner.keys.field_key(&ancestor_field);
            let raw = match self.inner.cache.get(&ancestor_key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    warn!(key = %ancestor_key, %err, "cache unavailable during fork fallback");
                    continue;
                }
            };
            let cached = match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(CacheEntry::Value(cached)) => cached,
                // The ancestor itself was invalidated; its entry is pending
                // re-evaluation and cannot stand in for the fork's.
                Ok(CacheEntry::Tombstone) => return None,
                Err(err) => {
                    warn!(key = %ancestor_key, %err, "dropping undecodable ancestor cache entry");
                    continue;
                }
            };

            // Rebase the dependency snapshot onto the child branch: future
            // mutations on the child must invalidate the copied entry.
            let rebased: Vec<CachedDependency> = cached
                .depends_on
                .iter()
                .map(|dep| CachedDependency {
                    source: dep.source.on_branch(field.entity.branch),
                    relation: dep.relation,
                })
                .collect();

            // A tombstone on any rebased dependency means the field's inputs
            // diverged on this branch and the ancestor entry no longer speaks
            // for it; evaluate directly instead.
            for dep in &rebased {
                let dep_key = self.inner.keys.field_key(&dep.source);
                match self.inner.cache.get(&dep_key).await {
                    Ok(Some(raw)) => {
                        if matches!(
                            serde_json::from_str::<CacheEntry>(&raw),
                            Ok(CacheEntry::Tombstone)
                        ) {
                            return None;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(key = %dep_key, %err, "cache unavailable during divergence check");
                    }
                }
            }

            let copy = CachedComputation {
                value: cached.value.clone(),
                depends_on: rebased.clone(),
                computed_at: cached.computed_at,
            };
            let child_key = self.inner.keys.field_key(field);
            let ttl = self.ttl_for_field(field);
            match serde_json::to_string(&CacheEntry::Value(copy)) {
                Ok(serialized) => {
                    if let Err(err) = self.inner.cache.put(&child_key, serialized, ttl).await {
                        warn!(key = %child_key, %err, "failed to write back forked cache entry");
                    }
                }
                Err(err) => warn!(key = %child_key, %err, "failed to serialize forked cache entry"),
            }
            self.ensure_edges(field, &rebased);
            return Some(FieldOutcome::Available(cached.value));
        }
        None
    }

    async fn coalesced_evaluate(&self, field: FieldRef) -> FieldOutcome {
        use dashmap::mapref::entry::Entry;

        loop {
            enum Role {
                Evaluator(watch::Sender<Option<(u64, FieldOutcome)>>, SharedOutcome),
                Waiter(SharedOutcome),
            }

            // Epoch at the moment this caller joins. A shared result whose
            // evaluation started under an older epoch was computed before an
            // invalidation this caller must observe.
            let joined = self.inner.fence.epoch(&field);

            let role = match self.inner.inflight.entry(field.clone()) {
                Entry::Occupied(entry) => Role::Waiter(entry.get().clone()),
                Entry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(rx.clone());
                    Role::Evaluator(tx, rx)
                }
            };

            match role {
                Role::Waiter(rx) => {
                    match await_shared(rx).await {
                        Some((epoch, outcome)) if epoch == joined => return outcome,
                        // Stale result (invalidated mid-flight) or the
                        // evaluator died; race to start a fresh evaluation.
                        _ => continue,
                    }
                }
                Role::Evaluator(tx, rx) => {
                    // Detached: a caller timeout abandons the wait, the
                    // evaluation keeps running and populates the cache for
                    // other and future callers.
                    let service = self.clone();
                    let target = field.clone();
                    tokio::spawn(async move {
                        let outcome = {
                            let _guard = InflightGuard {
                                service: service.clone(),
                                field: target.clone(),
                            };
                            service.evaluate_and_store(&target, joined).await
                        };
                        let _ = tx.send(Some((joined, outcome)));
                    });
                    // The evaluator's own caller began no later than its
                    // evaluation did, so its result is coherent for it even
                    // when a concurrent invalidation kept it out of the cache.
                    return match await_shared(rx).await {
                        Some((_, outcome)) => outcome,
                        None => FieldOutcome::Unavailable(UnavailableReason::Aborted),
                    };
                }
            }
        }
    }

    /// Evaluate one computed field against current state and cache the
    /// result.
    ///
    /// Dependency edges are registered from the rule's static reference set
    /// *before* any recursive resolution: the graph's cycle rejection is what
    /// makes the recursion terminate for mutually dependent rules.
    async fn evaluate_and_store(&self, field: &FieldRef, epoch: u64) -> FieldOutcome {
        let kind = field.entity.kind;
        let Some(rule) = self.inner.rules.get(kind, &field.field) else {
            return FieldOutcome::Unavailable(UnavailableReason::Eval(EvalError::missing(
                field.field.clone(),
            )));
        };

        let snapshot = match self.inner.resolver.resolve(&field.entity, None).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return FieldOutcome::Unavailable(UnavailableReason::EntityNotFound),
            Err(err) => {
                return FieldOutcome::Unavailable(UnavailableReason::StateStore(err.to_string()))
            }
        };

        // Static dependency set: the rule's own field references plus every
        // child field its aggregates read.
        let mut deps: Vec<(FieldRef, Option<HierarchyRel>)> = Vec::new();
        let own_fields: Vec<String> = rule
            .expr
            .referenced_fields()
            .into_iter()
            .filter(|name| !rule.aggregates.iter().any(|agg| agg.context_key == *name))
            .collect();
        for name in &own_fields {
            deps.push((field.entity.field(name.clone()), None));
        }

        let mut child_listings = Vec::with_capacity(rule.aggregates.len());
        for agg in &rule.aggregates {
            let children = match self.inner.state.children(&field.entity, agg.child_kind).await {
                Ok(children) => children,
                Err(err) => {
                    return FieldOutcome::Unavailable(UnavailableReason::StateStore(
                        err.to_string(),
                    ))
                }
            };
            for child in &children {
                deps.push((
                    child.entity.field(agg.child_field.clone()),
                    Some(HierarchyRel::ChildOf),
                ));
            }
            child_listings.push(children);
        }

        let edges_recorded = match self.inner.graph.record_dependencies(field, &deps) {
            Ok(()) => true,
            Err(GraphError::Cycle {
                source_field,
                dependent,
            }) => {
                return FieldOutcome::Unavailable(UnavailableReason::Eval(
                    EvalError::CycleDetected {
                        source_field,
                        dependent,
                    },
                ))
            }
            Err(GraphError::Unavailable(message)) => {
                error!(%field, %message, "dependency graph unavailable; result will not be cached");
                false
            }
        };

        // Resolve the context: own computed dependencies recurse, stored
        // ones come from the snapshot.
        let mut ctx = EvalContext::new();
        for name in &own_fields {
            if self.inner.rules.is_computed(kind, name) {
                match self.get_field(field.entity.field(name.clone())).await {
                    FieldOutcome::Available(value) => ctx.insert(name.clone(), value),
                    FieldOutcome::Unavailable(_) => {
                        return FieldOutcome::Unavailable(UnavailableReason::Eval(
                            EvalError::missing(name.clone()),
                        ))
                    }
                }
            } else if let Some(value) = snapshot.fields.get(name) {
                ctx.insert(name.clone(), value.clone());
            }
            // Absent stored fields stay out of the context; the evaluator
            // reports MissingDependency if the expression actually reads one.
        }

        for (agg, children) in rule.aggregates.iter().zip(&child_listings) {
            let mut values = Vec::with_capacity(children.len());
            for child in children {
                match self
                    .get_field(child.entity.field(agg.child_field.clone()))
                    .await
                {
                    FieldOutcome::Available(value) => values.push(value),
                    FieldOutcome::Unavailable(_) => {
                        return FieldOutcome::Unavailable(UnavailableReason::Eval(
                            EvalError::missing(format!("{}.{}", child.entity, agg.child_field)),
                        ))
                    }
                }
            }
            match aggregate(agg.op, &values) {
                Ok(value) => ctx.insert(agg.context_key.clone(), value),
                Err(err) => return FieldOutcome::Unavailable(UnavailableReason::Eval(err)),
            }
        }

        let value = match rule.expr.evaluate(&ctx) {
            Ok(value) => value,
            Err(err) => return FieldOutcome::Unavailable(UnavailableReason::Eval(err)),
        };

        if edges_recorded {
            if self.inner.fence.epoch(field) != epoch {
                // An invalidation landed mid-evaluation: this result reflects
                // pre-mutation state and must not outlive the deletion.
                debug!(%field, "invalidation raced this evaluation, skipping cache write");
                return FieldOutcome::Available(value);
            }
            let cached = CachedComputation {
                value: value.clone(),
                depends_on: deps
                    .iter()
                    .map(|(source, relation)| CachedDependency {
                        source: source.clone(),
                        relation: *relation,
                    })
                    .collect(),
                computed_at: self.inner.clock.now(),
            };
            let key = self.inner.keys.field_key(field);
            let ttl = self.inner.settings.ttl_for(rule.ttl);
            match serde_json::to_string(&CacheEntry::Value(cached)) {
                Ok(serialized) => {
                    if let Err(err) = self.inner.cache.put(&key, serialized, ttl).await {
                        warn!(%key, %err, "failed to cache computed field");
                    }
                }
                Err(err) => warn!(%key, %err, "failed to serialize computed field"),
            }
        }

        FieldOutcome::Available(value)
    }

    fn get_field_as_of(
        &self,
        field: FieldRef,
        as_of: DateTime<Utc>,
        depth: usize,
    ) -> BoxFuture<'_, FieldOutcome> {
        Box::pin(async move {
            if depth > MAX_AS_OF_DEPTH {
                return FieldOutcome::Unavailable(UnavailableReason::Eval(EvalError::missing(
                    format!("{} (as-of recursion too deep)", field.field),
                )));
            }
            let kind = field.entity.kind;
            if !self.inner.rules.is_computed(kind, &field.field) {
                return self.read_stored_field_as_of(&field, as_of).await;
            }

            let key = self.inner.keys.field_key_as_of(&field, as_of);
            match self.inner.cache.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<CacheEntry>(&raw) {
                    Ok(CacheEntry::Value(cached)) => {
                        self.inner.counters.record_hit();
                        return FieldOutcome::Available(cached.value);
                    }
                    // As-of keys are never invalidated; treat a stray
                    // tombstone as a plain miss.
                    Ok(CacheEntry::Tombstone) => {}
                    Err(err) => warn!(%key, %err, "dropping undecodable historical cache entry"),
                },
                Ok(None) => {}
                Err(err) => warn!(%key, %err, "cache unavailable for historical read"),
            }
            self.inner.counters.record_miss();

            let Some(rule) = self.inner.rules.get(kind, &field.field) else {
                return FieldOutcome::Unavailable(UnavailableReason::Eval(EvalError::missing(
                    field.field.clone(),
                )));
            };
            let snapshot = match self.inner.resolver.resolve(&field.entity, Some(as_of)).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => return FieldOutcome::Unavailable(UnavailableReason::EntityNotFound),
                Err(err) => {
                    return FieldOutcome::Unavailable(UnavailableReason::StateStore(
                        err.to_string(),
                    ))
                }
            };

            let mut ctx = EvalContext::new();
            for name in rule.expr.referenced_fields() {
                if rule.aggregates.iter().any(|agg| agg.context_key == name) {
                    continue;
                }
                if self.inner.rules.is_computed(kind, &name) {
                    match self
                        .get_field_as_of(field.entity.field(name.clone()), as_of, depth + 1)
                        .await
                    {
                        FieldOutcome::Available(value) => ctx.insert(name, value),
                        FieldOutcome::Unavailable(_) => {
                            return FieldOutcome::Unavailable(UnavailableReason::Eval(
                                EvalError::missing(name),
                            ))
                        }
                    }
                } else if let Some(value) = snapshot.fields.get(&name) {
                    ctx.insert(name, value.clone());
                }
            }

            // Historical hierarchy membership is approximated by current
            // membership; the store does not expose as-of listings.
            for agg in &rule.aggregates {
                let children = match self.inner.state.children(&field.entity, agg.child_kind).await
                {
                    Ok(children) => children,
                    Err(err) => {
                        return FieldOutcome::Unavailable(UnavailableReason::StateStore(
                            err.to_string(),
                        ))
                    }
                };
                let mut values = Vec::with_capacity(children.len());
                for child in &children {
                    match self
                        .get_field_as_of(
                            child.entity.field(agg.child_field.clone()),
                            as_of,
                            depth + 1,
                        )
                        .await
                    {
                        FieldOutcome::Available(value) => values.push(value),
                        FieldOutcome::Unavailable(_) => {
                            return FieldOutcome::Unavailable(UnavailableReason::Eval(
                                EvalError::missing(format!(
                                    "{}.{}",
                                    child.entity, agg.child_field
                                )),
                            ))
                        }
                    }
                }
                match aggregate(agg.op, &values) {
                    Ok(value) => ctx.insert(agg.context_key.clone(), value),
                    Err(err) => return FieldOutcome::Unavailable(UnavailableReason::Eval(err)),
                }
            }

            let value = match rule.expr.evaluate(&ctx) {
                Ok(value) => value,
                Err(err) => return FieldOutcome::Unavailable(UnavailableReason::Eval(err)),
            };

            let cached = CachedComputation {
                value: value.clone(),
                depends_on: Vec::new(),
                computed_at: self.inner.clock.now(),
            };
            let ttl = self.inner.settings.ttl_for(rule.ttl);
            match serde_json::to_string(&CacheEntry::Value(cached)) {
                Ok(serialized) => {
                    if let Err(err) = self.inner.cache.put(&key, serialized, ttl).await {
                        warn!(%key, %err, "failed to cache historical value");
                    }
                }
                Err(err) => warn!(%key, %err, "failed to serialize historical value"),
            }
            FieldOutcome::Available(value)
        })
    }

    async fn read_stored_field_as_of(&self, field: &FieldRef, as_of: DateTime<Utc>) -> FieldOutcome {
        match self.inner.resolver.resolve(&field.entity, Some(as_of)).await {
            Ok(Some(snapshot)) => match snapshot.fields.get(&field.field) {
                Some(value) => FieldOutcome::Available(value.clone()),
                None => FieldOutcome::Unavailable(UnavailableReason::Eval(EvalError::missing(
                    field.field.clone(),
                ))),
            },
            Ok(None) => FieldOutcome::Unavailable(UnavailableReason::EntityNotFound),
            Err(err) => FieldOutcome::Unavailable(UnavailableReason::StateStore(err.to_string())),
        }
    }

    /// Rebuild dependency edges from a cached entry when the graph has no
    /// record of this field (cold cache survives a process restart, the
    /// in-memory graph does not).
    fn ensure_edges(&self, field: &FieldRef, deps: &[CachedDependency]) {
        match self.inner.graph.has_dependencies(field) {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => {
                warn!(%field, %err, "dependency graph unavailable, cannot verify edges");
                return;
            }
        }
        let sources: Vec<(FieldRef, Option<HierarchyRel>)> = deps
            .iter()
            .map(|dep| (dep.source.clone(), dep.relation))
            .collect();
        if let Err(err) = self.inner.graph.record_dependencies(field, &sources) {
            warn!(%field, %err, "failed to rebuild dependency edges from cache");
        }
    }

    fn ttl_for_field(&self, field: &FieldRef) -> std::time::Duration {
        let class = self
            .inner
            .rules
            .get(field.entity.kind, &field.field)
            .map(|rule| rule.ttl)
            .unwrap_or(TtlClass::Computed);
        self.inner.settings.ttl_for(class)
    }
}

/// Removes the in-flight entry when the evaluation finishes or unwinds, so
/// a panicked evaluation never wedges later callers.
struct InflightGuard {
    service: ComputedFieldService,
    field: FieldRef,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.service.inner.inflight.remove(&self.field);
    }
}

/// Wait for a shared evaluation's result. `None` means the evaluator went
/// away without producing one.
async fn await_shared(mut rx: SharedOutcome) -> Option<(u64, FieldOutcome)> {
    loop {
        if let Some(outcome) = rx.borrow().clone() {
            return Some(outcome);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}
