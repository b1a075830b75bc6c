//! Invalidation Coordinator.
//!
//! Turns one source-field change into the full set of cache deletions and a
//! published invalidation event. Each request moves through an explicit
//! state machine:
//!
//! ```text
//! Received -> ComputingSet -> Deleting -> Publishing -> Done
//!     \------------------------------------> Failed
//! ```
//!
//! Graph failure is fatal to an invalidation and surfaced after retries - an
//! un-invalidated cache entry is a correctness bug, unlike a failed read-side
//! cache lookup which merely costs a re-evaluation. Deletion completes before
//! the mutation is reported committed to callers, so a read that starts after
//! invalidation never observes the stale value. Publishing happens only after
//! deletion, and is best-effort.

use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use loreforge_domain::{BranchId, EntityRef, FieldRef, InvalidationCause, InvalidationEvent};

use crate::fence::InvalidationFence;
use crate::graph::{DependencyGraph, GraphError};
use crate::infrastructure::ports::{CacheStorePort, ClockPort, EventBusPort};
use crate::resolver::KeyBuilder;
use crate::service::CacheEntry;
use crate::settings::EngineSettings;

/// Lifecycle of one invalidation request. Logged at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationPhase {
    Received,
    ComputingSet,
    Deleting,
    Publishing,
    Done,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidationError {
    /// The dependency graph stayed unavailable through every retry. Must be
    /// escalated: serving from an un-invalidated cache risks stale data.
    #[error("Dependency graph unavailable after {attempts} attempts: {message}")]
    GraphUnavailable { attempts: u32, message: String },

    /// Cache deletions kept failing after retries. The TTL backstop bounds
    /// the resulting staleness, but operators must know.
    #[error("Cache deletion failed for {failed} of {total} keys")]
    DeleteFailed { failed: usize, total: usize },
}

/// Result of a completed invalidation.
#[derive(Debug, Clone)]
pub struct InvalidationOutcome {
    pub changed: FieldRef,
    /// The changed field plus every transitive dependent, hierarchy edges
    /// included. A hierarchy change additionally seeds from the entity's
    /// other graph-known fields.
    pub affected: Vec<FieldRef>,
    pub deleted_keys: usize,
}

pub struct InvalidationCoordinator {
    graph: Arc<DependencyGraph>,
    fence: Arc<InvalidationFence>,
    cache: Arc<dyn CacheStorePort>,
    bus: Arc<dyn EventBusPort>,
    clock: Arc<dyn ClockPort>,
    keys: KeyBuilder,
    settings: EngineSettings,
}

impl InvalidationCoordinator {
    pub fn new(
        graph: Arc<DependencyGraph>,
        fence: Arc<InvalidationFence>,
        cache: Arc<dyn CacheStorePort>,
        bus: Arc<dyn EventBusPort>,
        clock: Arc<dyn ClockPort>,
        settings: EngineSettings,
    ) -> Self {
        let keys = KeyBuilder::new(settings.key_prefix.clone());
        Self {
            graph,
            fence,
            cache,
            bus,
            clock,
            keys,
            settings,
        }
    }

    /// Invalidate everything downstream of one changed field.
    ///
    /// Idempotent: re-delivering the same mutation notification deletes
    /// already-absent keys, which is a no-op.
    #[instrument(skip(self), fields(changed = %changed))]
    pub async fn invalidate(
        &self,
        changed: FieldRef,
        cause: InvalidationCause,
    ) -> Result<InvalidationOutcome, InvalidationError> {
        let mut phase = InvalidationPhase::Received;
        debug!(?phase, ?cause, "invalidation request received");

        phase = InvalidationPhase::ComputingSet;
        debug!(?phase, "computing invalidation set");
        let mut seeds = vec![changed.clone()];
        if cause == InvalidationCause::HierarchyChanged {
            // The parent pointer carries no edges of its own; the entries
            // that go stale on a re-parent hang off the entity's other
            // graph-known fields (e.g. the child values feeding a parent
            // aggregate).
            match self
                .with_graph_retry(|| self.graph.entity_fields(&changed.entity))
                .await
            {
                Ok(fields) => {
                    for field in fields {
                        if !seeds.contains(&field) {
                            seeds.push(field);
                        }
                    }
                }
                Err(err) => {
                    phase = InvalidationPhase::Failed;
                    error!(?phase, %err, "invalidation failed: dependency graph unavailable");
                    return Err(err);
                }
            }
        }
        let mut affected: Vec<FieldRef> = Vec::new();
        for seed in &seeds {
            if !affected.contains(seed) {
                affected.push(seed.clone());
            }
            let dependents = match self
                .with_graph_retry(|| self.graph.reverse_dependents(seed))
                .await
            {
                Ok(dependents) => dependents,
                Err(err) => {
                    phase = InvalidationPhase::Failed;
                    error!(?phase, %err, "invalidation failed: dependency graph unavailable");
                    return Err(err);
                }
            };
            for dependent in dependents {
                if !affected.contains(&dependent) {
                    affected.push(dependent);
                }
            }
        }

        phase = InvalidationPhase::Deleting;
        // Fence first: an evaluation that read pre-mutation state must not
        // cache its result or satisfy readers arriving after this point.
        for field in &affected {
            self.fence.bump(field);
        }
        let keys = self.keys_for(&changed, &affected, cause);
        debug!(?phase, keys = keys.len(), "deleting cache entries");
        let failed = self.delete_with_retry(&keys).await;
        if failed > 0 {
            phase = InvalidationPhase::Failed;
            error!(
                ?phase,
                failed,
                total = keys.len(),
                "invalidation failed: cache deletions did not complete; TTL will bound staleness"
            );
            return Err(InvalidationError::DeleteFailed {
                failed,
                total: keys.len(),
            });
        }
        self.write_tombstones(&affected).await;

        phase = InvalidationPhase::Publishing;
        debug!(?phase, affected = affected.len(), "publishing invalidation event");
        let event = InvalidationEvent {
            changed: changed.clone(),
            cause,
            affected: affected.clone(),
            occurred_at: self.clock.now(),
        };
        if let Err(err) = self.bus.publish(event).await {
            // Best-effort: subscribers fall back to the TTL backstop.
            warn!(%err, "failed to publish invalidation event");
        }

        phase = InvalidationPhase::Done;
        debug!(?phase, "invalidation complete");
        Ok(InvalidationOutcome {
            changed,
            affected,
            deleted_keys: keys.len(),
        })
    }

    /// Drop every cached value of one entity - all fields, historical
    /// variants included - plus its child-list key. Used when an entity is
    /// deleted or restructured wholesale, where walking field-level edges
    /// would enumerate keys the prefix already covers.
    #[instrument(skip(self), fields(entity = %entity))]
    pub async fn invalidate_entity(
        &self,
        entity: EntityRef,
    ) -> Result<u64, InvalidationError> {
        let known_fields = match self.graph.entity_fields(&entity) {
            Ok(fields) => fields,
            Err(err) => {
                warn!(%entity, %err, "dependency graph unavailable, purging without field fences");
                Vec::new()
            }
        };
        for field in &known_fields {
            self.fence.bump(field);
        }
        let prefix = self.keys.entity_prefix(&entity);
        let removed = match self.cache.delete_by_prefix(&prefix).await {
            Ok(removed) => removed,
            Err(err) => {
                error!(%prefix, %err, "entity-wide cache purge failed; TTL will bound staleness");
                return Err(InvalidationError::DeleteFailed {
                    failed: 1,
                    total: 1,
                });
            }
        };
        if let Err(err) = self.cache.delete(&self.keys.list_key(&entity)).await {
            warn!(%err, "failed to delete entity list key during purge");
        }
        self.write_tombstones(&known_fields).await;
        debug!(removed, "entity-wide cache purge complete");
        Ok(removed)
    }

    /// Branch merge: a full invalidation of the target branch's affected
    /// fields rather than value-level reconciliation of the two caches.
    pub async fn invalidate_branch_merge(
        &self,
        target: BranchId,
        changed_fields: &[FieldRef],
    ) -> Result<Vec<InvalidationOutcome>, InvalidationError> {
        let mut outcomes = Vec::with_capacity(changed_fields.len());
        for field in changed_fields {
            let rebased = field.on_branch(target);
            outcomes.push(
                self.invalidate(rebased, InvalidationCause::BranchMerge)
                    .await?,
            );
        }
        Ok(outcomes)
    }

    /// Cache keys for the affected set: the latest key of every affected
    /// field, plus child-list keys of any parent entity whose aggregate was
    /// reached through the hierarchy, plus the changed entity's own list key
    /// when the hierarchy itself changed.
    fn keys_for(
        &self,
        changed: &FieldRef,
        affected: &[FieldRef],
        cause: InvalidationCause,
    ) -> Vec<String> {
        let mut keys: Vec<String> = Vec::with_capacity(affected.len());
        let mut list_entities: Vec<EntityRef> = Vec::new();
        for field in affected {
            keys.push(self.keys.field_key(field));
            if field.entity != changed.entity && !list_entities.contains(&field.entity) {
                list_entities.push(field.entity);
            }
        }
        if cause == InvalidationCause::HierarchyChanged
            && !list_entities.contains(&changed.entity)
        {
            list_entities.push(changed.entity);
        }
        for entity in list_entities {
            keys.push(self.keys.list_key(&entity));
        }
        keys.dedup();
        keys
    }

    /// Mark invalidated field keys with short-lived tombstones so a forked
    /// branch's first read after divergence does not reuse an ancestor
    /// branch's entry. Best-effort: the TTL backstop bounds what a failed
    /// write can cost.
    async fn write_tombstones(&self, affected: &[FieldRef]) {
        let raw = match serde_json::to_string(&CacheEntry::Tombstone) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%err, "failed to serialize tombstone");
                return;
            }
        };
        for field in affected {
            let key = self.keys.field_key(field);
            if let Err(err) = self
                .cache
                .put(&key, raw.clone(), self.settings.tombstone_ttl())
                .await
            {
                warn!(%key, %err, "failed to write invalidation tombstone");
            }
        }
    }

    async fn with_graph_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T, GraphError>,
    ) -> Result<T, InvalidationError> {
        let attempts = self.settings.graph_retry_attempts.max(1);
        let mut last_message = String::new();
        for attempt in 0..attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(GraphError::Cycle { .. }) => {
                    // Cannot happen on a read, but the error type is shared.
                    last_message = "unexpected cycle report on read".to_string();
                }
                Err(GraphError::Unavailable(message)) => {
                    warn!(attempt, %message, "dependency graph unavailable, retrying");
                    last_message = message;
                }
            }
            if attempt + 1 < attempts {
                let delay = self.settings.graph_retry_base_delay() * 2u32.pow(attempt);
                tokio::time::sleep(delay).await;
            }
        }
        Err(InvalidationError::GraphUnavailable {
            attempts,
            message: last_message,
        })
    }

    /// Delete every key, retrying failures. Returns how many still failed.
    async fn delete_with_retry(&self, keys: &[String]) -> usize {
        let mut pending: Vec<&String> = keys.iter().collect();
        for round in 0..=self.settings.delete_retry_attempts {
            let mut failed = Vec::new();
            for key in pending {
                if let Err(err) = self.cache.delete(key).await {
                    warn!(%key, %err, round, "cache delete failed");
                    failed.push(key);
                }
            }
            if failed.is_empty() {
                return 0;
            }
            pending = failed;
            if round < self.settings.delete_retry_attempts {
                tokio::time::sleep(self.settings.graph_retry_base_delay()).await;
            }
        }
        pending.len()
    }
}
