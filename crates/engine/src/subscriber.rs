//! Mutation subscriber.
//!
//! Bridges the state store's mutation stream to the invalidation
//! coordinator: every changed field becomes one invalidation request. A
//! failed invalidation is logged and the loop moves on; the TTL backstop
//! bounds the staleness window such a failure opens.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info};

use loreforge_domain::{InvalidationCause, MutationNotice};

use crate::coordinator::InvalidationCoordinator;
use crate::infrastructure::ports::StateStorePort;

/// Stored field whose change means the entity was re-parented. Invalidation
/// for it must also cascade through hierarchy-tagged edges and listing keys.
const PARENT_FIELD: &str = "parentId";

pub struct MutationSubscriber {
    state: Arc<dyn StateStorePort>,
    coordinator: Arc<InvalidationCoordinator>,
    shutdown: watch::Receiver<bool>,
}

impl MutationSubscriber {
    pub fn new(
        state: Arc<dyn StateStorePort>,
        coordinator: Arc<InvalidationCoordinator>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state,
            coordinator,
            shutdown,
        }
    }

    /// Consume the mutation stream until it ends or shutdown is signalled.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut mutations = self.state.subscribe_to_mutations();
        info!("mutation subscriber started");
        loop {
            tokio::select! {
                maybe_notice = mutations.next() => {
                    match maybe_notice {
                        Some(notice) => self.handle(notice).await,
                        None => {
                            info!("mutation stream ended");
                            break;
                        }
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("mutation subscriber shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle(&self, notice: MutationNotice) {
        debug!(entity = %notice.entity, fields = ?notice.changed_fields, "mutation received");
        for field in notice.changed_field_refs() {
            let cause = if field.field == PARENT_FIELD {
                InvalidationCause::HierarchyChanged
            } else {
                InvalidationCause::FieldChanged
            };
            if let Err(err) = self.coordinator.invalidate(field.clone(), cause).await {
                error!(%field, %err, "invalidation failed; staleness bounded by TTL");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use loreforge_domain::{
        BranchId, EntityId, EntityKind, EntityRef, EntitySummary, InvalidationEvent, StateSnapshot,
    };

    use super::*;
    use crate::fence::InvalidationFence;
    use crate::graph::DependencyGraph;
    use crate::infrastructure::ports::{
        CacheStorePort, ClockPort, EventBusError, EventBusPort, MutationStream, StateStoreError,
        SystemClock,
    };
    use crate::infrastructure::MemoryCacheStore;
    use crate::resolver::KeyBuilder;
    use crate::settings::EngineSettings;

    /// State store stub that only serves a canned mutation stream.
    struct StreamOnlyStore {
        notices: Mutex<Option<Vec<MutationNotice>>>,
        endless: bool,
    }

    impl StreamOnlyStore {
        fn with_notices(notices: Vec<MutationNotice>) -> Self {
            Self {
                notices: Mutex::new(Some(notices)),
                endless: false,
            }
        }

        fn endless() -> Self {
            Self {
                notices: Mutex::new(Some(Vec::new())),
                endless: true,
            }
        }
    }

    #[async_trait]
    impl StateStorePort for StreamOnlyStore {
        async fn fetch_state(
            &self,
            _entity: &EntityRef,
            _as_of: Option<DateTime<Utc>>,
        ) -> Result<Option<StateSnapshot>, StateStoreError> {
            Ok(None)
        }

        async fn children(
            &self,
            _entity: &EntityRef,
            _child_kind: EntityKind,
        ) -> Result<Vec<EntitySummary>, StateStoreError> {
            Ok(Vec::new())
        }

        async fn parent_branch(
            &self,
            _branch: BranchId,
        ) -> Result<Option<BranchId>, StateStoreError> {
            Ok(None)
        }

        async fn spatial_query(
            &self,
            _query_type: &str,
            _params: &serde_json::Value,
            _branch: BranchId,
        ) -> Result<serde_json::Value, StateStoreError> {
            Ok(serde_json::Value::Null)
        }

        fn subscribe_to_mutations(&self) -> MutationStream {
            let notices = self
                .notices
                .lock()
                .expect("lock")
                .take()
                .unwrap_or_default();
            if self.endless {
                Box::pin(futures_util::stream::iter(notices).chain(futures_util::stream::pending()))
            } else {
                Box::pin(futures_util::stream::iter(notices))
            }
        }
    }

    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<InvalidationEvent>>,
    }

    #[async_trait]
    impl EventBusPort for RecordingBus {
        async fn publish(&self, event: InvalidationEvent) -> Result<(), EventBusError> {
            self.published.lock().expect("lock").push(event);
            Ok(())
        }
    }

    fn seeded_cache_value() -> String {
        // Opaque to the coordinator; only key presence matters here.
        "{}".to_string()
    }

    #[tokio::test]
    async fn mutation_drives_cascading_invalidation() {
        let clock: Arc<dyn ClockPort> = Arc::new(SystemClock);
        let branch = BranchId::new();
        let structure = EntityRef::new(EntityKind::Structure, EntityId::new(), branch);
        let settlement = EntityRef::new(EntityKind::Settlement, EntityId::new(), branch);
        let defense_bonus = structure.field("defenseBonus");
        let total_defense = settlement.field("totalDefense");

        let graph = Arc::new(DependencyGraph::new());
        graph
            .record_dependencies(
                &total_defense,
                &[(
                    defense_bonus.clone(),
                    Some(loreforge_domain::HierarchyRel::ChildOf),
                )],
            )
            .expect("record");

        let keys = KeyBuilder::new("lf");
        let cache = Arc::new(MemoryCacheStore::new(clock.clone()));
        for field in [&defense_bonus, &total_defense] {
            cache
                .put(
                    &keys.field_key(field),
                    seeded_cache_value(),
                    Duration::from_secs(300),
                )
                .await
                .expect("put");
        }

        let bus = Arc::new(RecordingBus::default());
        let coordinator = Arc::new(InvalidationCoordinator::new(
            graph,
            Arc::new(InvalidationFence::new()),
            cache.clone(),
            bus.clone(),
            clock,
            EngineSettings::default(),
        ));

        let store = Arc::new(StreamOnlyStore::with_notices(vec![MutationNotice {
            entity: structure,
            changed_fields: vec!["defenseBonus".to_string()],
            occurred_at: Utc::now(),
        }]));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        MutationSubscriber::new(store, coordinator, shutdown_rx)
            .run()
            .await
            .expect("run");

        // Both the changed field's entry and the dependent aggregate's entry
        // were replaced by tombstones, and one event was published for the
        // cascade.
        for field in [&defense_bonus, &total_defense] {
            let raw = cache
                .get(&keys.field_key(field))
                .await
                .expect("get")
                .expect("tombstone present");
            assert_ne!(raw, seeded_cache_value());
            assert!(matches!(
                serde_json::from_str::<crate::service::CacheEntry>(&raw),
                Ok(crate::service::CacheEntry::Tombstone)
            ));
        }
        let published = bus.published.lock().expect("lock");
        assert_eq!(published.len(), 1);
        assert!(published[0].affected.contains(&total_defense));
    }

    #[tokio::test]
    async fn parent_field_change_is_treated_as_hierarchy_change() {
        let clock: Arc<dyn ClockPort> = Arc::new(SystemClock);
        let branch = BranchId::new();
        let structure = EntityRef::new(EntityKind::Structure, EntityId::new(), branch);

        let graph = Arc::new(DependencyGraph::new());
        let cache = Arc::new(MemoryCacheStore::new(clock.clone()));
        let bus = Arc::new(RecordingBus::default());
        let coordinator = Arc::new(InvalidationCoordinator::new(
            graph,
            Arc::new(InvalidationFence::new()),
            cache,
            bus.clone(),
            clock,
            EngineSettings::default(),
        ));

        let store = Arc::new(StreamOnlyStore::with_notices(vec![MutationNotice {
            entity: structure,
            changed_fields: vec!["parentId".to_string()],
            occurred_at: Utc::now(),
        }]));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        MutationSubscriber::new(store, coordinator, shutdown_rx)
            .run()
            .await
            .expect("run");

        let published = bus.published.lock().expect("lock");
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].cause,
            loreforge_domain::InvalidationCause::HierarchyChanged
        );
    }

    #[tokio::test]
    async fn shutdown_signal_stops_an_idle_subscriber() {
        let clock: Arc<dyn ClockPort> = Arc::new(SystemClock);
        let coordinator = Arc::new(InvalidationCoordinator::new(
            Arc::new(DependencyGraph::new()),
            Arc::new(InvalidationFence::new()),
            Arc::new(MemoryCacheStore::new(clock.clone())),
            Arc::new(RecordingBus::default()),
            clock,
            EngineSettings::default(),
        ));
        let store = Arc::new(StreamOnlyStore::endless());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(
            MutationSubscriber::new(store, coordinator, shutdown_rx).run(),
        );

        shutdown_tx.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("subscriber stopped")
            .expect("join")
            .expect("run");
    }
}
