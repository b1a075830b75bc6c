//! Engine assembly.
//!
//! Wires the dependency graph, read service, invalidation coordinator, and
//! mutation subscriber together and owns their shared shutdown signal. Hosts
//! that need finer control can assemble the parts themselves; this is the
//! default wiring.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

use crate::coordinator::InvalidationCoordinator;
use crate::fence::InvalidationFence;
use crate::graph::DependencyGraph;
use crate::infrastructure::ports::{CacheStorePort, ClockPort, EventBusPort, StateStorePort};
use crate::rules::RuleRegistry;
use crate::service::ComputedFieldService;
use crate::settings::EngineSettings;
use crate::subscriber::MutationSubscriber;

pub struct Engine {
    service: ComputedFieldService,
    coordinator: Arc<InvalidationCoordinator>,
    shutdown: watch::Sender<bool>,
    subscriber: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Engine {
    /// Assemble the engine and start consuming the store's mutation stream.
    pub fn start(
        cache: Arc<dyn CacheStorePort>,
        state: Arc<dyn StateStorePort>,
        bus: Arc<dyn EventBusPort>,
        clock: Arc<dyn ClockPort>,
        rules: RuleRegistry,
        settings: EngineSettings,
    ) -> Self {
        let graph = Arc::new(DependencyGraph::new());
        let fence = Arc::new(InvalidationFence::new());
        let service = ComputedFieldService::new(
            graph.clone(),
            fence.clone(),
            cache.clone(),
            state.clone(),
            clock.clone(),
            rules,
            settings.clone(),
        );
        let coordinator = Arc::new(InvalidationCoordinator::new(
            graph, fence, cache, bus, clock, settings,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let subscriber = tokio::spawn(
            MutationSubscriber::new(state, coordinator.clone(), shutdown_rx).run(),
        );

        Self {
            service,
            coordinator,
            shutdown,
            subscriber,
        }
    }

    pub fn service(&self) -> &ComputedFieldService {
        &self.service
    }

    pub fn coordinator(&self) -> &Arc<InvalidationCoordinator> {
        &self.coordinator
    }

    /// Signal shutdown and wait for the subscriber to drain.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        if self.shutdown.send(true).is_err() {
            warn!("mutation subscriber already stopped");
        }
        self.subscriber.await?
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use loreforge_domain::{
        ArithOp, BranchId, EntityId, EntityKind, EntityRef, EntitySummary, Expr,
        InvalidationEvent, StateSnapshot, Value,
    };

    use super::*;
    use crate::infrastructure::ports::{
        EventBusError, MutationStream, StateStoreError, SystemClock,
    };
    use crate::infrastructure::MemoryCacheStore;
    use crate::rules::ComputedRule;
    use crate::service::FieldOutcome;

    struct SingleEntityStore {
        entity: EntityRef,
        snapshot: StateSnapshot,
    }

    #[async_trait]
    impl StateStorePort for SingleEntityStore {
        async fn fetch_state(
            &self,
            entity: &EntityRef,
            _as_of: Option<DateTime<Utc>>,
        ) -> Result<Option<StateSnapshot>, StateStoreError> {
            Ok((*entity == self.entity).then(|| self.snapshot.clone()))
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
            Box::pin(futures_util::stream::pending())
        }
    }

    struct NoopBus;

    #[async_trait]
    impl EventBusPort for NoopBus {
        async fn publish(&self, _event: InvalidationEvent) -> Result<(), EventBusError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn engine_serves_reads_and_shuts_down_cleanly() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("loreforge_engine=debug")
            .try_init();

        let branch = BranchId::new();
        let settlement = EntityRef::new(EntityKind::Settlement, EntityId::new(), branch);
        let snapshot = StateSnapshot::latest(settlement)
            .with_field("population", Value::Int(250));

        let clock: Arc<dyn ClockPort> = Arc::new(SystemClock);
        let engine = Engine::start(
            Arc::new(MemoryCacheStore::new(clock.clone())),
            Arc::new(SingleEntityStore {
                entity: settlement,
                snapshot,
            }),
            Arc::new(NoopBus),
            clock,
            RuleRegistry::new().register(
                EntityKind::Settlement,
                ComputedRule::new(
                    "doubled",
                    Expr::arith(ArithOp::Mul, Expr::field("population"), Expr::int(2)),
                ),
            ),
            EngineSettings::default(),
        );

        let outcome = engine
            .service()
            .get_computed_field(settlement, "doubled")
            .await;
        assert_eq!(outcome, FieldOutcome::Available(Value::Int(500)));

        tokio::time::timeout(Duration::from_secs(1), engine.shutdown())
            .await
            .expect("shutdown completed")
            .expect("clean shutdown");
    }
}
