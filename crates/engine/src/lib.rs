//! LoreForge computed-field engine.
//!
//! Evaluates declarative computed-field rules over campaign entities
//! (Kingdoms, Settlements, Structures, World Events), caches the results
//! under branch-qualified keys, and keeps the cache coherent by cascading
//! invalidation along a dependency graph when stored state mutates.
//!
//! The engine is deliberately oblivious to persistence and geometry: entity
//! state, hierarchy listings, branch lineage, and spatial queries all come
//! through the [`infrastructure::ports::StateStorePort`] trait, and the cache
//! backend behind [`infrastructure::ports::CacheStorePort`] is swappable.
//! [`app::Engine::start`] provides the default wiring.

pub mod app;
pub mod coordinator;
pub mod fence;
pub mod graph;
pub mod infrastructure;
pub mod resolver;
pub mod rules;
pub mod service;
pub mod settings;
pub mod stats;
pub mod subscriber;

pub use app::Engine;
pub use coordinator::{
    InvalidationCoordinator, InvalidationError, InvalidationOutcome, InvalidationPhase,
};
pub use fence::InvalidationFence;
pub use graph::{DependencyGraph, GraphError};
pub use infrastructure::MemoryCacheStore;
pub use resolver::{KeyBuilder, VersionResolver};
pub use rules::{AggregateOp, ChildAggregate, ComputedRule, RuleRegistry, TtlClass};
pub use service::{ComputedFieldService, FieldOutcome, UnavailableReason};
pub use settings::EngineSettings;
pub use stats::{CacheCounters, CacheStatistics};
pub use subscriber::MutationSubscriber;
