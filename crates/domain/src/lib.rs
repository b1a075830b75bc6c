//! LoreForge domain layer.
//!
//! Pure types for the computed-field engine: entity/field references,
//! the rule expression tree and its evaluator, state snapshots, and the
//! mutation/invalidation event vocabulary. No I/O lives here; everything is
//! deterministic and trivially testable.

pub mod error;
pub mod events;
pub mod expression;
pub mod ids;
pub mod refs;
pub mod state;

pub use error::EvalError;
pub use events::{InvalidationCause, InvalidationEvent, MutationNotice};
pub use expression::{ArithOp, CompareOp, EvalContext, Expr, Value};
pub use ids::{BranchId, EntityId, KingdomId, SettlementId, StructureId, WorldEventId};
pub use refs::{DependencyEdge, EntityKind, EntityRef, FieldRef, HierarchyRel};
pub use state::{EntitySummary, StateSnapshot};
