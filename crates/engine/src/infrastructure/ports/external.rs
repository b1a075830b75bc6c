// Port traits define the full contract - many methods are for future use
#![allow(dead_code)]

//! Event bus port for publishing invalidation events.

use async_trait::async_trait;
use loreforge_domain::InvalidationEvent;

use super::error::EventBusError;

/// Port for publishing invalidation events to interested subsystems
/// (real-time UI push, audit, downstream caches).
///
/// Delivery is at-least-once from the subscriber's point of view; publishing
/// is best-effort from ours. Failures are logged and never break the
/// invalidation flow.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventBusPort: Send + Sync {
    async fn publish(&self, event: InvalidationEvent) -> Result<(), EventBusError>;
}
