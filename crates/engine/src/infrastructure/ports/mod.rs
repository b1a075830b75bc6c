//! Port traits for infrastructure boundaries.
//!
//! These are the ONLY abstractions in the engine. Everything else is concrete
//! types. Ports exist for:
//! - The cache backend (could swap in-process -> Redis/memcached)
//! - The state store (relational/spatial database, owned elsewhere)
//! - The event bus (in-process, SQLite, Redis, ...)
//! - Clock (for testing TTL behavior)

mod cache;
mod error;
mod external;
mod state;
mod testing;

pub use cache::CacheStorePort;
pub use error::{CacheError, EventBusError, StateStoreError};
pub use external::EventBusPort;
pub use state::{MutationStream, StateStorePort};
pub use testing::{ClockPort, SystemClock};

#[cfg(test)]
pub use cache::MockCacheStorePort;
#[cfg(test)]
pub use external::MockEventBusPort;
#[cfg(test)]
pub use state::MockStateStorePort;
#[cfg(test)]
pub use testing::MockClockPort;
