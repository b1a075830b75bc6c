//! Infrastructure layer: port traits and the default in-process adapters.

pub mod memory_cache;
pub mod ports;

pub use memory_cache::MemoryCacheStore;
