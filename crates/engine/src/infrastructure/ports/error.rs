//! Error types for infrastructure ports.

/// Cache backend failure.
///
/// Never user-visible: the orchestrator treats every cache failure as a miss
/// and falls through to direct evaluation.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// State store failure.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("Not found")]
    NotFound,
    #[error("State store error: {0}")]
    Backend(String),
}

/// Event bus failure. Publishing is fire-and-forget; failures are logged,
/// never propagated.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus transport error: {0}")]
    Transport(String),
}
