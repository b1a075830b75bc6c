//! Engine settings: TTL policy and coordinator retry tunables.
//!
//! TTLs are the correctness backstop, not the primary invalidation path:
//! they bound staleness when an invalidation event is somehow missed
//! (coordinator bug, process crash). Defaults match the operational policy
//! table; hosts override per deployment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rules::TtlClass;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Domain prefix for every cache key. Part of the stable key format.
    pub key_prefix: String,

    /// TTL for computed-field results.
    pub computed_field_ttl_secs: u64,
    /// TTL for entity-list/hierarchy query results.
    pub list_ttl_secs: u64,
    /// TTL for spatial query results.
    pub spatial_ttl_secs: u64,
    /// TTL for low-volatility derived expressions.
    pub low_volatility_ttl_secs: u64,
    /// TTL for the tombstones invalidation leaves behind. They only need to
    /// outlive the window between a branch diverging and its first read.
    pub tombstone_ttl_secs: u64,

    /// Attempts against an unavailable dependency graph before an
    /// invalidation is reported failed.
    pub graph_retry_attempts: u32,
    /// Base delay for exponential backoff between graph retries.
    pub graph_retry_base_delay_ms: u64,
    /// Extra rounds for cache deletions that failed during invalidation.
    pub delete_retry_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            key_prefix: "lf".to_string(),
            computed_field_ttl_secs: 300,
            list_ttl_secs: 600,
            spatial_ttl_secs: 300,
            low_volatility_ttl_secs: 3600,
            tombstone_ttl_secs: 60,
            graph_retry_attempts: 3,
            graph_retry_base_delay_ms: 50,
            delete_retry_attempts: 2,
        }
    }
}

impl EngineSettings {
    pub fn ttl_for(&self, class: TtlClass) -> Duration {
        let secs = match class {
            TtlClass::Computed => self.computed_field_ttl_secs,
            TtlClass::LowVolatility => self.low_volatility_ttl_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn list_ttl(&self) -> Duration {
        Duration::from_secs(self.list_ttl_secs)
    }

    pub fn spatial_ttl(&self) -> Duration {
        Duration::from_secs(self.spatial_ttl_secs)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_ttl_secs)
    }

    pub fn graph_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.graph_retry_base_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_ttl_policy_table() {
        let settings = EngineSettings::default();
        assert_eq!(settings.ttl_for(TtlClass::Computed), Duration::from_secs(300));
        assert_eq!(settings.list_ttl(), Duration::from_secs(600));
        assert_eq!(settings.spatial_ttl(), Duration::from_secs(300));
        assert_eq!(
            settings.ttl_for(TtlClass::LowVolatility),
            Duration::from_secs(3600)
        );
        assert_eq!(settings.tombstone_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"keyPrefix": "campaign"}"#).expect("parse");
        assert_eq!(settings.key_prefix, "campaign");
        assert_eq!(settings.computed_field_ttl_secs, 300);
        assert_eq!(settings.graph_retry_attempts, 3);
    }
}
