// Port traits define the full contract - many methods are for future use
#![allow(dead_code)]

//! Testability ports for injecting time.
//!
//! The evaluator itself never reads the clock (it must be deterministic);
//! the clock is used for cache TTLs and event timestamps only.

use chrono::{DateTime, Utc};

// =============================================================================
// Testability Ports
// =============================================================================

#[cfg_attr(test, mockall::automock)]
pub trait ClockPort: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation for production use.
pub struct SystemClock;

impl ClockPort for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
