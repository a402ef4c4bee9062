//! Circuit breakers
//!
//! One state machine per protected dependency, created lazily on first
//! reference. Open → HalfOpen is derived from timestamps on each `allow()`
//! call; there is no background timer.

#[allow(clippy::module_inception)]
pub mod breaker;
pub mod persist;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::Severity;

pub use breaker::CircuitBreaker;
pub use persist::{BreakerPersistence, BREAKERS_FILE};
pub use registry::CircuitBreakerRegistry;

/// Shared handle to a registered breaker
pub type BreakerHandle = std::sync::Arc<CircuitBreaker>;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Allowing requests
    #[default]
    Closed,
    /// Blocking requests
    Open,
    /// Allowing a limited number of probes
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Per-dependency breaker settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures (while closed) before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before probing (milliseconds)
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,

    /// Concurrent probes allowed while half-open
    #[serde(default = "default_half_open_probe_limit")]
    pub half_open_probe_limit: u32,

    /// Severity of the failure event emitted when this breaker trips
    #[serde(default)]
    pub criticality: Severity,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration_ms() -> u64 {
    30_000
}

fn default_half_open_probe_limit() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_ms: default_open_duration_ms(),
            half_open_probe_limit: default_half_open_probe_limit(),
            criticality: Severity::Medium,
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, open_duration_ms: u64) -> Self {
        Self {
            failure_threshold,
            open_duration_ms,
            ..Default::default()
        }
    }

    pub fn with_probe_limit(mut self, limit: u32) -> Self {
        self.half_open_probe_limit = limit;
        self
    }

    pub fn with_criticality(mut self, criticality: Severity) -> Self {
        self.criticality = criticality;
        self
    }
}

/// Point-in-time view of a breaker, also the persisted form
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_in_flight: u32,
    pub last_state_change_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_event_id: Option<String>,
}

/// Summary returned by the admin API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSummary {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

impl From<&BreakerSnapshot> for BreakerSummary {
    fn from(s: &BreakerSnapshot) -> Self {
        Self {
            state: s.state,
            failure_count: s.failure_count,
            success_count: s.success_count,
        }
    }
}
