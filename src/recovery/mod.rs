//! Recovery orchestration
//!
//! Maps failure events and anomaly signals to remediation actions, enforces
//! a cooldown per (action, target) pair and records every decision.

pub mod handlers;
pub mod orchestrator;
pub mod policy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ResilienceError;

pub use handlers::{
    handler_fn, CacheRegistry, PurgeCachesHandler, Purgeable, RecoveryHandler, RequestThrottle,
    ResetBreakerHandler, ThrottleHandler, WebhookHandler,
};
pub use orchestrator::{ActionTotals, RecoveryOrchestrator};
pub use policy::{AnomalyRule, RecoveryPolicy, RecoveryRule};

/// Remediation kinds, each backed by a pluggable handler
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionType {
    RestartService,
    ClearCache,
    CleanupMemory,
    ReconnectDatabase,
    ThrottleRequests,
    ResetCircuitBreaker,
}

impl RecoveryActionType {
    pub const ALL: [RecoveryActionType; 6] = [
        RecoveryActionType::RestartService,
        RecoveryActionType::ClearCache,
        RecoveryActionType::CleanupMemory,
        RecoveryActionType::ReconnectDatabase,
        RecoveryActionType::ThrottleRequests,
        RecoveryActionType::ResetCircuitBreaker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryActionType::RestartService => "restart_service",
            RecoveryActionType::ClearCache => "clear_cache",
            RecoveryActionType::CleanupMemory => "cleanup_memory",
            RecoveryActionType::ReconnectDatabase => "reconnect_database",
            RecoveryActionType::ThrottleRequests => "throttle_requests",
            RecoveryActionType::ResetCircuitBreaker => "reset_circuit_breaker",
        }
    }
}

impl std::fmt::Display for RecoveryActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecoveryActionType {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecoveryActionType::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| ResilienceError::BadRequest(format!("Unknown recovery action '{}'", s)))
    }
}

/// What caused an action to be considered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    BreakerTrip,
    HealthCheck,
    Anomaly,
    Manual,
    /// A rule-selected action for a recorded failure event that is neither a
    /// breaker trip nor a health degradation (retry and application failures)
    FailureEvent,
}

impl TriggerSource {
    pub const ALL: [TriggerSource; 5] = [
        TriggerSource::BreakerTrip,
        TriggerSource::HealthCheck,
        TriggerSource::Anomaly,
        TriggerSource::Manual,
        TriggerSource::FailureEvent,
    ];
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::BreakerTrip => write!(f, "breaker_trip"),
            TriggerSource::HealthCheck => write!(f, "health_check"),
            TriggerSource::Anomaly => write!(f, "anomaly"),
            TriggerSource::Manual => write!(f, "manual"),
            TriggerSource::FailureEvent => write!(f, "failure_event"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure,
    /// Terminal: another action for the same pair ran within the cooldown
    SkippedCooldown,
}

impl std::fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionOutcome::Success => write!(f, "success"),
            ActionOutcome::Failure => write!(f, "failure"),
            ActionOutcome::SkippedCooldown => write!(f, "skipped_cooldown"),
        }
    }
}

/// Execution record of one remediation decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryAction {
    pub id: String,
    pub action_type: RecoveryActionType,
    pub target_service: String,
    pub triggered_by: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: ActionOutcome,
    /// Handler output or error text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Failure event that led to this action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_event_id: Option<String>,
}
