//! Failure events
//!
//! Durable, queryable log of failure occurrences. Every component that
//! detects a failure (breaker trips, health degradation, failed recovery
//! actions) appends here; records are only ever mutated to mark them resolved.

pub mod sink;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use sink::{
    EventSink, JsonlEventSink, MemoryEventSink, NullEventSink, PersistOp, FAILURE_EVENTS_FILE,
};
pub use store::FailureEventStore;

/// Failure taxonomy. Drives both retryability and recovery mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    TransientNetwork,
    Timeout,
    RateLimited,
    DependencyUnavailable,
    /// Breaker-originated; never itself retried
    CircuitOpen,
    HealthDegraded,
    DataIntegrity,
    AuthFailure,
    /// A recovery action's own execution failed
    RecoveryFailed,
}

impl FailureCategory {
    /// Categories the retry manager may retry locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureCategory::TransientNetwork
                | FailureCategory::Timeout
                | FailureCategory::RateLimited
                | FailureCategory::DependencyUnavailable
        )
    }

    /// Categories flagged `no_auto_recover`. These always surface as
    /// unresolved critical events and never get an automated action.
    pub fn requires_manual_recovery(&self) -> bool {
        matches!(
            self,
            FailureCategory::DataIntegrity | FailureCategory::AuthFailure
        )
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCategory::TransientNetwork => write!(f, "transient_network"),
            FailureCategory::Timeout => write!(f, "timeout"),
            FailureCategory::RateLimited => write!(f, "rate_limited"),
            FailureCategory::DependencyUnavailable => write!(f, "dependency_unavailable"),
            FailureCategory::CircuitOpen => write!(f, "circuit_open"),
            FailureCategory::HealthDegraded => write!(f, "health_degraded"),
            FailureCategory::DataIntegrity => write!(f, "data_integrity"),
            FailureCategory::AuthFailure => write!(f, "auth_failure"),
            FailureCategory::RecoveryFailed => write!(f, "recovery_failed"),
        }
    }
}

/// Lets caller error types report which failure category they belong to.
pub trait Categorized {
    fn category(&self) -> FailureCategory;
}

/// Severity level of a failure
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = crate::error::ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(crate::error::ResilienceError::BadRequest(format!(
                "Unknown severity '{}'",
                other
            ))),
        }
    }
}

/// A failure event record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureEvent {
    /// Unique identifier
    pub id: String,

    /// Service (or probe) the failure belongs to
    pub service_name: String,

    pub category: FailureCategory,

    pub severity: Severity,

    /// Description of what happened
    pub message: String,

    /// When the failure occurred
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub resolved: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_method: Option<String>,
}

impl FailureEvent {
    /// Create a new failure event.
    ///
    /// Categories that require manual recovery are always recorded as critical.
    pub fn new(
        service_name: impl Into<String>,
        category: FailureCategory,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        let severity = if category.requires_manual_recovery() {
            Severity::Critical
        } else {
            severity
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service_name: service_name.into(),
            category,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolution_method: None,
        }
    }

    /// Override the occurrence time
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Create a breaker trip event
    pub fn circuit_open(service: &str, failures: u32, severity: Severity, reason: &str) -> Self {
        Self::new(
            service,
            FailureCategory::CircuitOpen,
            severity,
            format!(
                "Circuit breaker opened after {} consecutive failures: {}",
                failures, reason
            ),
        )
    }

    /// Create a health degradation event
    pub fn health_degraded(check: &str, severity: Severity, details: &str) -> Self {
        Self::new(
            check,
            FailureCategory::HealthDegraded,
            severity,
            format!("System health degraded ({}): {}", check, details),
        )
    }

    /// Create a failed recovery event
    pub fn recovery_failed(action: &str, target: &str, error: &str) -> Self {
        Self::new(
            target,
            FailureCategory::RecoveryFailed,
            Severity::High,
            format!("Recovery action '{}' failed: {}", action, error),
        )
    }

    pub(crate) fn resolve(&mut self, method: &str, at: DateTime<Utc>) {
        self.resolved = true;
        self.resolved_at = Some(at);
        self.resolution_method = Some(method.to_string());
    }
}

/// Query for filtering failure events
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub severity: Option<Severity>,
    pub service_name: Option<String>,
    pub category: Option<FailureCategory>,
    /// Only events at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// `Some(true)` keeps resolved events only, `Some(false)` unresolved only
    pub resolved: Option<bool>,
}

impl EventFilter {
    pub fn matches(&self, event: &FailureEvent) -> bool {
        if let Some(severity) = self.severity {
            if event.severity != severity {
                return false;
            }
        }
        if let Some(ref service) = self.service_name {
            if &event.service_name != service {
                return false;
            }
        }
        if let Some(category) = self.category {
            if event.category != category {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(resolved) = self.resolved {
            if event.resolved != resolved {
                return false;
            }
        }
        true
    }
}

/// Aggregate statistics over a time window
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FailureStats {
    pub window_ms: u64,
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    /// `resolved / total`, defined as 0 for an empty window
    pub resolution_rate: f64,
}

impl FailureStats {
    pub fn from_events<'a>(window_ms: u64, events: impl IntoIterator<Item = &'a FailureEvent>) -> Self {
        let mut stats = FailureStats {
            window_ms,
            ..Default::default()
        };
        for event in events {
            stats.total += 1;
            if event.resolved {
                stats.resolved += 1;
            }
            *stats.by_severity.entry(event.severity).or_insert(0) += 1;
        }
        stats.unresolved = stats.total - stats.resolved;
        stats.resolution_rate = if stats.total == 0 {
            0.0
        } else {
            stats.resolved as f64 / stats.total as f64
        };
        stats
    }
}
