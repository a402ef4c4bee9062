//! Health monitoring
//!
//! Named probes run on their own schedules and overwrite their latest
//! result; the system-wide status is the worst of those results.

pub mod monitor;
pub mod probes;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

pub use monitor::HealthMonitor;
pub use probes::{CpuCheck, HttpCheck, MemoryCheck, TcpCheck};

/// Health status, ordered from best to worst
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// What a probe reports for one run
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub status: HealthStatus,
    pub details: String,
    /// Optional measured value (memory %, CPU %, ...)
    pub value: Option<f64>,
}

impl CheckOutcome {
    pub fn new(status: HealthStatus, details: impl Into<String>) -> Self {
        Self {
            status,
            details: details.into(),
            value: None,
        }
    }

    pub fn healthy(details: impl Into<String>) -> Self {
        Self::new(HealthStatus::Healthy, details)
    }

    pub fn degraded(details: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded, details)
    }

    pub fn unhealthy(details: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, details)
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }
}

/// Latest stored outcome of one named probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub last_run_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// Response of the system health query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemHealth {
    pub overall: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
}

/// A health probe
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> CheckOutcome;
}

/// Probe backed by an async closure
pub struct FnCheck<F> {
    f: F,
}

/// Adapt an async closure into a [`HealthCheck`]
pub fn check_fn<F, Fut>(f: F) -> FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = CheckOutcome> + Send,
{
    FnCheck { f }
}

#[async_trait]
impl<F, Fut> HealthCheck for FnCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = CheckOutcome> + Send,
{
    async fn check(&self) -> CheckOutcome {
        (self.f)().await
    }
}

/// Pessimistic aggregation: the worst status wins, no results means healthy
pub fn worst_status<'a>(results: impl IntoIterator<Item = &'a HealthCheckResult>) -> HealthStatus {
    results
        .into_iter()
        .map(|r| r.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}
