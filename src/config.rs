//! Resilience configuration
//!
//! Every field has a serde default so a partial TOML file is valid; an
//! absent file means all defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::breaker::BreakerConfig;
use crate::error::{ResilienceError, ResilienceResult};
use crate::events::{FailureCategory, Severity};
use crate::recovery::policy::{default_anomaly_rules, default_rules, AnomalyRule, RecoveryRule};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Where failure events and breaker state are persisted. `None` keeps
    /// everything in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Defaults for breakers without an override
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Per-service breaker overrides
    #[serde(default)]
    pub breakers: HashMap<String, BreakerConfig>,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub events: EventStoreSettings,

    #[serde(default)]
    pub anomaly: AnomalySettings,

    #[serde(default)]
    pub recovery: RecoverySettings,

    #[serde(default)]
    pub alerts: AlertSettings,
}

impl ResilienceConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> ResilienceResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ResilienceError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> ResilienceResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the core misbehave
    pub fn validate(&self) -> ResilienceResult<()> {
        let breakers = std::iter::once(("<default>", &self.breaker))
            .chain(self.breakers.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, b) in breakers {
            if b.failure_threshold == 0 {
                return Err(ResilienceError::Config(format!(
                    "breaker {}: failure_threshold must be at least 1",
                    name
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ResilienceError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ResilienceError::Config(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ResilienceError::Config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if self.anomaly.confirm_samples == 0 || self.anomaly.min_samples < 2 {
            return Err(ResilienceError::Config(
                "anomaly.confirm_samples must be >= 1 and anomaly.min_samples >= 2".to_string(),
            ));
        }
        if self.health.interval_ms == 0 || self.health.check_timeout_ms == 0 {
            return Err(ResilienceError::Config(
                "health.interval_ms and health.check_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.anomaly.detect_interval_ms == 0 {
            return Err(ResilienceError::Config(
                "anomaly.detect_interval_ms must be at least 1".to_string(),
            ));
        }
        if !(self.anomaly.z_threshold.is_finite() && self.anomaly.z_threshold > 0.0) {
            return Err(ResilienceError::Config(
                "anomaly.z_threshold must be a positive number".to_string(),
            ));
        }
        if !(self.anomaly.min_relative_change.is_finite() && self.anomaly.min_relative_change >= 0.0) {
            return Err(ResilienceError::Config(
                "anomaly.min_relative_change must not be negative".to_string(),
            ));
        }
        if self.anomaly.window_size < self.anomaly.min_samples + self.anomaly.confirm_samples {
            return Err(ResilienceError::Config(
                "anomaly.window_size must hold min_samples + confirm_samples".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default retry policy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts including the first try
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Per-attempt timeout; unset means attempts may run indefinitely
    #[serde(default)]
    pub attempt_timeout_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            attempt_timeout_ms: None,
        }
    }
}

/// An external dependency pinged over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyProbe {
    pub name: String,
    pub url: String,
}

/// Health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// How often each check runs (milliseconds)
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    /// A check slower than this is recorded as unhealthy with details "timeout"
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,

    #[serde(default = "default_memory_degraded")]
    pub memory_degraded_pct: f64,

    #[serde(default = "default_memory_unhealthy")]
    pub memory_unhealthy_pct: f64,

    #[serde(default = "default_cpu_degraded")]
    pub cpu_degraded_pct: f64,

    #[serde(default = "default_cpu_unhealthy")]
    pub cpu_unhealthy_pct: f64,

    /// Dependency responses slower than this are degraded (milliseconds)
    #[serde(default = "default_slow_response_ms")]
    pub slow_response_ms: u64,

    /// `host:port` of the database, probed with a TCP connect
    #[serde(default)]
    pub database_addr: Option<String>,

    #[serde(default)]
    pub dependencies: Vec<DependencyProbe>,
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_check_timeout_ms() -> u64 {
    5_000
}

fn default_memory_degraded() -> f64 {
    85.0
}

fn default_memory_unhealthy() -> f64 {
    95.0
}

fn default_cpu_degraded() -> f64 {
    80.0
}

fn default_cpu_unhealthy() -> f64 {
    95.0
}

fn default_slow_response_ms() -> u64 {
    1_000
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            check_timeout_ms: default_check_timeout_ms(),
            memory_degraded_pct: default_memory_degraded(),
            memory_unhealthy_pct: default_memory_unhealthy(),
            cpu_degraded_pct: default_cpu_degraded(),
            cpu_unhealthy_pct: default_cpu_unhealthy(),
            slow_response_ms: default_slow_response_ms(),
            database_addr: None,
            dependencies: Vec::new(),
        }
    }
}

/// Failure event store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStoreSettings {
    /// Pending persistence ops kept before the oldest is dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Buffer of the live event feed consumed by the orchestrator
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

fn default_broadcast_capacity() -> usize {
    256
}

impl Default for EventStoreSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            flush_interval_ms: default_flush_interval_ms(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

/// Anomaly monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalySettings {
    /// Samples kept per metric
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Samples older than this are evicted (seconds)
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// Baseline samples required before a metric is judged
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Latest samples that must all deviate for a signal
    #[serde(default = "default_confirm_samples")]
    pub confirm_samples: usize,

    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,

    /// Minimum deviation as a fraction of the baseline mean
    #[serde(default = "default_min_relative_change")]
    pub min_relative_change: f64,

    /// Signals below this severity are suppressed
    #[serde(default = "default_severity_floor")]
    pub severity_floor: Severity,

    /// How often the orchestrator runs detection (milliseconds)
    #[serde(default = "default_detect_interval_ms")]
    pub detect_interval_ms: u64,
}

fn default_window_size() -> usize {
    60
}

fn default_max_age_secs() -> u64 {
    600
}

fn default_min_samples() -> usize {
    10
}

fn default_confirm_samples() -> usize {
    3
}

fn default_z_threshold() -> f64 {
    3.0
}

fn default_min_relative_change() -> f64 {
    0.2
}

fn default_severity_floor() -> Severity {
    Severity::Medium
}

fn default_detect_interval_ms() -> u64 {
    15_000
}

impl Default for AnomalySettings {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            max_age_secs: default_max_age_secs(),
            min_samples: default_min_samples(),
            confirm_samples: default_confirm_samples(),
            z_threshold: default_z_threshold(),
            min_relative_change: default_min_relative_change(),
            severity_floor: default_severity_floor(),
            detect_interval_ms: default_detect_interval_ms(),
        }
    }
}

/// Recovery orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    /// Minimum gap between executions of one (action, target) pair (milliseconds)
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,

    /// Recovery action records kept in memory
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Failure category/severity to action mapping, first match wins
    #[serde(default = "default_rules")]
    pub rules: Vec<RecoveryRule>,

    /// Anomaly metric to action mapping, first match wins
    #[serde(default = "default_anomaly_rules")]
    pub anomaly_rules: Vec<AnomalyRule>,

    /// Extra categories that must never be auto-recovered. `data_integrity`
    /// and `auth_failure` are always included.
    #[serde(default)]
    pub no_auto_recover: Vec<FailureCategory>,

    /// Action type (snake_case) to webhook URL
    #[serde(default)]
    pub hooks: HashMap<String, String>,
}

fn default_cooldown_ms() -> u64 {
    300_000 // 5 min
}

fn default_action_timeout_ms() -> u64 {
    30_000
}

fn default_history_limit() -> usize {
    500
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            action_timeout_ms: default_action_timeout_ms(),
            history_limit: default_history_limit(),
            rules: default_rules(),
            anomaly_rules: default_anomaly_rules(),
            no_auto_recover: Vec::new(),
            hooks: HashMap::new(),
        }
    }
}

/// Alert delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSettings {
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_alert_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_alert_timeout_ms() -> u64 {
    5_000
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: default_alert_timeout_ms(),
        }
    }
}
