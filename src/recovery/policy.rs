//! Mapping from failures and anomalies to actions
//!
//! Rules are plain configuration and evaluated in order; the first match
//! wins.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::RecoveryActionType;
use crate::anomaly::AnomalySignal;
use crate::config::RecoverySettings;
use crate::events::{FailureCategory, FailureEvent, Severity};

/// Failure event → action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryRule {
    pub category: FailureCategory,
    /// Restrict to one service (or health check) name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,
    pub action: RecoveryActionType,
}

impl RecoveryRule {
    pub fn new(category: FailureCategory, action: RecoveryActionType) -> Self {
        Self {
            category,
            service: None,
            min_severity: None,
            action,
        }
    }

    pub fn for_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn matches(&self, event: &FailureEvent) -> bool {
        event.category == self.category
            && self
                .service
                .as_ref()
                .map_or(true, |s| s == &event.service_name)
            && self.min_severity.map_or(true, |min| event.severity >= min)
    }
}

/// Anomaly signal → action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyRule {
    /// Metric name; `*` matches everything, `*.suffix` and `prefix.*` match
    /// by suffix and prefix
    pub metric: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,
    pub action: RecoveryActionType,
    /// Fixed target; defaults to the metric name up to its first `.`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl AnomalyRule {
    pub fn matches(&self, signal: &AnomalySignal) -> bool {
        metric_matches(&self.metric, &signal.metric_name)
            && self.min_severity.map_or(true, |min| signal.severity >= min)
    }

    pub fn target_for(&self, signal: &AnomalySignal) -> String {
        match self.target {
            Some(ref target) => target.clone(),
            None => signal
                .metric_name
                .split('.')
                .next()
                .unwrap_or(&signal.metric_name)
                .to_string(),
        }
    }
}

pub fn metric_matches(pattern: &str, metric: &str) -> bool {
    if pattern == "*" {
        true
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        metric.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        metric.starts_with(prefix)
    } else {
        pattern == metric
    }
}

pub fn default_rules() -> Vec<RecoveryRule> {
    use FailureCategory::*;
    use RecoveryActionType::*;
    vec![
        RecoveryRule::new(CircuitOpen, ReconnectDatabase).for_service("database"),
        RecoveryRule::new(CircuitOpen, RestartService).with_min_severity(Severity::High),
        RecoveryRule::new(RateLimited, ThrottleRequests),
        RecoveryRule::new(HealthDegraded, CleanupMemory).for_service("memory"),
        RecoveryRule::new(HealthDegraded, ThrottleRequests).for_service("cpu"),
        RecoveryRule::new(HealthDegraded, ReconnectDatabase).for_service("database"),
        RecoveryRule::new(DependencyUnavailable, RestartService).with_min_severity(Severity::High),
    ]
}

pub fn default_anomaly_rules() -> Vec<AnomalyRule> {
    vec![
        AnomalyRule {
            metric: "memory.value".to_string(),
            min_severity: Some(Severity::High),
            action: RecoveryActionType::CleanupMemory,
            target: None,
        },
        AnomalyRule {
            metric: "*.latency_ms".to_string(),
            min_severity: Some(Severity::High),
            action: RecoveryActionType::ThrottleRequests,
            target: None,
        },
    ]
}

/// Compiled recovery policy
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    rules: Vec<RecoveryRule>,
    anomaly_rules: Vec<AnomalyRule>,
    no_auto_recover: BTreeSet<FailureCategory>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from_settings(&RecoverySettings::default())
    }
}

impl RecoveryPolicy {
    pub fn from_settings(settings: &RecoverySettings) -> Self {
        let mut no_auto_recover: BTreeSet<FailureCategory> =
            settings.no_auto_recover.iter().copied().collect();
        // Built-in flags can be extended by configuration, never removed
        no_auto_recover.extend([FailureCategory::DataIntegrity, FailureCategory::AuthFailure]);

        Self {
            rules: settings.rules.clone(),
            anomaly_rules: settings.anomaly_rules.clone(),
            no_auto_recover,
        }
    }

    /// Categories that always need an operator
    pub fn requires_manual(&self, category: FailureCategory) -> bool {
        self.no_auto_recover.contains(&category)
    }

    pub fn no_auto_recover(&self) -> impl Iterator<Item = &FailureCategory> {
        self.no_auto_recover.iter()
    }

    /// Action for an event, if any. Flagged categories and failed recoveries
    /// never map to an action.
    pub fn action_for_event(&self, event: &FailureEvent) -> Option<RecoveryActionType> {
        if self.requires_manual(event.category) || event.category == FailureCategory::RecoveryFailed {
            return None;
        }
        self.rules.iter().find(|r| r.matches(event)).map(|r| r.action)
    }

    /// Action and target for an anomaly signal, if any
    pub fn action_for_signal(&self, signal: &AnomalySignal) -> Option<(RecoveryActionType, String)> {
        self.anomaly_rules
            .iter()
            .find(|r| r.matches(signal))
            .map(|r| (r.action, r.target_for(signal)))
    }
}
