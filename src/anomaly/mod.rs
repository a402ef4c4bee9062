//! Anomaly monitor
//!
//! Keeps a bounded trailing window per metric and flags sustained deviation
//! from the window's own baseline. A single outlying sample never produces
//! a signal: the latest `confirm_samples` values must all deviate in the
//! same direction.
//!
//! `detect()` holds no cooldown state; the orchestrator owns that.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::AnomalySettings;
use crate::events::Severity;

/// One observation of a metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub metric_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(metric_name: impl Into<String>, value: f64) -> Self {
        Self {
            metric_name: metric_name.into(),
            value,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Rising,
    Falling,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Rising => write!(f, "rising"),
            Direction::Falling => write!(f, "falling"),
        }
    }
}

/// Emerging degradation of one metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalySignal {
    pub metric_name: String,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    /// Latest observed value
    pub value: f64,
    pub baseline_mean: f64,
    /// Weakest z-score among the confirming samples
    pub z_score: f64,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    at: Instant,
}

pub struct AnomalyMonitor {
    windows: DashMap<String, VecDeque<Sample>>,
    settings: AnomalySettings,
}

impl AnomalyMonitor {
    pub fn new(settings: AnomalySettings) -> Self {
        Self {
            windows: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &AnomalySettings {
        &self.settings
    }

    fn max_age(&self) -> Duration {
        Duration::from_secs(self.settings.max_age_secs)
    }

    /// Record a value for `metric_name`. Non-finite values are ignored.
    pub fn ingest(&self, metric_name: &str, value: f64) {
        if !value.is_finite() {
            tracing::debug!("Ignoring non-finite sample for '{}'", metric_name);
            return;
        }
        let now = Instant::now();
        let max_age = self.max_age();
        let capacity = self.settings.window_size.max(1);

        let mut window = self.windows.entry(metric_name.to_string()).or_default();
        window.push_back(Sample { value, at: now });
        while window.len() > capacity {
            window.pop_front();
        }
        evict_expired(&mut window, now, max_age);
    }

    pub fn ingest_sample(&self, sample: &MetricSample) {
        self.ingest(&sample.metric_name, sample.value);
    }

    /// Metrics currently tracked, sorted
    pub fn metrics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn window_len(&self, metric_name: &str) -> usize {
        self.windows.get(metric_name).map(|w| w.len()).unwrap_or(0)
    }

    pub fn latest(&self, metric_name: &str) -> Option<f64> {
        self.windows
            .get(metric_name)
            .and_then(|w| w.back().map(|s| s.value))
    }

    /// Drop a metric's history, e.g. after a recovery action changed the baseline
    pub fn reset(&self, metric_name: &str) {
        self.windows.remove(metric_name);
    }

    /// Evaluate every metric window
    pub fn detect(&self) -> Vec<AnomalySignal> {
        let now = Instant::now();
        let max_age = self.max_age();
        let mut signals = Vec::new();

        for mut entry in self.windows.iter_mut() {
            evict_expired(entry.value_mut(), now, max_age);
            let values: Vec<f64> = entry.value().iter().map(|s| s.value).collect();
            if let Some(signal) = self.evaluate(entry.key(), &values) {
                signals.push(signal);
            }
        }

        signals.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.metric_name.cmp(&b.metric_name))
        });
        signals
    }

    fn evaluate(&self, metric_name: &str, values: &[f64]) -> Option<AnomalySignal> {
        let confirm = self.settings.confirm_samples.max(1);
        if values.len() < self.settings.min_samples + confirm {
            return None;
        }

        let (baseline, recent) = values.split_at(values.len() - confirm);
        let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
        let variance =
            baseline.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / baseline.len() as f64;
        // A perfectly flat baseline still needs a finite scale
        let stddev = variance
            .sqrt()
            .max(mean.abs() * 0.01)
            .max(f64::EPSILON);

        let min_change = self.settings.min_relative_change * mean.abs();
        let mut direction = None;
        let mut weakest = f64::INFINITY;

        for value in recent {
            let deviation = value - mean;
            let z = deviation / stddev;
            if z.abs() < self.settings.z_threshold || deviation.abs() < min_change {
                return None;
            }
            let dir = if deviation > 0.0 {
                Direction::Rising
            } else {
                Direction::Falling
            };
            match direction {
                None => direction = Some(dir),
                Some(d) if d != dir => return None,
                Some(_) => {}
            }
            weakest = weakest.min(z.abs());
        }

        let direction = direction?;
        let severity = severity_for(weakest / self.settings.z_threshold.max(f64::EPSILON));
        if severity < self.settings.severity_floor {
            tracing::debug!(
                "Suppressed {} anomaly on '{}' below severity floor",
                severity,
                metric_name
            );
            return None;
        }

        let value = *recent.last()?;
        Some(AnomalySignal {
            metric_name: metric_name.to_string(),
            severity,
            detected_at: Utc::now(),
            value,
            baseline_mean: mean,
            z_score: if direction == Direction::Rising {
                weakest
            } else {
                -weakest
            },
            direction,
        })
    }
}

fn evict_expired(window: &mut VecDeque<Sample>, now: Instant, max_age: Duration) {
    while let Some(front) = window.front() {
        if now.duration_since(front.at) > max_age {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn severity_for(ratio: f64) -> Severity {
    if ratio >= 3.0 {
        Severity::Critical
    } else if ratio >= 2.0 {
        Severity::High
    } else if ratio >= 1.5 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

impl std::fmt::Debug for AnomalyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyMonitor")
            .field("metrics", &self.windows.len())
            .field("settings", &self.settings)
            .finish()
    }
}
