//! Health monitor
//!
//! Each registered check runs on its own timer. Reads of the overall status
//! only aggregate stored results and never trigger a probe.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{worst_status, CheckOutcome, HealthCheck, HealthCheckResult, HealthStatus, SystemHealth};
use crate::anomaly::AnomalyMonitor;
use crate::config::HealthSettings;
use crate::events::{FailureEvent, FailureEventStore, Severity};

/// Shortest period a check may run at. `tokio::time::interval` rejects zero.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone)]
struct Registered {
    name: String,
    check: Arc<dyn HealthCheck>,
    interval: Duration,
}

/// Overall status seen at the last evaluation, for edge detection
struct Transition {
    last: HealthStatus,
    open_event: Option<String>,
}

pub struct HealthMonitor {
    checks: RwLock<Vec<Registered>>,
    results: DashMap<String, HealthCheckResult>,
    check_timeout: Duration,
    default_interval: Duration,
    events: FailureEventStore,
    anomaly: Option<Arc<AnomalyMonitor>>,
    transition: Mutex<Transition>,
}

impl HealthMonitor {
    pub fn new(settings: &HealthSettings, events: FailureEventStore) -> Self {
        Self {
            checks: RwLock::new(Vec::new()),
            results: DashMap::new(),
            check_timeout: Duration::from_millis(settings.check_timeout_ms),
            default_interval: Duration::from_millis(settings.interval_ms).max(MIN_CHECK_INTERVAL),
            events,
            anomaly: None,
            transition: Mutex::new(Transition {
                last: HealthStatus::Healthy,
                open_event: None,
            }),
        }
    }

    /// Feed probe latency (and values) to the anomaly monitor
    pub fn with_anomaly_monitor(mut self, monitor: Arc<AnomalyMonitor>) -> Self {
        self.anomaly = Some(monitor);
        self
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Register (or replace) a named check. Checks registered after
    /// [`start`](Self::start) only run through [`run_all_once`](Self::run_all_once).
    /// A zero interval falls back to the monitor's default interval.
    pub fn register<C>(&self, name: impl Into<String>, check: C, interval: Duration)
    where
        C: HealthCheck + 'static,
    {
        let name = name.into();
        let interval = if interval.is_zero() {
            tracing::warn!(
                "Health check '{}' registered with a zero interval, using {:?}",
                name,
                self.default_interval
            );
            self.default_interval
        } else {
            interval
        };
        let entry = Registered {
            name: name.clone(),
            check: Arc::new(check),
            interval,
        };
        let mut checks = self.checks.write();
        match checks.iter_mut().find(|c| c.name == name) {
            Some(existing) => *existing = entry,
            None => checks.push(entry),
        }
        tracing::debug!("Registered health check '{}' every {:?}", name, interval);
    }

    pub fn check_names(&self) -> Vec<String> {
        self.checks.read().iter().map(|c| c.name.clone()).collect()
    }

    pub fn check_interval(&self, name: &str) -> Option<Duration> {
        self.checks
            .read()
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.interval)
    }

    /// Run every check concurrently, store the results and re-evaluate the
    /// overall status.
    pub async fn run_all_once(&self) -> BTreeMap<String, HealthCheckResult> {
        let checks: Vec<Registered> = self.checks.read().clone();
        let runs = checks.iter().map(|c| self.run_check(c));
        let results: BTreeMap<String, HealthCheckResult> = futures::future::join_all(runs)
            .await
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect();
        self.evaluate_transition();
        results
    }

    /// Worst stored status. Never probes.
    pub fn overall_status(&self) -> HealthStatus {
        let results: Vec<HealthCheckResult> = self.results.iter().map(|e| e.value().clone()).collect();
        worst_status(&results)
    }

    /// Latest results, sorted by check name
    pub fn results(&self) -> Vec<HealthCheckResult> {
        let mut results: Vec<HealthCheckResult> =
            self.results.iter().map(|e| e.value().clone()).collect();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }

    pub fn result(&self, name: &str) -> Option<HealthCheckResult> {
        self.results.get(name).map(|r| r.clone())
    }

    pub fn system_health(&self) -> SystemHealth {
        let checks = self.results();
        SystemHealth {
            overall: worst_status(&checks),
            checks,
        }
    }

    /// Spawn one periodic task per registered check
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let checks: Vec<Registered> = self.checks.read().clone();
        tracing::info!("Starting health monitor with {} checks", checks.len());

        checks
            .into_iter()
            .map(|registered| {
                let monitor = Arc::clone(self);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(registered.interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        monitor.run_check(&registered).await;
                        monitor.evaluate_transition();
                    }
                })
            })
            .collect()
    }

    async fn run_check(&self, registered: &Registered) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.check_timeout, registered.check.check()).await {
            Ok(outcome) => outcome,
            Err(_) => CheckOutcome::unhealthy("timeout"),
        };
        let elapsed = started.elapsed();

        let result = HealthCheckResult {
            name: registered.name.clone(),
            status: outcome.status,
            last_run_at: Utc::now(),
            latency_ms: elapsed.as_millis() as u64,
            details: outcome.details,
            value: outcome.value,
        };

        if let Some(previous) = self.results.insert(result.name.clone(), result.clone()) {
            if previous.status != result.status {
                tracing::info!(
                    "Health check '{}' changed {} -> {} ({})",
                    result.name,
                    previous.status,
                    result.status,
                    result.details
                );
            }
        }

        if let Some(ref monitor) = self.anomaly {
            monitor.ingest(
                &format!("{}.latency_ms", result.name),
                elapsed.as_secs_f64() * 1000.0,
            );
            if let Some(value) = result.value {
                monitor.ingest(&format!("{}.value", result.name), value);
            }
        }

        result
    }

    /// Emit one event when the overall status leaves healthy and resolve it
    /// when the status comes back. Moving between degraded and unhealthy
    /// does not emit again.
    ///
    /// The snapshot, the edge detection and the store writes all happen
    /// under the transition lock. The store never calls back into the
    /// monitor.
    fn evaluate_transition(&self) {
        let mut transition = self.transition.lock();
        let results = self.results();
        let overall = worst_status(&results);
        let previous = transition.last;
        transition.last = overall;

        if previous == HealthStatus::Healthy && overall != HealthStatus::Healthy {
            let worst = results.iter().find(|r| r.status == overall);
            let (check, details) = worst
                .map(|r| (r.name.as_str(), r.details.as_str()))
                .unwrap_or(("system", ""));
            let severity = if overall == HealthStatus::Unhealthy {
                Severity::High
            } else {
                Severity::Medium
            };
            let event = FailureEvent::health_degraded(check, severity, details);
            tracing::warn!("System health is now {}: {}", overall, event.message);
            transition.open_event = Some(self.events.record(event));
        } else if previous != HealthStatus::Healthy && overall == HealthStatus::Healthy {
            if let Some(id) = transition.open_event.take() {
                tracing::info!("System health recovered");
                if let Err(e) = self.events.mark_resolved(&id, "passive_recovery") {
                    tracing::warn!("Could not resolve health event {}: {}", id, e);
                }
            }
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("checks", &self.check_names())
            .field("overall", &self.overall_status())
            .finish()
    }
}
