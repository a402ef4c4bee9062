//! Resilience core
//!
//! Builds every component from one [`ResilienceConfig`], runs their
//! background tasks and exposes the administrative operations used by the
//! dashboard API.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::alert::{Alert, Alerter};
use crate::anomaly::AnomalyMonitor;
use crate::breaker::persist::BreakerWriter;
use crate::breaker::{BreakerPersistence, BreakerSummary, CircuitBreakerRegistry, BREAKERS_FILE};
use crate::config::ResilienceConfig;
use crate::error::{ResilienceError, ResilienceResult};
use crate::events::{
    FailureEvent, FailureEventStore, FailureStats, JsonlEventSink, NullEventSink, Severity,
};
use crate::health::{CpuCheck, HealthMonitor, HttpCheck, MemoryCheck, SystemHealth, TcpCheck};
use crate::recovery::{
    CacheRegistry, PurgeCachesHandler, RecoveryAction, RecoveryActionType, RecoveryOrchestrator,
    RequestThrottle, ResetBreakerHandler, ThrottleHandler, WebhookHandler,
};
use crate::retry::RetryManager;

/// Default page size of the recent-failures query
pub const DEFAULT_FAILURE_LIMIT: usize = 50;

pub struct ResilienceCore {
    config: ResilienceConfig,
    events: FailureEventStore,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryManager,
    health: Arc<HealthMonitor>,
    anomaly: Arc<AnomalyMonitor>,
    orchestrator: Arc<RecoveryOrchestrator>,
    alerter: Arc<Alerter>,
    throttle: Arc<RequestThrottle>,
    caches: Arc<CacheRegistry>,
    breaker_writer: Mutex<Option<BreakerWriter>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    created_at: DateTime<Utc>,
}

impl ResilienceCore {
    /// Build the core. With a `data_dir`, failure events and breaker state
    /// from a previous run are loaded here.
    pub fn new(config: ResilienceConfig) -> ResilienceResult<Self> {
        config.validate()?;

        let (events, breaker_persistence) = match config.data_dir {
            Some(ref dir) => {
                std::fs::create_dir_all(dir)?;
                let sink = JsonlEventSink::in_dir(dir);
                let history = sink.load()?;
                tracing::info!(
                    "Loaded {} failure events from {}",
                    history.len(),
                    sink.path().display()
                );
                let events = FailureEventStore::with_history(Arc::new(sink), &config.events, history);

                let path = dir.join(BREAKERS_FILE);
                let known = BreakerPersistence::load(&path).unwrap_or_else(|e| {
                    tracing::warn!("Ignoring unreadable {}: {}", path.display(), e);
                    BTreeMap::new()
                });
                let (persistence, writer) = BreakerPersistence::channel(&path, known.clone());
                (events, Some((persistence, writer, known)))
            }
            None => (
                FailureEventStore::new(Arc::new(NullEventSink), &config.events),
                None,
            ),
        };

        let mut registry = CircuitBreakerRegistry::new(events.clone(), config.breaker.clone())
            .with_overrides(config.breakers.clone());
        let mut breaker_writer = None;
        if let Some((persistence, writer, known)) = breaker_persistence {
            registry = registry.with_persistence(persistence, known.into_values());
            breaker_writer = Some(writer);
        }
        let breakers = Arc::new(registry);

        let anomaly = Arc::new(AnomalyMonitor::new(config.anomaly.clone()));
        let retry = RetryManager::new(breakers.clone(), config.retry.clone())
            .with_anomaly_monitor(anomaly.clone());

        let health = HealthMonitor::new(&config.health, events.clone())
            .with_anomaly_monitor(anomaly.clone());
        register_builtin_checks(&health, &config)?;

        let alerter = Arc::new(Alerter::from_settings(&config.alerts)?);
        let orchestrator = RecoveryOrchestrator::new(&config.recovery, events.clone(), alerter.clone())
            .with_anomaly_monitor(
                anomaly.clone(),
                Duration::from_millis(config.anomaly.detect_interval_ms),
            );

        let throttle = Arc::new(RequestThrottle::new());
        let caches = Arc::new(CacheRegistry::new());
        orchestrator.register_handler(
            RecoveryActionType::ResetCircuitBreaker,
            ResetBreakerHandler::new(breakers.clone()),
        );
        orchestrator.register_handler(
            RecoveryActionType::ThrottleRequests,
            ThrottleHandler::new(
                throttle.clone(),
                Duration::from_millis(config.recovery.cooldown_ms),
            ),
        );
        orchestrator.register_handler(
            RecoveryActionType::ClearCache,
            PurgeCachesHandler::clear_cache(caches.clone()),
        );
        orchestrator.register_handler(
            RecoveryActionType::CleanupMemory,
            PurgeCachesHandler::cleanup_memory(caches.clone()),
        );

        // Configured hooks replace built-in handlers
        let hook_timeout = Duration::from_millis(config.recovery.action_timeout_ms);
        for (name, url) in &config.recovery.hooks {
            let action: RecoveryActionType = name.parse().map_err(|_| {
                ResilienceError::Config(format!("recovery.hooks: unknown action '{}'", name))
            })?;
            orchestrator.register_handler(action, WebhookHandler::new(action, url.clone(), hook_timeout)?);
            tracing::info!("Recovery action {} delegated to {}", action, url);
        }

        Ok(Self {
            config,
            events,
            breakers,
            retry,
            health: Arc::new(health),
            anomaly,
            orchestrator: Arc::new(orchestrator),
            alerter,
            throttle,
            caches,
            breaker_writer: Mutex::new(breaker_writer),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            created_at: Utc::now(),
        })
    }

    /// Spawn the background tasks: event flusher, breaker writer, health
    /// checks and the orchestrator loop. Calling it again does nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock();
        tasks.push(self.events.spawn_flusher());
        if let Some(writer) = self.breaker_writer.lock().take() {
            tasks.push(tokio::spawn(writer.run()));
        }
        tasks.extend(self.health.start());
        tasks.push(self.orchestrator.spawn(self.events.subscribe()));

        tracing::info!(
            "Resilience core started ({} background tasks, {} health checks)",
            tasks.len(),
            self.health.check_names().len()
        );
    }

    /// Stop background tasks and write out pending failure events
    pub async fn shutdown(&self) -> ResilienceResult<()> {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let flushed = self.events.flush().await?;
        tracing::info!("Resilience core stopped, flushed {} pending event ops", flushed);
        Ok(())
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn events(&self) -> &FailureEventStore {
        &self.events
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn retry(&self) -> &RetryManager {
        &self.retry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn anomaly(&self) -> &Arc<AnomalyMonitor> {
        &self.anomaly
    }

    pub fn orchestrator(&self) -> &Arc<RecoveryOrchestrator> {
        &self.orchestrator
    }

    pub fn alerter(&self) -> &Arc<Alerter> {
        &self.alerter
    }

    /// Throttle state set by the `throttle_requests` action
    pub fn throttle(&self) -> &Arc<RequestThrottle> {
        &self.throttle
    }

    /// Register caches here so `clear_cache` / `cleanup_memory` can purge them
    pub fn caches(&self) -> &Arc<CacheRegistry> {
        &self.caches
    }

    // ==================== Administrative API ====================

    pub fn system_health(&self) -> SystemHealth {
        self.health.system_health()
    }

    pub fn circuit_breakers(&self) -> BTreeMap<String, BreakerSummary> {
        self.breakers.summaries()
    }

    pub fn failure_stats(&self, time_range_hours: u64) -> FailureStats {
        let hours = time_range_hours.min(u64::MAX / 3_600_000);
        self.events.stats(Duration::from_secs(hours * 3600))
    }

    pub fn recent_failures(&self, limit: usize, severity: Option<Severity>) -> Vec<FailureEvent> {
        self.events.recent(limit, severity)
    }

    pub fn reset_circuit_breaker(&self, name: &str) -> ResilienceResult<()> {
        self.breakers.reset(name)
    }

    pub async fn trigger_recovery_action(
        &self,
        service_name: &str,
        action_type: RecoveryActionType,
    ) -> ResilienceResult<RecoveryAction> {
        self.orchestrator.trigger_manual(action_type, service_name).await
    }

    pub async fn send_test_alert(
        &self,
        alert_type: &str,
        payload: serde_json::Value,
    ) -> ResilienceResult<Alert> {
        self.alerter.send_test(alert_type, payload).await
    }

    pub fn recent_actions(&self, limit: usize) -> Vec<RecoveryAction> {
        self.orchestrator.recent_actions(limit)
    }

    /// Mark an event resolved by hand
    pub fn resolve_failure(&self, id: &str, method: &str) -> ResilienceResult<FailureEvent> {
        self.events.mark_resolved(id, method)
    }
}

fn register_builtin_checks(health: &HealthMonitor, config: &ResilienceConfig) -> ResilienceResult<()> {
    let settings = &config.health;
    let interval = Duration::from_millis(settings.interval_ms);
    let slow = Duration::from_millis(settings.slow_response_ms);

    health.register(
        "memory",
        MemoryCheck::new(settings.memory_degraded_pct, settings.memory_unhealthy_pct),
        interval,
    );
    health.register(
        "cpu",
        CpuCheck::new(settings.cpu_degraded_pct, settings.cpu_unhealthy_pct),
        interval,
    );
    if let Some(ref addr) = settings.database_addr {
        health.register("database", TcpCheck::new(addr.clone(), slow), interval);
    }
    for dependency in &settings.dependencies {
        let check = HttpCheck::new(
            dependency.url.clone(),
            Duration::from_millis(settings.check_timeout_ms),
            slow,
        )?;
        health.register(dependency.name.clone(), check, interval);
    }
    Ok(())
}

impl std::fmt::Debug for ResilienceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceCore")
            .field("events", &self.events)
            .field("breakers", &self.breakers.len())
            .field("health", &self.health)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::config::DependencyProbe;
    use crate::events::FailureCategory;
    use crate::recovery::ActionOutcome;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_checks_registered() {
        let mut config = ResilienceConfig::default();
        config.health.database_addr = Some("127.0.0.1:5432".into());
        config.health.dependencies = vec![DependencyProbe {
            name: "billing".into(),
            url: "http://127.0.0.1:9/health".into(),
        }];
        let core = ResilienceCore::new(config).unwrap();

        let mut names = core.health().check_names();
        names.sort();
        assert_eq!(names, vec!["billing", "cpu", "database", "memory"]);
    }

    #[test]
    fn test_unknown_hook_is_a_config_error() {
        let mut config = ResilienceConfig::default();
        config
            .recovery
            .hooks
            .insert("reboot".into(), "http://localhost/hook".into());
        assert!(matches!(
            ResilienceCore::new(config),
            Err(ResilienceError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_admin_operations() {
        let core = ResilienceCore::new(ResilienceConfig::default()).unwrap();

        let db = core.breakers().get_or_default("db");
        for _ in 0..5 {
            db.record_failure("refused");
        }
        assert_eq!(core.circuit_breakers()["db"].state, CircuitState::Open);

        let stats = core.failure_stats(24);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.unresolved, 1);

        core.reset_circuit_breaker("db").unwrap();
        core.reset_circuit_breaker("db").unwrap();
        assert_eq!(core.circuit_breakers()["db"].state, CircuitState::Closed);
        assert_eq!(core.failure_stats(24).resolution_rate, 1.0);

        let action = core
            .trigger_recovery_action("db", RecoveryActionType::ResetCircuitBreaker)
            .await
            .unwrap();
        assert_eq!(action.outcome, ActionOutcome::Success);
        let again = core
            .trigger_recovery_action("db", RecoveryActionType::ResetCircuitBreaker)
            .await
            .unwrap();
        assert_eq!(again.outcome, ActionOutcome::SkippedCooldown);
        assert_eq!(core.recent_actions(10).len(), 2);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let config = ResilienceConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        {
            let core = ResilienceCore::new(config.clone()).unwrap();
            core.start();
            let db = core.breakers().get_or_default("db");
            for _ in 0..5 {
                db.record_failure("refused");
            }
            // Let the breaker writer catch up before stopping
            for _ in 0..100 {
                if dir.path().join(BREAKERS_FILE).exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            core.shutdown().await.unwrap();
        }

        let core = ResilienceCore::new(config).unwrap();
        let trips = core
            .recent_failures(10, None)
            .into_iter()
            .filter(|e| e.category == FailureCategory::CircuitOpen)
            .count();
        assert_eq!(trips, 1);
        let db = core.breakers().get("db").unwrap();
        assert_eq!(db.state(), CircuitState::Open);
        assert!(!db.allow());
    }
}
