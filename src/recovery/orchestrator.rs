//! Recovery orchestrator
//!
//! Failure events, anomaly signals and manual requests all end up in
//! [`RecoveryOrchestrator::maybe_execute`]. The cooldown check and the
//! cooldown timestamp update happen under one lock, so two concurrent
//! triggers for the same pair cannot both run.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::handlers::RecoveryHandler;
use super::policy::RecoveryPolicy;
use super::{ActionOutcome, RecoveryAction, RecoveryActionType, TriggerSource};
use crate::alert::{Alert, Alerter, MANUAL_INTERVENTION};
use crate::anomaly::{AnomalyMonitor, AnomalySignal};
use crate::config::RecoverySettings;
use crate::error::{ResilienceError, ResilienceResult};
use crate::events::{FailureCategory, FailureEvent, FailureEventStore, Severity};

type CooldownKey = (RecoveryActionType, String);

const MIN_DETECT_INTERVAL: Duration = Duration::from_millis(1);

/// Lifetime counters per outcome
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionTotals {
    pub success: u64,
    pub failure: u64,
    pub skipped_cooldown: u64,
}

#[derive(Default)]
struct OutcomeCounters {
    success: AtomicU64,
    failure: AtomicU64,
    skipped: AtomicU64,
}

pub struct RecoveryOrchestrator {
    policy: RecoveryPolicy,
    handlers: DashMap<RecoveryActionType, Arc<dyn RecoveryHandler>>,
    cooldowns: Mutex<HashMap<CooldownKey, Instant>>,
    cooldown: Duration,
    action_timeout: Duration,
    history: Mutex<VecDeque<RecoveryAction>>,
    history_limit: usize,
    counters: OutcomeCounters,
    events: FailureEventStore,
    alerter: Arc<Alerter>,
    anomaly: Option<(Arc<AnomalyMonitor>, Duration)>,
}

impl RecoveryOrchestrator {
    pub fn new(settings: &RecoverySettings, events: FailureEventStore, alerter: Arc<Alerter>) -> Self {
        Self {
            policy: RecoveryPolicy::from_settings(settings),
            handlers: DashMap::new(),
            cooldowns: Mutex::new(HashMap::new()),
            cooldown: Duration::from_millis(settings.cooldown_ms),
            action_timeout: Duration::from_millis(settings.action_timeout_ms),
            history: Mutex::new(VecDeque::new()),
            history_limit: settings.history_limit.max(1),
            counters: OutcomeCounters::default(),
            events,
            alerter,
            anomaly: None,
        }
    }

    /// Run anomaly detection every `interval` inside [`run`](Self::run).
    /// A zero interval is raised to one millisecond.
    pub fn with_anomaly_monitor(mut self, monitor: Arc<AnomalyMonitor>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            tracing::warn!("Anomaly detection interval is zero, using {:?}", MIN_DETECT_INTERVAL);
            MIN_DETECT_INTERVAL
        } else {
            interval
        };
        self.anomaly = Some((monitor, interval));
        self
    }

    pub fn anomaly_interval(&self) -> Option<Duration> {
        self.anomaly.as_ref().map(|(_, interval)| *interval)
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub fn register_handler<H>(&self, action: RecoveryActionType, handler: H)
    where
        H: RecoveryHandler + 'static,
    {
        self.register_handler_arc(action, Arc::new(handler));
    }

    pub fn register_handler_arc(&self, action: RecoveryActionType, handler: Arc<dyn RecoveryHandler>) {
        tracing::debug!("Registered recovery handler for {}", action);
        self.handlers.insert(action, handler);
    }

    pub fn has_handler(&self, action: RecoveryActionType) -> bool {
        self.handlers.contains_key(&action)
    }

    /// React to a recorded failure event.
    ///
    /// Returns the action record when the policy selected an action.
    /// Categories that need an operator, built-in or configured through
    /// `no_auto_recover`, are raised to critical and alerted instead.
    pub async fn on_failure_event(&self, event: &FailureEvent) -> Option<RecoveryAction> {
        if event.resolved {
            return None;
        }
        if event.category == FailureCategory::RecoveryFailed {
            return None;
        }
        if self.policy.requires_manual(event.category) {
            let critical = match self.events.raise_severity(&event.id, Severity::Critical) {
                Ok(stored) if stored.resolved => return None,
                Ok(stored) => stored,
                // Not recorded in this log; alert with a critical copy
                Err(_) => FailureEvent {
                    severity: Severity::Critical,
                    ..event.clone()
                },
            };
            self.escalate(&critical).await;
            return None;
        }

        let action = self.policy.action_for_event(event)?;
        let trigger = match event.category {
            FailureCategory::CircuitOpen => TriggerSource::BreakerTrip,
            FailureCategory::HealthDegraded => TriggerSource::HealthCheck,
            _ => TriggerSource::FailureEvent,
        };
        Some(
            self.maybe_execute(action, &event.service_name, trigger, Some(event.id.clone()))
                .await,
        )
    }

    pub async fn on_anomaly_signal(&self, signal: &AnomalySignal) -> Option<RecoveryAction> {
        let (action, target) = self.policy.action_for_signal(signal)?;
        tracing::info!(
            "Anomaly on '{}' ({} {}, value {:.2} vs baseline {:.2}) -> {} {}",
            signal.metric_name,
            signal.severity,
            signal.direction,
            signal.value,
            signal.baseline_mean,
            action,
            target
        );
        Some(
            self.maybe_execute(action, &target, TriggerSource::Anomaly, None)
                .await,
        )
    }

    /// Operator-requested action. Subject to the same cooldown.
    pub async fn trigger_manual(&self, action: RecoveryActionType, target: &str) -> ResilienceResult<RecoveryAction> {
        if target.trim().is_empty() {
            return Err(ResilienceError::BadRequest(
                "target service must not be empty".to_string(),
            ));
        }
        Ok(self
            .maybe_execute(action, target, TriggerSource::Manual, None)
            .await)
    }

    /// Execute `action` against `target` unless the pair is cooling down.
    /// The cooldown restarts on every execution, whatever its outcome.
    pub async fn maybe_execute(
        &self,
        action: RecoveryActionType,
        target: &str,
        triggered_by: TriggerSource,
        trigger_event_id: Option<String>,
    ) -> RecoveryAction {
        let started_at = Utc::now();

        let skipped = {
            let mut cooldowns = self.cooldowns.lock();
            let key = (action, target.to_string());
            match cooldowns.get(&key) {
                Some(last) if last.elapsed() < self.cooldown => true,
                _ => {
                    cooldowns.insert(key, Instant::now());
                    false
                }
            }
        };

        if skipped {
            tracing::info!(
                "Skipping {} for '{}' ({}): cooling down",
                action,
                target,
                triggered_by
            );
            let record = RecoveryAction {
                id: uuid::Uuid::new_v4().to_string(),
                action_type: action,
                target_service: target.to_string(),
                triggered_by,
                started_at,
                completed_at: started_at,
                outcome: ActionOutcome::SkippedCooldown,
                details: None,
                trigger_event_id,
            };
            return self.finish(record);
        }

        tracing::info!("Running {} for '{}' ({})", action, target, triggered_by);
        let handler = self.handlers.get(&action).map(|h| h.value().clone());
        let result = match handler {
            None => Err(ResilienceError::HandlerMissing(action.to_string())),
            Some(handler) => match tokio::time::timeout(self.action_timeout, handler.execute(target)).await {
                Ok(result) => result,
                Err(_) => Err(ResilienceError::Timeout(self.action_timeout)),
            },
        };

        let (outcome, details) = match result {
            Ok(details) => {
                tracing::info!("Recovery action {} for '{}' succeeded: {}", action, target, details);
                if let Some(ref id) = trigger_event_id {
                    if let Err(e) = self.events.mark_resolved(id, action.as_str()) {
                        tracing::warn!("Could not resolve event {}: {}", id, e);
                    }
                }
                (ActionOutcome::Success, details)
            }
            Err(e) => {
                tracing::error!("Recovery action {} for '{}' failed: {}", action, target, e);
                let error = e.to_string();
                self.events
                    .record(FailureEvent::recovery_failed(action.as_str(), target, &error));
                (ActionOutcome::Failure, error)
            }
        };

        let record = RecoveryAction {
            id: uuid::Uuid::new_v4().to_string(),
            action_type: action,
            target_service: target.to_string(),
            triggered_by,
            started_at,
            completed_at: Utc::now(),
            outcome,
            details: Some(details),
            trigger_event_id,
        };
        self.finish(record)
    }

    fn finish(&self, record: RecoveryAction) -> RecoveryAction {
        let counter = match record.outcome {
            ActionOutcome::Success => &self.counters.success,
            ActionOutcome::Failure => &self.counters.failure,
            ActionOutcome::SkippedCooldown => &self.counters.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let mut history = self.history.lock();
        history.push_back(record.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
        record
    }

    async fn escalate(&self, event: &FailureEvent) {
        tracing::error!(
            "Manual intervention required for '{}' ({}): {} [event {}]",
            event.service_name,
            event.category,
            event.message,
            event.id
        );
        let alert = Alert::new(
            MANUAL_INTERVENTION,
            serde_json::json!({
                "event_id": event.id,
                "service_name": event.service_name,
                "category": event.category,
                "severity": event.severity,
                "message": event.message,
            }),
        );
        if let Err(e) = self.alerter.send(&alert).await {
            tracing::warn!("Failed to deliver escalation for event {}: {}", event.id, e);
        }
    }

    /// Most recent action records, newest first
    pub fn recent_actions(&self, limit: usize) -> Vec<RecoveryAction> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn totals(&self) -> ActionTotals {
        ActionTotals {
            success: self.counters.success.load(Ordering::Relaxed),
            failure: self.counters.failure.load(Ordering::Relaxed),
            skipped_cooldown: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    /// Time left before `action` may run against `target` again
    pub fn cooldown_remaining(&self, action: RecoveryActionType, target: &str) -> Option<Duration> {
        let cooldowns = self.cooldowns.lock();
        let last = cooldowns.get(&(action, target.to_string()))?;
        let remaining = self.cooldown.saturating_sub(last.elapsed());
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Main loop: react to recorded events and run anomaly detection on
    /// schedule. Ends when the event channel closes.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<FailureEvent>) {
        let detect_every = self
            .anomaly
            .as_ref()
            .map(|(_, interval)| *interval)
            .unwrap_or(Duration::from_secs(3600));
        let mut ticker = tokio::time::interval(detect_every.max(MIN_DETECT_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing to detect yet
        ticker.tick().await;

        tracing::info!("Recovery orchestrator started");
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        let orchestrator = Arc::clone(&self);
                        tokio::spawn(async move {
                            orchestrator.on_failure_event(&event).await;
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Recovery orchestrator lagged, {} events not inspected", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if let Some((ref monitor, _)) = self.anomaly {
                        for signal in monitor.detect() {
                            let orchestrator = Arc::clone(&self);
                            tokio::spawn(async move {
                                orchestrator.on_anomaly_signal(&signal).await;
                            });
                        }
                    }
                }
            }
        }
        tracing::info!("Recovery orchestrator stopped");
    }

    pub fn spawn(self: &Arc<Self>, events: broadcast::Receiver<FailureEvent>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(events))
    }
}

impl std::fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<RecoveryActionType> = self.handlers.iter().map(|e| *e.key()).collect();
        handlers.sort();
        f.debug_struct("RecoveryOrchestrator")
            .field("handlers", &handlers)
            .field("cooldown", &self.cooldown)
            .field("totals", &self.totals())
            .finish()
    }
}
