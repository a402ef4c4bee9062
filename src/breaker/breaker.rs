//! Circuit breaker state machine
//!
//! Every operation takes this breaker's own lock for a short critical
//! section; nothing here blocks on I/O. Trip events and persisted snapshots
//! are handed off after the lock is released.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::persist::BreakerPersistence;
use super::{BreakerConfig, BreakerSnapshot, CircuitState};
use crate::error::CircuitOpenError;
use crate::events::{FailureEvent, FailureEventStore};

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    /// Monotonic time of the last transition; drives the open window
    changed_at: Instant,
    last_state_change_at: DateTime<Utc>,
    last_failure_at: Option<DateTime<Utc>>,
    /// Event recorded when the breaker last tripped, resolved on close
    trip_event_id: Option<String>,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            changed_at: Instant::now(),
            last_state_change_at: Utc::now(),
            last_failure_at: None,
            trip_event_id: None,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.changed_at = Instant::now();
        self.last_state_change_at = Utc::now();
        self.half_open_in_flight = 0;
        self.success_count = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }
    }
}

/// Work to do once the lock is dropped
#[derive(Default)]
struct Followup {
    transition: Option<(CircuitState, CircuitState)>,
    trip_event: Option<FailureEvent>,
    resolve: Option<(String, &'static str)>,
}

/// A per-dependency circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: FailureEventStore,
    persistence: Option<BreakerPersistence>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        events: FailureEventStore,
        persistence: Option<BreakerPersistence>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::closed()),
            events,
            persistence,
        }
    }

    /// Rebuild a breaker from a persisted snapshot.
    ///
    /// An open (or half-open) breaker stays open for whatever is left of its
    /// window, measured from the persisted wall-clock transition time.
    pub fn restore(
        snapshot: &BreakerSnapshot,
        config: BreakerConfig,
        events: FailureEventStore,
        persistence: Option<BreakerPersistence>,
    ) -> Self {
        let breaker = Self::new(snapshot.name.clone(), config, events, persistence);
        {
            let mut inner = breaker.inner.lock();
            inner.failure_count = snapshot.failure_count;
            inner.last_failure_at = snapshot.last_failure_at;
            inner.trip_event_id = snapshot.trip_event_id.clone();
            inner.last_state_change_at = snapshot.last_state_change_at;

            if snapshot.state != CircuitState::Closed {
                let elapsed = (Utc::now() - snapshot.last_state_change_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                let now = Instant::now();
                inner.state = CircuitState::Open;
                inner.changed_at = now.checked_sub(elapsed).unwrap_or(now);
            } else {
                inner.success_count = snapshot.success_count;
            }
        }
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn open_duration(&self) -> Duration {
        Duration::from_millis(self.config.open_duration_ms)
    }

    fn probe_limit(&self) -> u32 {
        self.config.half_open_probe_limit.max(1)
    }

    /// The sole gate for calls. Returns true iff the breaker is closed, or
    /// half-open with a free probe slot.
    ///
    /// An open breaker whose window has elapsed moves to half-open here.
    /// Every `true` must be followed by exactly one `record_success` or
    /// `record_failure`, otherwise the probe slot stays taken.
    pub fn allow(&self) -> bool {
        let mut followup = Followup::default();
        let allowed = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => true,
                CircuitState::Open => {
                    if inner.changed_at.elapsed() >= self.open_duration() {
                        inner.transition(CircuitState::HalfOpen);
                        inner.half_open_in_flight = 1;
                        followup.transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        true
                    } else {
                        false
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.probe_limit() {
                        inner.half_open_in_flight += 1;
                        true
                    } else {
                        false
                    }
                }
            }
        };
        self.apply(followup);
        allowed
    }

    /// Like [`allow`](Self::allow) but returns the refusal as an error
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        if self.allow() {
            Ok(())
        } else {
            Err(CircuitOpenError {
                service: self.name.clone(),
                retry_after_ms: self.retry_after().as_millis() as u64,
            })
        }
    }

    pub fn record_success(&self) {
        let mut followup = Followup::default();
        {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    inner.success_count = inner.success_count.saturating_add(1);
                }
                CircuitState::HalfOpen => {
                    inner.transition(CircuitState::Closed);
                    followup.transition = Some((CircuitState::HalfOpen, CircuitState::Closed));
                    if let Some(id) = inner.trip_event_id.take() {
                        followup.resolve = Some((id, "half_open_probe"));
                    }
                }
                CircuitState::Open => {
                    // A call admitted before the trip finished late
                    tracing::debug!("Ignoring late success for open breaker '{}'", self.name);
                }
            }
        }
        self.apply(followup);
    }

    pub fn record_failure(&self, reason: &str) {
        let mut followup = Followup::default();
        {
            let mut inner = self.inner.lock();
            inner.last_failure_at = Some(Utc::now());
            inner.failure_count = inner.failure_count.saturating_add(1);

            match inner.state {
                CircuitState::Closed => {
                    if inner.failure_count >= self.config.failure_threshold {
                        let failures = inner.failure_count;
                        inner.transition(CircuitState::Open);
                        inner.failure_count = failures;
                        let event = FailureEvent::circuit_open(
                            &self.name,
                            failures,
                            self.config.criticality,
                            reason,
                        );
                        inner.trip_event_id = Some(event.id.clone());
                        followup.trip_event = Some(event);
                        followup.transition = Some((CircuitState::Closed, CircuitState::Open));
                    }
                }
                CircuitState::HalfOpen => {
                    let failures = inner.failure_count;
                    inner.transition(CircuitState::Open);
                    inner.failure_count = failures;
                    followup.transition = Some((CircuitState::HalfOpen, CircuitState::Open));
                }
                CircuitState::Open => {}
            }
        }
        self.apply(followup);
    }

    /// Force the breaker closed with zeroed counters
    pub fn reset(&self) {
        let mut followup = Followup::default();
        {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.transition(CircuitState::Closed);
            if from != CircuitState::Closed {
                followup.transition = Some((from, CircuitState::Closed));
            }
            if let Some(id) = inner.trip_event_id.take() {
                followup.resolve = Some((id, "manual_reset"));
            }
        }
        tracing::info!("Circuit breaker '{}' manually reset", self.name);
        if followup.transition.is_none() {
            self.persist();
        }
        self.apply(followup);
    }

    /// Stored state. Does not apply the lazy open → half-open transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.inner.lock().success_count
    }

    pub fn last_state_change_at(&self) -> DateTime<Utc> {
        self.inner.lock().last_state_change_at
    }

    /// Time left before an open breaker admits a probe
    pub fn retry_after(&self) -> Duration {
        let inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Duration::ZERO;
        }
        self.open_duration()
            .saturating_sub(inner.changed_at.elapsed())
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_in_flight: inner.half_open_in_flight,
            last_state_change_at: inner.last_state_change_at,
            last_failure_at: inner.last_failure_at,
            trip_event_id: inner.trip_event_id.clone(),
        }
    }

    fn apply(&self, followup: Followup) {
        if let Some(event) = followup.trip_event {
            tracing::warn!(
                "Circuit breaker '{}' opened: {}",
                self.name,
                event.message
            );
            self.events.record(event);
        }

        if let Some((id, method)) = followup.resolve {
            if let Err(e) = self.events.mark_resolved(&id, method) {
                tracing::warn!("Could not resolve trip event for '{}': {}", self.name, e);
            }
        }

        if let Some((from, to)) = followup.transition {
            tracing::info!(
                "Circuit breaker '{}' transitioned {} -> {}",
                self.name,
                from,
                to
            );
            self.persist();
        }
    }

    fn persist(&self) {
        if let Some(ref persistence) = self.persistence {
            persistence.submit(self.snapshot());
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, FailureCategory, Severity};
    use std::sync::Arc;

    fn breaker(threshold: u32, open_ms: u64) -> (CircuitBreaker, FailureEventStore) {
        let store = FailureEventStore::in_memory();
        let breaker = CircuitBreaker::new(
            "db",
            BreakerConfig::new(threshold, open_ms),
            store.clone(),
            None,
        );
        (breaker, store)
    }

    #[tokio::test]
    async fn test_db_breaker_scenario() {
        tokio::time::pause();
        let (breaker, _store) = breaker(3, 5000);

        for _ in 0..3 {
            assert!(breaker.allow());
            breaker.record_failure("connection refused");
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());

        tokio::time::advance(Duration::from_millis(5001)).await;
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (breaker, _store) = breaker(3, 5000);
        breaker.record_failure("x");
        breaker.record_failure("x");
        breaker.record_success();
        breaker.record_failure("x");
        breaker.record_failure("x");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 2);
    }

    #[test]
    fn test_trip_emits_circuit_open_event() {
        let store = FailureEventStore::in_memory();
        let breaker = CircuitBreaker::new(
            "payments",
            BreakerConfig::new(2, 1000).with_criticality(Severity::Critical),
            store.clone(),
            None,
        );
        breaker.record_failure("503");
        assert!(store.is_empty());
        breaker.record_failure("503");

        let events = store.query(&EventFilter {
            category: Some(FailureCategory::CircuitOpen),
            ..Default::default()
        });
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].service_name, "payments");
        assert_eq!(events[0].severity, Severity::Critical);
        assert!(events[0].message.contains("503"));
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_and_resets_timer() {
        tokio::time::pause();
        let (breaker, store) = breaker(1, 1000);
        breaker.record_failure("down");
        let opened_at = breaker.last_state_change_at();

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(breaker.allow());
        breaker.record_failure("still down");

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.last_state_change_at() >= opened_at);
        assert_eq!(breaker.retry_after(), Duration::from_millis(1000));
        assert!(!breaker.allow());
        // Reopening does not emit a second trip event
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent_with_multiple_probes() {
        tokio::time::pause();
        let store = FailureEventStore::in_memory();
        let breaker = CircuitBreaker::new(
            "db",
            BreakerConfig::new(1, 1000).with_probe_limit(3),
            store,
            None,
        );
        breaker.record_failure("down");
        tokio::time::advance(Duration::from_millis(1000)).await;

        assert!(breaker.allow());
        assert!(breaker.allow());
        assert!(breaker.allow());
        assert!(!breaker.allow());

        breaker.record_failure("probe 1");
        let retry_after = breaker.retry_after();
        tokio::time::advance(Duration::from_millis(10)).await;
        breaker.record_failure("probe 2");
        breaker.record_failure("probe 3");

        assert_eq!(breaker.state(), CircuitState::Open);
        // Later probe failures do not push the window out again
        assert_eq!(breaker.retry_after(), retry_after - Duration::from_millis(10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_half_open_admits_at_most_limit() {
        let breaker = Arc::new(CircuitBreaker::new(
            "db",
            BreakerConfig::new(1, 20).with_probe_limit(2),
            FailureEventStore::in_memory(),
            None,
        ));
        breaker.record_failure("down");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let barrier = Arc::new(tokio::sync::Barrier::new(64));
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let breaker = breaker.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    breaker.allow()
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().half_open_in_flight, 2);

        // Both admitted calls fail concurrently; the breaker reopens once
        let failures: Vec<_> = (0..admitted)
            .map(|i| {
                let breaker = breaker.clone();
                tokio::spawn(async move { breaker.record_failure(&format!("call {} failed", i)) })
            })
            .collect();
        for failure in failures {
            failure.await.unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[tokio::test]
    async fn test_unreported_probe_leaks_slot() {
        tokio::time::pause();
        let (breaker, _store) = breaker(1, 1000);
        breaker.record_failure("down");
        tokio::time::advance(Duration::from_millis(1000)).await;

        assert!(breaker.allow());
        // The probe never reported back: its slot stays taken
        assert!(!breaker.allow());
        assert!(!breaker.allow());
        assert_eq!(breaker.snapshot().half_open_in_flight, 1);

        breaker.record_failure("probe failed");
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(breaker.allow());
    }

    #[tokio::test]
    async fn test_probe_success_resolves_trip_event() {
        tokio::time::pause();
        let (breaker, store) = breaker(1, 100);
        breaker.record_failure("down");
        let trip_id = breaker.snapshot().trip_event_id.unwrap();

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(breaker.allow());
        breaker.record_success();

        let event = store.get(&trip_id).unwrap();
        assert!(event.resolved);
        assert_eq!(event.resolution_method.as_deref(), Some("half_open_probe"));
    }

    #[test]
    fn test_reset_closes_and_zeroes() {
        let (breaker, store) = breaker(1, 60_000);
        breaker.record_failure("down");
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.success_count(), 0);
        assert!(breaker.allow());

        let event = store.recent(1, None).remove(0);
        assert_eq!(event.resolution_method.as_deref(), Some("manual_reset"));

        // Resetting again is harmless
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_try_acquire_reports_retry_after() {
        let (breaker, _store) = breaker(1, 60_000);
        breaker.record_failure("down");
        let err = breaker.try_acquire().unwrap_err();
        assert_eq!(err.service, "db");
        assert!(err.retry_after_ms > 0 && err.retry_after_ms <= 60_000);
    }

    #[test]
    fn test_restore_open_breaker_keeps_window() {
        let store = FailureEventStore::in_memory();
        let snapshot = BreakerSnapshot {
            name: "db".into(),
            state: CircuitState::Open,
            failure_count: 5,
            success_count: 0,
            half_open_in_flight: 0,
            last_state_change_at: Utc::now(),
            last_failure_at: Some(Utc::now()),
            trip_event_id: None,
        };
        let breaker = CircuitBreaker::restore(&snapshot, BreakerConfig::new(5, 60_000), store, None);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
        assert_eq!(breaker.failure_count(), 5);
    }
}
