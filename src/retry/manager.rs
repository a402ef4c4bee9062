//! Guarded execution with retries

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{RetryError, RetryPolicy};
use crate::anomaly::AnomalyMonitor;
use crate::breaker::CircuitBreakerRegistry;
use crate::config::RetrySettings;

/// Breaker name for an operation id: the part before the first `:`.
/// `"payments:charge"` is guarded by the `payments` breaker, a bare id is
/// its own service.
pub fn service_of(operation_id: &str) -> &str {
    operation_id
        .split_once(':')
        .map(|(service, _)| service)
        .unwrap_or(operation_id)
}

pub struct RetryManager {
    breakers: Arc<CircuitBreakerRegistry>,
    settings: RetrySettings,
    anomaly: Option<Arc<AnomalyMonitor>>,
}

impl RetryManager {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, settings: RetrySettings) -> Self {
        Self {
            breakers,
            settings,
            anomaly: None,
        }
    }

    /// Feed per-attempt latency to the anomaly monitor as `<service>.latency_ms`
    pub fn with_anomaly_monitor(mut self, monitor: Arc<AnomalyMonitor>) -> Self {
        self.anomaly = Some(monitor);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Policy built from the configured defaults
    pub fn default_policy<E: 'static>(&self) -> RetryPolicy<E> {
        RetryPolicy::from_settings(&self.settings)
    }

    /// Run `operation` under the breaker of `operation_id`'s service.
    ///
    /// The breaker is consulted before every attempt; a refusal ends the
    /// execution at once with [`RetryError::CircuitOpen`], without running
    /// or sleeping. Each attempt that runs is reported to the breaker
    /// exactly once. Non-retryable errors and the final failed attempt are
    /// returned as they are.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation_id: &str,
        policy: &RetryPolicy<E>,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + 'static,
    {
        let service = service_of(operation_id);
        let breaker = self.breakers.get_or_default(service);
        let mut delays = policy.backoff();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if let Err(open) = breaker.try_acquire() {
                tracing::debug!(
                    "{} attempt {} refused: {}",
                    operation_id,
                    attempt,
                    open
                );
                return Err(RetryError::CircuitOpen(open));
            }

            let started = Instant::now();
            let outcome = match policy.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(result) => result.map_err(RetryError::Operation),
                    Err(_) => Err(RetryError::Timeout {
                        attempt,
                        timeout: limit,
                    }),
                },
                None => operation().await.map_err(RetryError::Operation),
            };
            self.observe_latency(service, started.elapsed());

            let err = match outcome {
                Ok(value) => {
                    breaker.record_success();
                    if attempt > 1 {
                        tracing::debug!("{} succeeded on attempt {}", operation_id, attempt);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    breaker.record_failure(&err.to_string());
                    err
                }
            };

            let retryable = match &err {
                RetryError::Operation(e) => policy.is_retryable(e),
                RetryError::Timeout { .. } => true,
                RetryError::CircuitOpen(_) => false,
            };
            if !retryable {
                tracing::debug!(
                    "{} failed with a non-retryable error on attempt {}: {}",
                    operation_id,
                    attempt,
                    err
                );
                return Err(err);
            }
            if attempt >= max_attempts {
                tracing::warn!(
                    "{} failed after {} attempts: {}",
                    operation_id,
                    attempt,
                    err
                );
                return Err(err);
            }

            let delay = delays.next().unwrap_or(policy.max_delay);
            tracing::debug!(
                "{} attempt {}/{} failed ({}), retrying in {:?}",
                operation_id,
                attempt,
                max_attempts,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn observe_latency(&self, service: &str, elapsed: Duration) {
        if let Some(ref monitor) = self.anomaly {
            monitor.ingest(
                &format!("{}.latency_ms", service),
                elapsed.as_secs_f64() * 1000.0,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::config::AnomalySettings;
    use crate::events::FailureEventStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manager(threshold: u32) -> RetryManager {
        let registry = CircuitBreakerRegistry::new(
            FailureEventStore::in_memory(),
            BreakerConfig::new(threshold, 60_000),
        );
        RetryManager::new(Arc::new(registry), RetrySettings::default())
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy<String> {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_delays(Duration::from_millis(10), Duration::from_millis(40))
    }

    #[test]
    fn test_service_of() {
        assert_eq!(service_of("payments:charge"), "payments");
        assert_eq!(service_of("db:users:select"), "db");
        assert_eq!(service_of("cache"), "cache");
    }

    #[tokio::test]
    async fn test_first_try_success() {
        let manager = manager(5);
        let result: Result<u32, RetryError<String>> = manager
            .execute("db:get", &fast_policy(3), || async { Ok(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(manager.breakers().get("db").unwrap().success_count(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_uses_every_attempt() {
        tokio::time::pause();
        let manager = manager(100);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = manager
            .execute("db:get", &fast_policy(4), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("connection reset".to_string()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(RetryError::Operation(msg)) => assert_eq!(msg, "connection reset"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(manager.breakers().get("db").unwrap().failure_count(), 4);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        tokio::time::pause();
        let manager = manager(5);
        let calls = AtomicU32::new(0);

        let result = manager
            .execute("api", &fast_policy(3), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err("503".to_string())
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let breaker = manager.breakers().get("api").unwrap();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let manager = manager(5);
        let calls = AtomicU32::new(0);
        let policy = fast_policy(5).retry_if(|e: &String| e != "forbidden");

        let result: Result<(), _> = manager
            .execute("auth", &policy, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("forbidden".to_string()) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Operation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_means_zero_attempts_and_zero_waits() {
        tokio::time::pause();
        let manager = manager(1);
        manager.breakers().get_or_default("db").record_failure("down");

        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), _> = manager
            .execute("db:query", &fast_policy(5), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("unreachable".to_string()) }
            })
            .await;

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_breaker_trips_mid_execution() {
        tokio::time::pause();
        let manager = manager(2);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = manager
            .execute("db:query", &fast_policy(5), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            })
            .await;

        // Two failures open the breaker; the third attempt is refused
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        tokio::time::pause();
        let manager = manager(10);
        let policy = fast_policy(2).with_attempt_timeout(Duration::from_millis(50));

        let result: Result<(), RetryError<String>> = manager
            .execute("slow", &policy, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        match result {
            Err(RetryError::Timeout { attempt, timeout }) => {
                assert_eq!(attempt, 2);
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(manager.breakers().get("slow").unwrap().failure_count(), 2);
    }

    #[tokio::test]
    async fn test_waits_stay_within_max_delay() {
        tokio::time::pause();
        let manager = manager(100);
        let policy = RetryPolicy::default()
            .with_max_attempts(6)
            .with_delays(Duration::from_millis(100), Duration::from_millis(300));

        let started = Instant::now();
        let _: Result<(), RetryError<String>> = manager
            .execute("x", &policy, || async { Err("no".to_string()) })
            .await;

        // 5 waits, none longer than 300ms
        assert!(started.elapsed() <= Duration::from_millis(5 * 300));
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_latency_is_fed_to_anomaly_monitor() {
        let monitor = Arc::new(AnomalyMonitor::new(AnomalySettings::default()));
        let manager = manager(5).with_anomaly_monitor(monitor.clone());

        let _: Result<(), RetryError<String>> = manager
            .execute("search:query", &fast_policy(1), || async { Ok(()) })
            .await;

        assert_eq!(monitor.window_len("search.latency_ms"), 1);
    }
}
