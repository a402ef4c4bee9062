//! Recovery action handlers
//!
//! Every handler must be safe to run repeatedly against the same target.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::RecoveryActionType;
use crate::breaker::CircuitBreakerRegistry;
use crate::error::{ResilienceError, ResilienceResult};

#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Run the action against `target`, returning a short description of
    /// what was done.
    async fn execute(&self, target: &str) -> ResilienceResult<String>;
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = ResilienceResult<String>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> RecoveryHandler for FnHandler<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = ResilienceResult<String>> + Send,
{
    async fn execute(&self, target: &str) -> ResilienceResult<String> {
        (self.f)(target.to_string()).await
    }
}

/// `reset_circuit_breaker`: force the target's breaker closed
pub struct ResetBreakerHandler {
    registry: Arc<CircuitBreakerRegistry>,
}

impl ResetBreakerHandler {
    pub fn new(registry: Arc<CircuitBreakerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RecoveryHandler for ResetBreakerHandler {
    async fn execute(&self, target: &str) -> ResilienceResult<String> {
        self.registry.reset(target)?;
        Ok(format!("circuit breaker '{}' reset", target))
    }
}

/// Targets that should shed load. Application code asks
/// [`is_throttled`](Self::is_throttled) before accepting work.
#[derive(Debug, Default)]
pub struct RequestThrottle {
    until: DashMap<String, Instant>,
}

impl RequestThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Throttle `target` for `duration`. Extending an active throttle keeps
    /// the later deadline.
    pub fn throttle(&self, target: &str, duration: Duration) {
        let deadline = Instant::now() + duration;
        self.until
            .entry(target.to_string())
            .and_modify(|d| *d = (*d).max(deadline))
            .or_insert(deadline);
    }

    pub fn is_throttled(&self, target: &str) -> bool {
        let deadline = self.until.get(target).map(|d| *d);
        match deadline {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                self.until.remove(target);
                false
            }
            None => false,
        }
    }

    pub fn release(&self, target: &str) {
        self.until.remove(target);
    }

    /// Currently throttled targets, sorted
    pub fn throttled(&self) -> Vec<String> {
        let now = Instant::now();
        let mut targets: Vec<String> = self
            .until
            .iter()
            .filter(|e| now < *e.value())
            .map(|e| e.key().clone())
            .collect();
        targets.sort();
        targets
    }
}

/// `throttle_requests`
pub struct ThrottleHandler {
    throttle: Arc<RequestThrottle>,
    window: Duration,
}

impl ThrottleHandler {
    pub fn new(throttle: Arc<RequestThrottle>, window: Duration) -> Self {
        Self { throttle, window }
    }
}

#[async_trait]
impl RecoveryHandler for ThrottleHandler {
    async fn execute(&self, target: &str) -> ResilienceResult<String> {
        self.throttle.throttle(target, self.window);
        Ok(format!("'{}' throttled for {:?}", target, self.window))
    }
}

/// An in-process cache that can drop its contents
pub trait Purgeable: Send + Sync {
    /// Drop cached entries, returning how many were removed
    fn purge(&self) -> usize;
}

/// Caches the memory and cache actions can purge
#[derive(Default)]
pub struct CacheRegistry {
    caches: RwLock<Vec<(String, Arc<dyn Purgeable>)>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, cache: Arc<dyn Purgeable>) {
        self.caches.write().push((name.into(), cache));
    }

    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }

    /// Purge caches registered under `name`; `None` when there are none
    pub fn purge(&self, name: &str) -> Option<usize> {
        let caches: Vec<Arc<dyn Purgeable>> = self
            .caches
            .read()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, c)| c.clone())
            .collect();
        if caches.is_empty() {
            return None;
        }
        Some(caches.iter().map(|c| c.purge()).sum())
    }

    pub fn purge_all(&self) -> usize {
        let caches: Vec<Arc<dyn Purgeable>> =
            self.caches.read().iter().map(|(_, c)| c.clone()).collect();
        caches.iter().map(|c| c.purge()).sum()
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.caches.read().iter().map(|(n, _)| n.clone()).collect();
        f.debug_struct("CacheRegistry").field("caches", &names).finish()
    }
}

/// `clear_cache` purges the target's caches (all caches when the target has
/// none registered); `cleanup_memory` always purges everything.
pub struct PurgeCachesHandler {
    caches: Arc<CacheRegistry>,
    everything: bool,
}

impl PurgeCachesHandler {
    pub fn clear_cache(caches: Arc<CacheRegistry>) -> Self {
        Self {
            caches,
            everything: false,
        }
    }

    pub fn cleanup_memory(caches: Arc<CacheRegistry>) -> Self {
        Self {
            caches,
            everything: true,
        }
    }
}

#[async_trait]
impl RecoveryHandler for PurgeCachesHandler {
    async fn execute(&self, target: &str) -> ResilienceResult<String> {
        let purged = if self.everything {
            self.caches.purge_all()
        } else {
            match self.caches.purge(target) {
                Some(n) => n,
                None => self.caches.purge_all(),
            }
        };
        Ok(format!(
            "purged {} entries from {} caches",
            purged,
            self.caches.len()
        ))
    }
}

/// Delegates an action to an external endpoint: POSTs
/// `{action_type, target_service}` and treats non-2xx as failure.
pub struct WebhookHandler {
    client: reqwest::Client,
    url: String,
    action: RecoveryActionType,
}

impl WebhookHandler {
    pub fn new(action: RecoveryActionType, url: impl Into<String>, timeout: Duration) -> ResilienceResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            action,
        })
    }
}

#[async_trait]
impl RecoveryHandler for WebhookHandler {
    async fn execute(&self, target: &str) -> ResilienceResult<String> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "action_type": self.action,
                "target_service": target,
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(format!("{} hook returned {}", self.action, status))
        } else {
            Err(ResilienceError::ActionFailed(format!(
                "{} hook returned {}",
                self.action, status
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::events::FailureEventStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCache {
        entries: AtomicUsize,
    }

    impl Purgeable for CountingCache {
        fn purge(&self) -> usize {
            self.entries.swap(0, Ordering::SeqCst)
        }
    }

    fn cache(entries: usize) -> Arc<CountingCache> {
        Arc::new(CountingCache {
            entries: AtomicUsize::new(entries),
        })
    }

    #[tokio::test]
    async fn test_reset_breaker_handler() {
        let registry = Arc::new(CircuitBreakerRegistry::new(
            FailureEventStore::in_memory(),
            BreakerConfig::new(1, 60_000),
        ));
        registry.get_or_default("db").record_failure("down");
        let handler = ResetBreakerHandler::new(registry.clone());

        handler.execute("db").await.unwrap();
        assert_eq!(registry.get("db").unwrap().state(), CircuitState::Closed);
        // Idempotent
        handler.execute("db").await.unwrap();
        assert!(matches!(
            handler.execute("unknown").await,
            Err(ResilienceError::BreakerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_throttle_expires() {
        tokio::time::pause();
        let throttle = Arc::new(RequestThrottle::new());
        let handler = ThrottleHandler::new(throttle.clone(), Duration::from_secs(60));

        handler.execute("api").await.unwrap();
        assert!(throttle.is_throttled("api"));
        assert!(!throttle.is_throttled("other"));
        assert_eq!(throttle.throttled(), vec!["api".to_string()]);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!throttle.is_throttled("api"));
        assert!(throttle.throttled().is_empty());
    }

    #[test]
    fn test_throttle_keeps_later_deadline() {
        let throttle = RequestThrottle::new();
        throttle.throttle("api", Duration::from_secs(600));
        throttle.throttle("api", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(throttle.is_throttled("api"));
        throttle.release("api");
        assert!(!throttle.is_throttled("api"));
    }

    #[tokio::test]
    async fn test_clear_cache_targets_named_caches() {
        let caches = Arc::new(CacheRegistry::new());
        let sessions = cache(10);
        let templates = cache(5);
        caches.register("sessions", sessions.clone());
        caches.register("templates", templates.clone());

        let handler = PurgeCachesHandler::clear_cache(caches.clone());
        handler.execute("sessions").await.unwrap();
        assert_eq!(sessions.entries.load(Ordering::SeqCst), 0);
        assert_eq!(templates.entries.load(Ordering::SeqCst), 5);

        // Unknown target purges everything
        handler.execute("api").await.unwrap();
        assert_eq!(templates.entries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cleanup_memory_purges_all() {
        let caches = Arc::new(CacheRegistry::new());
        caches.register("a", cache(3));
        caches.register("b", cache(4));
        let details = PurgeCachesHandler::cleanup_memory(caches)
            .execute("memory")
            .await
            .unwrap();
        assert!(details.contains("purged 7 entries"));
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let handler = handler_fn(|target: String| async move {
            if target == "api" {
                Ok("restarted".to_string())
            } else {
                Err(ResilienceError::ActionFailed(format!("cannot restart {}", target)))
            }
        });
        assert_eq!(handler.execute("api").await.unwrap(), "restarted");
        assert!(handler.execute("db").await.is_err());
    }

    #[tokio::test]
    async fn test_webhook_handler() {
        use axum::{http::StatusCode, routing::post, Json, Router};

        let router = Router::new()
            .route(
                "/ok",
                post(|Json(body): Json<serde_json::Value>| async move {
                    assert_eq!(body["action_type"], "restart_service");
                    assert_eq!(body["target_service"], "api");
                    StatusCode::NO_CONTENT
                }),
            )
            .route("/fail", post(|| async { StatusCode::BAD_GATEWAY }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let ok = WebhookHandler::new(
            RecoveryActionType::RestartService,
            format!("http://{}/ok", addr),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(ok.execute("api").await.is_ok());

        let failing = WebhookHandler::new(
            RecoveryActionType::RestartService,
            format!("http://{}/fail", addr),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(matches!(
            failing.execute("api").await,
            Err(ResilienceError::ActionFailed(_))
        ));
    }
}
