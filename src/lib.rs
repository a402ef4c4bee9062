pub mod alert;
pub mod anomaly;
pub mod breaker;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod health;
pub mod recovery;
pub mod retry;
pub mod server;

pub use alert::{Alert, AlertSink, Alerter};
pub use anomaly::{AnomalyMonitor, AnomalySignal, MetricSample};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use config::ResilienceConfig;
pub use crate::core::ResilienceCore;
pub use error::{CircuitOpenError, ResilienceError, ResilienceResult};
pub use events::{FailureCategory, FailureEvent, FailureEventStore, FailureStats, Severity};
pub use health::{HealthCheck, HealthMonitor, HealthStatus, SystemHealth};
pub use recovery::{RecoveryAction, RecoveryActionType, RecoveryHandler, RecoveryOrchestrator};
pub use retry::{RetryError, RetryManager, RetryPolicy};
pub use server::create_router;
