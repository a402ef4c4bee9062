//! Retry manager
//!
//! Wraps individual operation attempts with exponential backoff. Every
//! attempt goes through the circuit breaker of the operation's service, so
//! an open circuit short-circuits the whole execution.

pub mod backoff;
pub mod manager;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::RetrySettings;
use crate::error::CircuitOpenError;
use crate::events::Categorized;

pub use backoff::Backoff;
pub use manager::{service_of, RetryManager};

/// Jitter applied to every computed delay (±20%)
pub const DEFAULT_JITTER: f64 = 0.2;

/// Outcome of a failed [`RetryManager::execute`]
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The breaker refused the attempt; nothing was run
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The last attempt exceeded the policy's attempt timeout
    #[error("Attempt {attempt} timed out after {timeout:?}")]
    Timeout { attempt: u32, timeout: Duration },

    /// The operation's own final error
    #[error("{0}")]
    Operation(E),
}

impl<E> RetryError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RetryError::CircuitOpen(_))
    }

    pub fn operation_error(&self) -> Option<&E> {
        match self {
            RetryError::Operation(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_operation_error(self) -> Option<E> {
        match self {
            RetryError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// How one execution retries.
///
/// `max_attempts` includes the first try. By default every error is
/// retryable; narrow it with [`retry_if`](Self::retry_if) or
/// [`by_category`](Self::by_category).
pub struct RetryPolicy<E> {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: f64,
    /// Each attempt is cancelled after this long and counted as a failure
    pub attempt_timeout: Option<Duration>,
    retryable: RetryPredicate<E>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
            attempt_timeout: self.attempt_timeout,
            retryable: self.retryable.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

impl<E: 'static> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl<E: 'static> RetryPolicy<E> {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
            jitter: DEFAULT_JITTER,
            attempt_timeout: settings.attempt_timeout_ms.map(Duration::from_millis),
            retryable: Arc::new(|_: &E| true),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max.max(initial);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Only retry errors for which `predicate` returns true
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, err: &E) -> bool {
        (self.retryable)(err)
    }

    /// Fresh delay schedule for one execution
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.initial_delay,
            self.max_delay,
            self.backoff_multiplier,
            self.jitter,
        )
    }
}

impl<E: Categorized + 'static> RetryPolicy<E> {
    /// Retry exactly the categories flagged retryable
    pub fn by_category(self) -> Self {
        self.retry_if(|e: &E| e.category().is_retryable())
    }
}
