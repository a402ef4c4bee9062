//! Circuit breaker registry
//!
//! Owns every breaker by dependency name. Lookups go through a sharded map,
//! so there is no lock shared across breakers on the call path.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::persist::BreakerPersistence;
use super::{BreakerConfig, BreakerHandle, BreakerSnapshot, BreakerSummary, CircuitBreaker};
use crate::error::{ResilienceError, ResilienceResult};
use crate::events::FailureEventStore;

pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, BreakerHandle>,
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    events: FailureEventStore,
    persistence: Option<BreakerPersistence>,
}

impl CircuitBreakerRegistry {
    pub fn new(events: FailureEventStore, defaults: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            overrides: HashMap::new(),
            events,
            persistence: None,
        }
    }

    /// Per-service settings used by [`get_or_default`](Self::get_or_default)
    pub fn with_overrides(mut self, overrides: HashMap<String, BreakerConfig>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Persist transitions and bring back breakers from a previous run
    pub fn with_persistence(
        mut self,
        persistence: BreakerPersistence,
        restored: impl IntoIterator<Item = BreakerSnapshot>,
    ) -> Self {
        for snapshot in restored {
            let config = self.config_for(&snapshot.name);
            let breaker = CircuitBreaker::restore(
                &snapshot,
                config,
                self.events.clone(),
                Some(persistence.clone()),
            );
            tracing::info!(
                "Restored circuit breaker '{}' as {}",
                snapshot.name,
                breaker.state()
            );
            self.breakers.insert(snapshot.name.clone(), Arc::new(breaker));
        }
        self.persistence = Some(persistence);
        self
    }

    /// Settings that apply to `name` when no explicit config is given
    pub fn config_for(&self, name: &str) -> BreakerConfig {
        self.overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Return the breaker for `name`, registering it with `config` on first use.
    /// An already registered breaker keeps its original config.
    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> BreakerHandle {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!("Registering circuit breaker '{}'", name);
                Arc::new(CircuitBreaker::new(
                    name,
                    config,
                    self.events.clone(),
                    self.persistence.clone(),
                ))
            })
            .clone()
    }

    pub fn get_or_default(&self, name: &str) -> BreakerHandle {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.get_or_create(name, self.config_for(name))
    }

    pub fn get(&self, name: &str) -> Option<BreakerHandle> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Force a breaker closed. Safe to repeat.
    pub fn reset(&self, name: &str) -> ResilienceResult<()> {
        let breaker = self
            .get(name)
            .ok_or_else(|| ResilienceError::BreakerNotFound(name.to_string()))?;
        breaker.reset();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshots of every breaker, sorted by name
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let handles: Vec<BreakerHandle> = self.breakers.iter().map(|e| e.value().clone()).collect();
        let mut snapshots: Vec<BreakerSnapshot> = handles.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn summaries(&self) -> BTreeMap<String, BreakerSummary> {
        self.snapshots()
            .iter()
            .map(|s| (s.name.clone(), BreakerSummary::from(s)))
            .collect()
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.summaries())
            .field("defaults", &self.defaults)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use chrono::Utc;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(FailureEventStore::in_memory(), BreakerConfig::new(2, 60_000))
    }

    #[test]
    fn test_lazy_registration_returns_same_handle() {
        let registry = registry();
        assert!(registry.is_empty());
        let a = registry.get_or_default("db");
        let b = registry.get_or_create("db", BreakerConfig::new(99, 1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().failure_threshold, 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_overrides_apply_per_service() {
        let mut overrides = HashMap::new();
        overrides.insert("database".to_string(), BreakerConfig::new(7, 1000));
        let registry = registry().with_overrides(overrides);

        assert_eq!(registry.get_or_default("database").config().failure_threshold, 7);
        assert_eq!(registry.get_or_default("cache").config().failure_threshold, 2);
    }

    #[test]
    fn test_breakers_are_independent() {
        let registry = registry();
        let db = registry.get_or_default("db");
        let cache = registry.get_or_default("cache");
        db.record_failure("x");
        db.record_failure("x");
        assert_eq!(db.state(), CircuitState::Open);
        assert_eq!(cache.state(), CircuitState::Closed);
        assert!(cache.allow());
    }

    #[test]
    fn test_reset_unknown_breaker() {
        let registry = registry();
        assert!(matches!(
            registry.reset("nope"),
            Err(ResilienceError::BreakerNotFound(_))
        ));
    }

    #[test]
    fn test_summaries() {
        let registry = registry();
        registry.get_or_default("b").record_success();
        registry.get_or_default("a").record_failure("x");

        let summaries = registry.summaries();
        let names: Vec<&String> = summaries.keys().collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(summaries["a"].failure_count, 1);
        assert_eq!(summaries["b"].success_count, 1);
    }

    #[tokio::test]
    async fn test_restored_breakers_are_registered() {
        let dir = tempfile::TempDir::new().unwrap();
        let (persistence, _writer) =
            BreakerPersistence::channel(dir.path().join("breakers.json"), BTreeMap::new());
        let snapshot = BreakerSnapshot {
            name: "db".into(),
            state: CircuitState::Open,
            failure_count: 2,
            success_count: 0,
            half_open_in_flight: 0,
            last_state_change_at: Utc::now(),
            last_failure_at: None,
            trip_event_id: None,
        };

        let registry = registry().with_persistence(persistence, vec![snapshot]);
        let db = registry.get("db").unwrap();
        assert_eq!(db.state(), CircuitState::Open);
        assert!(!db.allow());
    }
}
