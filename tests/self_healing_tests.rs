//! End-to-end self-healing flows through a running core:
//! breaker trips feeding the orchestrator, guarded retries, manual
//! escalations and state surviving a restart.

use selfheal::alert::{MemoryAlertSink, MANUAL_INTERVENTION};
use selfheal::breaker::BREAKERS_FILE;
use selfheal::events::FAILURE_EVENTS_FILE;
use selfheal::recovery::{handler_fn, ActionOutcome, TriggerSource};
use selfheal::{
    CircuitState, FailureCategory, FailureEvent, RecoveryActionType, ResilienceConfig,
    ResilienceCore, RetryError, RetryPolicy, Severity,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn config_from(text: &str) -> ResilienceConfig {
    ResilienceConfig::from_toml_str(text).expect("valid config")
}

#[tokio::test]
async fn test_breaker_trip_triggers_recovery() {
    let config = config_from(
        r#"
        [breaker]
        failure_threshold = 3
        open_duration_ms = 60000
        criticality = "high"

        [[recovery.rules]]
        category = "circuit_open"
        action = "restart_service"
        "#,
    );
    let core = ResilienceCore::new(config).unwrap();
    let restarts = Arc::new(AtomicU32::new(0));
    let counter = restarts.clone();
    core.orchestrator().register_handler(
        RecoveryActionType::RestartService,
        handler_fn(move |target| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("restarted {}", target))
            }
        }),
    );
    core.start();

    let breaker = core.breakers().get_or_default("billing");
    for _ in 0..3 {
        breaker.record_failure("503 from upstream");
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    assert!(wait_for(|| !core.recent_actions(10).is_empty()).await);
    let action = &core.recent_actions(10)[0];
    assert_eq!(action.action_type, RecoveryActionType::RestartService);
    assert_eq!(action.target_service, "billing");
    assert_eq!(action.triggered_by, TriggerSource::BreakerTrip);
    assert_eq!(action.outcome, ActionOutcome::Success);
    assert_eq!(restarts.load(Ordering::SeqCst), 1);

    // The trip event is resolved by the successful action
    let trip_id = action.trigger_event_id.clone().unwrap();
    let event = core.events().get(&trip_id).unwrap();
    assert!(event.resolved);
    assert_eq!(event.resolution_method.as_deref(), Some("restart_service"));

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_repeated_trips_respect_cooldown() {
    let config = config_from(
        r#"
        [breaker]
        failure_threshold = 1
        open_duration_ms = 60000

        [recovery]
        cooldown_ms = 600000

        [[recovery.rules]]
        category = "circuit_open"
        action = "clear_cache"
        "#,
    );
    let core = ResilienceCore::new(config).unwrap();
    core.start();

    let breaker = core.breakers().get_or_default("catalog");
    breaker.record_failure("timeout");
    assert!(wait_for(|| core.recent_actions(10).len() == 1).await);
    // Close by hand so the next failure trips it again
    breaker.reset();
    breaker.record_failure("timeout");

    assert!(wait_for(|| core.recent_actions(10).len() == 2).await);
    let totals = core.orchestrator().totals();
    assert_eq!(totals.success, 1);
    assert_eq!(totals.skipped_cooldown, 1);
    assert!(core
        .orchestrator()
        .cooldown_remaining(RecoveryActionType::ClearCache, "catalog")
        .is_some());

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_data_integrity_escalates_instead_of_recovering() {
    let config = config_from(
        r#"
        [[recovery.rules]]
        category = "data_integrity"
        action = "reconnect_database"
        "#,
    );
    let core = ResilienceCore::new(config).unwrap();
    let event = FailureEvent::new(
        "ledger",
        FailureCategory::DataIntegrity,
        Severity::Low,
        "checksum mismatch on page 42",
    );
    assert_eq!(event.severity, Severity::Critical);

    assert!(core.orchestrator().on_failure_event(&event).await.is_none());
    assert!(core.recent_actions(10).is_empty());
    assert_eq!(core.alerter().sent_count(), 1);
}

#[tokio::test]
async fn test_escalation_reaches_alert_sinks() {
    use selfheal::alert::Alerter;
    use selfheal::config::RecoverySettings;
    use selfheal::events::FailureEventStore;
    use selfheal::RecoveryOrchestrator;

    let sink = Arc::new(MemoryAlertSink::new());
    let alerter = Arc::new(Alerter::new().with_sink(sink.clone()));
    let orchestrator = RecoveryOrchestrator::new(
        &RecoverySettings::default(),
        FailureEventStore::in_memory(),
        alerter,
    );

    let event = FailureEvent::new(
        "gateway",
        FailureCategory::AuthFailure,
        Severity::Medium,
        "signing key rejected",
    );
    orchestrator.on_failure_event(&event).await;

    let alerts = sink.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, MANUAL_INTERVENTION);
    assert_eq!(alerts[0].payload["event_id"], event.id.as_str());
    assert_eq!(alerts[0].payload["service_name"], "gateway");
}

#[tokio::test]
async fn test_retries_stop_once_breaker_opens() {
    let config = config_from(
        r#"
        [breakers.search]
        failure_threshold = 2
        open_duration_ms = 60000
        "#,
    );
    let core = ResilienceCore::new(config).unwrap();
    let policy: RetryPolicy<String> = RetryPolicy::default()
        .with_max_attempts(5)
        .with_delays(Duration::from_millis(1), Duration::from_millis(5));

    let calls = AtomicU32::new(0);
    let result: Result<(), _> = core
        .retry()
        .execute("search:query", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), String>("connection reset".to_string()) }
        })
        .await;

    assert!(matches!(result, Err(RetryError::CircuitOpen(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        core.breakers().get("search").unwrap().state(),
        CircuitState::Open
    );

    // Subsequent executions never reach the operation
    let result: Result<(), _> = core
        .retry()
        .execute("search:suggest", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), String>(()) }
        })
        .await;
    assert!(result.unwrap_err().is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failure_history_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = ResilienceConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };

    let (open_id, resolved_id) = {
        let core = ResilienceCore::new(config.clone()).unwrap();
        let open_id = core.events().record(FailureEvent::new(
            "mailer",
            FailureCategory::DependencyUnavailable,
            Severity::Medium,
            "smtp relay unreachable",
        ));
        let resolved_id = core.events().record(FailureEvent::new(
            "mailer",
            FailureCategory::TransientNetwork,
            Severity::Low,
            "connection reset",
        ));
        core.resolve_failure(&resolved_id, "operator").unwrap();
        core.shutdown().await.unwrap();
        (open_id, resolved_id)
    };
    assert!(dir.path().join(FAILURE_EVENTS_FILE).exists());

    let core = ResilienceCore::new(config).unwrap();
    assert_eq!(core.events().len(), 2);
    assert!(!core.events().get(&open_id).unwrap().resolved);
    let resolved = core.events().get(&resolved_id).unwrap();
    assert!(resolved.resolved);
    assert_eq!(resolved.resolution_method.as_deref(), Some("operator"));

    let stats = core.failure_stats(24);
    assert_eq!(stats.total, 2);
    assert_eq!(stats.resolution_rate, 0.5);
}

#[tokio::test]
async fn test_corrupt_breaker_file_is_ignored() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(BREAKERS_FILE), b"{not json").unwrap();

    let core = ResilienceCore::new(ResilienceConfig {
        data_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    })
    .unwrap();
    assert!(core.breakers().is_empty());
}
