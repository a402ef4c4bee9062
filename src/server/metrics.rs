//! Prometheus metrics endpoint
//!
//! Exposes resilience state in Prometheus text format at /metrics

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use std::time::Duration;

use super::handlers::AppState;
use crate::breaker::CircuitState;
use crate::core::ResilienceCore;
use crate::health::HealthStatus;

/// Prometheus metrics handler
///
/// Returns metrics in Prometheus text exposition format.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let output = render_metrics(&state.core, state.startup_time.elapsed());

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
}

fn state_value(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::Open => 1,
        CircuitState::HalfOpen => 2,
    }
}

fn health_value(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Unhealthy => 2,
    }
}

/// Escape a label value for the text exposition format
fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

pub fn render_metrics(core: &ResilienceCore, uptime: Duration) -> String {
    let mut output = String::new();

    output.push_str("# HELP selfheal_uptime_seconds Time since server started in seconds\n");
    output.push_str("# TYPE selfheal_uptime_seconds gauge\n");
    output.push_str(&format!(
        "selfheal_uptime_seconds {:.3}\n\n",
        uptime.as_secs_f64()
    ));

    // Circuit breakers
    let breakers = core.circuit_breakers();
    output.push_str(
        "# HELP selfheal_circuit_breaker_state Breaker state (0=closed, 1=open, 2=half_open)\n",
    );
    output.push_str("# TYPE selfheal_circuit_breaker_state gauge\n");
    for (name, summary) in &breakers {
        output.push_str(&format!(
            "selfheal_circuit_breaker_state{{name=\"{}\"}} {}\n",
            escape_label(name),
            state_value(summary.state)
        ));
    }
    output.push('\n');

    output.push_str(
        "# HELP selfheal_circuit_breaker_failures Consecutive failures counted by the breaker\n",
    );
    output.push_str("# TYPE selfheal_circuit_breaker_failures gauge\n");
    for (name, summary) in &breakers {
        output.push_str(&format!(
            "selfheal_circuit_breaker_failures{{name=\"{}\"}} {}\n",
            escape_label(name),
            summary.failure_count
        ));
    }
    output.push('\n');

    // Failure events, over everything retained
    let events = core.events();
    let stats = events.stats(Duration::MAX);
    output.push_str("# HELP selfheal_failure_events_total Failure events retained in the store\n");
    output.push_str("# TYPE selfheal_failure_events_total gauge\n");
    output.push_str(&format!("selfheal_failure_events_total {}\n\n", stats.total));

    output.push_str("# HELP selfheal_failure_events_unresolved Unresolved failure events\n");
    output.push_str("# TYPE selfheal_failure_events_unresolved gauge\n");
    output.push_str(&format!(
        "selfheal_failure_events_unresolved {}\n\n",
        stats.unresolved
    ));

    output.push_str(
        "# HELP selfheal_failure_events_dropped_total Persistence ops dropped under back-pressure\n",
    );
    output.push_str("# TYPE selfheal_failure_events_dropped_total counter\n");
    output.push_str(&format!(
        "selfheal_failure_events_dropped_total {}\n\n",
        events.dropped_events()
    ));

    // Recovery
    let totals = core.orchestrator().totals();
    output.push_str("# HELP selfheal_recovery_actions_total Recovery actions by outcome\n");
    output.push_str("# TYPE selfheal_recovery_actions_total counter\n");
    output.push_str(&format!(
        "selfheal_recovery_actions_total{{outcome=\"success\"}} {}\n",
        totals.success
    ));
    output.push_str(&format!(
        "selfheal_recovery_actions_total{{outcome=\"failure\"}} {}\n",
        totals.failure
    ));
    output.push_str(&format!(
        "selfheal_recovery_actions_total{{outcome=\"skipped_cooldown\"}} {}\n\n",
        totals.skipped_cooldown
    ));

    output.push_str("# HELP selfheal_alerts_sent_total Alerts dispatched to sinks\n");
    output.push_str("# TYPE selfheal_alerts_sent_total counter\n");
    output.push_str(&format!(
        "selfheal_alerts_sent_total {}\n\n",
        core.alerter().sent_count()
    ));

    // Health
    output.push_str(
        "# HELP selfheal_health_status Overall health (0=healthy, 1=degraded, 2=unhealthy)\n",
    );
    output.push_str("# TYPE selfheal_health_status gauge\n");
    output.push_str(&format!(
        "selfheal_health_status {}\n",
        health_value(core.health().overall_status())
    ));

    output
}
