use axum::http::Method;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::*;
use super::metrics::metrics_handler;
use crate::core::ResilienceCore;

pub fn create_router(core: Arc<ResilienceCore>) -> Router {
    let state = AppState::new(core);

    Router::new()
        .route("/_api/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Health
        .route("/_api/resilience/health", get(get_system_health))
        // Circuit breakers
        .route("/_api/resilience/breakers", get(list_circuit_breakers))
        .route(
            "/_api/resilience/breakers/{name}/reset",
            post(reset_circuit_breaker),
        )
        // Failure events
        .route("/_api/resilience/failures", get(get_recent_failures))
        .route("/_api/resilience/failures/stats", get(get_failure_stats))
        .route(
            "/_api/resilience/failures/{id}/resolve",
            post(resolve_failure),
        )
        // Recovery
        .route(
            "/_api/resilience/actions",
            get(list_recovery_actions).post(trigger_recovery_action),
        )
        .route("/_api/resilience/alerts/test", post(send_test_alert))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any),
        )
}
