use crate::core::ResilienceCore;
use crate::health::SystemHealth;
use axum::{extract::State, response::Json};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<ResilienceCore>,
    pub startup_time: std::time::Instant,
}

impl AppState {
    pub fn new(core: Arc<ResilienceCore>) -> Self {
        Self {
            core,
            startup_time: std::time::Instant::now(),
        }
    }
}

/// Liveness probe for the admin server itself
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Aggregate status plus the latest result of every registered check
pub async fn get_system_health(State(state): State<AppState>) -> Json<SystemHealth> {
    Json(state.core.system_health())
}
