use super::system::AppState;
use crate::breaker::BreakerSummary;
use crate::error::ResilienceError;
use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
pub struct ResetBreakerResponse {
    pub name: String,
    pub status: String,
}

pub async fn list_circuit_breakers(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, BreakerSummary>> {
    Json(state.core.circuit_breakers())
}

pub async fn reset_circuit_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ResetBreakerResponse>, ResilienceError> {
    state.core.reset_circuit_breaker(&name)?;
    Ok(Json(ResetBreakerResponse {
        name,
        status: "reset".to_string(),
    }))
}
