use super::system::AppState;
use crate::alert::Alert;
use crate::error::ResilienceError;
use crate::recovery::{RecoveryAction, RecoveryActionType};
use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_ACTION_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct RecentActionsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerRecoveryRequest {
    pub service_name: String,
    /// Parsed by hand so an unknown action is a 400, not a body rejection
    pub action_type: String,
}

#[derive(Debug, Deserialize)]
pub struct TestAlertRequest {
    #[serde(rename = "type")]
    pub alert_type: String,
    #[serde(default)]
    pub payload: Value,
}

pub async fn list_recovery_actions(
    State(state): State<AppState>,
    Query(params): Query<RecentActionsQuery>,
) -> Json<Vec<RecoveryAction>> {
    Json(
        state
            .core
            .recent_actions(params.limit.unwrap_or(DEFAULT_ACTION_LIMIT)),
    )
}

pub async fn trigger_recovery_action(
    State(state): State<AppState>,
    Json(req): Json<TriggerRecoveryRequest>,
) -> Result<Json<RecoveryAction>, ResilienceError> {
    let action: RecoveryActionType = req.action_type.parse()?;
    let record = state
        .core
        .trigger_recovery_action(&req.service_name, action)
        .await?;
    Ok(Json(record))
}

pub async fn send_test_alert(
    State(state): State<AppState>,
    Json(req): Json<TestAlertRequest>,
) -> Result<Json<Alert>, ResilienceError> {
    let alert = state
        .core
        .send_test_alert(&req.alert_type, req.payload)
        .await?;
    Ok(Json(alert))
}
