use super::system::AppState;
use crate::core::DEFAULT_FAILURE_LIMIT;
use crate::error::ResilienceError;
use crate::events::{FailureEvent, FailureStats, Severity};
use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;

const DEFAULT_STATS_HOURS: u64 = 24;

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub hours: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RecentFailuresQuery {
    pub limit: Option<usize>,
    pub severity: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveFailureRequest {
    #[serde(default)]
    pub method: Option<String>,
}

pub async fn get_failure_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> Json<FailureStats> {
    let hours = params.hours.unwrap_or(DEFAULT_STATS_HOURS);
    Json(state.core.failure_stats(hours))
}

pub async fn get_recent_failures(
    State(state): State<AppState>,
    Query(params): Query<RecentFailuresQuery>,
) -> Result<Json<Vec<FailureEvent>>, ResilienceError> {
    let severity = params
        .severity
        .as_deref()
        .map(str::parse::<Severity>)
        .transpose()?;
    let limit = params.limit.unwrap_or(DEFAULT_FAILURE_LIMIT);
    Ok(Json(state.core.recent_failures(limit, severity)))
}

pub async fn resolve_failure(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveFailureRequest>,
) -> Result<Json<FailureEvent>, ResilienceError> {
    let method = req.method.unwrap_or_else(|| "manual".to_string());
    Ok(Json(state.core.resolve_failure(&id, &method)?))
}
