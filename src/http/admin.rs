//! Admin API over rate limit rules and monitoring data.
//!
//! Mounted under `/api/v1/rate-limit`; its `health` route falls under the
//! `/health` exemption, everything else is rate limited like any other route.

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::response::{ApiError, ApiResponse};
use crate::monitoring::{ClientStatistics, LimitedClient, MonitoringService, RateLimitEvent, RateLimitStatistics};
use crate::ratelimit::storage::sweep_once;
use crate::ratelimit::{RateLimitRule, RateLimitService, RuleConfig};

/// Path the admin router is nested under.
pub const ADMIN_PREFIX: &str = "/api/v1/rate-limit";

const HOUR: Duration = Duration::from_secs(3600);

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub service: Arc<RateLimitService>,
    pub monitoring: Arc<MonitoringService>,
    /// Idle horizon used when sweeping on demand
    pub retention: Duration,
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/statistics", get(statistics))
        .route("/clients/top", get(top_clients))
        .route("/clients/{client_id}/statistics", get(client_statistics))
        .route("/clients/{client_id}", delete(clear_client))
        .route("/violations", get(violations))
        .route("/rules", get(rules))
        .route("/rules/{name}", put(update_rule))
        .route("/all", delete(clear_all))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct HoursQuery {
    pub hours: Option<u64>,
}

impl HoursQuery {
    /// Look-back period, between 1 and 24 hours.
    fn period(&self) -> (u64, Duration) {
        let hours = self.hours.unwrap_or(1).clamp(1, 24);
        (hours, HOUR * hours as u32)
    }
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    pub count: Option<usize>,
}

async fn statistics(
    State(state): State<AdminState>,
    Query(query): Query<HoursQuery>,
) -> ApiResponse<RateLimitStatistics> {
    let (hours, period) = query.period();
    ApiResponse::success(
        state.monitoring.get_overall_statistics(period),
        format!("Rate limit statistics for the past {} hours retrieved successfully", hours),
    )
}

async fn top_clients(
    State(state): State<AdminState>,
    Query(query): Query<CountQuery>,
) -> ApiResponse<Vec<LimitedClient>> {
    let count = query.count.unwrap_or(10).clamp(1, 100);
    ApiResponse::success(
        state.monitoring.get_top_limited_clients(count, 24 * HOUR),
        format!("Top {} clients retrieved successfully", count),
    )
}

async fn client_statistics(
    State(state): State<AdminState>,
    Path(client_id): Path<String>,
    Query(query): Query<HoursQuery>,
) -> ApiResponse<ClientStatistics> {
    let (_, period) = query.period();
    ApiResponse::success(
        state.monitoring.get_statistics(&client_id, period),
        format!("Statistics for client {} retrieved successfully", client_id),
    )
}

async fn violations(
    State(state): State<AdminState>,
    Query(query): Query<HoursQuery>,
) -> ApiResponse<Vec<RateLimitEvent>> {
    let (hours, period) = query.period();
    ApiResponse::success(
        state.monitoring.recent_violations(period),
        format!("Rate limit violations for the past {} hours retrieved successfully", hours),
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesView {
    pub default_rule: String,
    pub rules: Vec<RateLimitRule>,
}

async fn rules(State(state): State<AdminState>) -> ApiResponse<RulesView> {
    let rules = state.service.rules();
    ApiResponse::success(
        RulesView {
            default_rule: rules.default_rule().to_string(),
            rules: rules.iter().cloned().collect(),
        },
        "Active rate limiting rules retrieved successfully",
    )
}

async fn update_rule(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(config): Json<RuleConfig>,
) -> Result<ApiResponse<RateLimitRule>, ApiError> {
    let rule = state.service.upsert_rule(&name, config)?;
    Ok(ApiResponse::success(
        rule,
        format!("Rate limiting rule '{}' updated successfully", name),
    ))
}

async fn clear_client(
    State(state): State<AdminState>,
    Path(client_id): Path<String>,
) -> Result<ApiResponse<()>, ApiError> {
    if client_id.trim().is_empty() {
        return Err(ApiError::BadRequest("Client ID is required".to_string()));
    }

    state.service.reset_client(&client_id).await?;
    state.monitoring.clear_client(&client_id);

    info!(client = %client_id, "Rate limits cleared for client");
    Ok(ApiResponse::<()>::message(format!("Rate limits cleared for client {}", client_id)))
}

/// Drop all monitoring history and sweep idle counters. Counters inside
/// the retention horizon, and so every active quota, are kept; use the
/// per-client delete to lift a quota.
async fn clear_all(State(state): State<AdminState>) -> Result<ApiResponse<()>, ApiError> {
    state.monitoring.clear_all();
    let now = state.service.clock().now();
    let removed = sweep_once(state.service.storage().as_ref(), now, state.retention).await?;

    warn!(swept = removed, "Rate limit history cleared");
    Ok(ApiResponse::<()>::message(
        "Rate limit history cleared successfully; active counters are kept",
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthView {
    pub status: &'static str,
    pub storage: &'static str,
    pub rules: usize,
    pub timestamp: chrono::DateTime<Utc>,
}

async fn health(State(state): State<AdminState>) -> ApiResponse<HealthView> {
    ApiResponse::success(
        HealthView {
            status: "healthy",
            storage: state.service.storage().backend_name(),
            rules: state.service.rules().len(),
            timestamp: Utc::now(),
        },
        "Rate limiting system is healthy",
    )
}
