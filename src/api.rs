//! HTTP API handlers for vigil.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness, including a datastore ping
//! - `POST /aggregation/trigger/{hourly,security-analysis,cleanup}` - On-demand engine runs
//! - `GET /monitoring/metrics...` - Raw metric snapshots and hourly summaries
//! - `GET /security/...` - Suspicious activities, threat assessment, rate-limit violations
//! - `GET /health-monitoring/...` - Health snapshots and availability analysis
//!
//! Read endpoints return `500` with an empty body when the datastore fails and
//! `400` for malformed parameters. Trigger endpoints return a
//! [`TriggerFailure`] body instead.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::aggregation::Aggregator;
use crate::collectors::{HealthAnalysis, analyze_health, parse_timestamp};
use crate::error::MonitorError;
use crate::model::{
    HourlyMetricAggregation, MetricSnapshot, RateLimitViolation, Severity, SuspiciousActivity,
    SystemHealthSnapshot,
};
use crate::retention::RetentionEngine;
use crate::security::{SecurityAnalyzer, ThreatAssessment, assess_threat_level};
use crate::storage::{Storage, from_ts};
use crate::triggers::{
    self, CleanupTriggerResponse, HourlyTriggerResponse, SecurityTriggerResponse, TriggerFailure,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub aggregator: Aggregator,
    pub analyzer: SecurityAnalyzer,
    pub retention: RetentionEngine,
}

/// Upper bound on snapshots read for a health analysis.
const HEALTH_ANALYSIS_LIMIT: i64 = 10_000;

/// Build the full router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/aggregation/trigger/hourly", post(trigger_hourly))
        .route(
            "/aggregation/trigger/security-analysis",
            post(trigger_security_analysis),
        )
        .route("/aggregation/trigger/cleanup", post(trigger_cleanup))
        .route("/monitoring/metrics", get(get_metrics))
        .route("/monitoring/metrics/hourly", get(get_hourly_aggregations))
        .route("/monitoring/metrics/rate-limited", get(get_rate_limited))
        .route("/monitoring/metrics/errors", get(get_error_requests))
        .route("/monitoring/metrics/by-ip/:remote_ip", get(get_metrics_by_ip))
        .route("/monitoring/metrics/by-user/:user_id", get(get_metrics_by_user))
        .route(
            "/security/suspicious-activities/recent",
            get(get_recent_activities),
        )
        .route(
            "/security/suspicious-activities/by-ip/:remote_ip",
            get(get_activities_by_ip),
        )
        .route(
            "/security/suspicious-activities/by-severity/:severity",
            get(get_activities_by_severity),
        )
        .route(
            "/security/suspicious-activities/threat-assessment",
            get(get_threat_assessment),
        )
        .route(
            "/security/rate-limit-violations/recent",
            get(get_recent_violations),
        )
        .route(
            "/security/rate-limit-violations/by-ip/:remote_ip",
            get(get_violations_by_ip),
        )
        .route(
            "/security/rate-limit-violations/by-service/:service",
            get(get_violations_by_service),
        )
        .route("/health-monitoring/snapshots/latest", get(get_latest_health))
        .route("/health-monitoring/snapshots/history", get(get_health_history))
        .route("/health-monitoring/analysis", get(get_health_analysis))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Parameter helpers
// ============================================================================

/// Resolve an optional `limit` against its default and upper bound.
fn limit(requested: Option<i64>, default: i64, max: i64) -> Result<i64, StatusCode> {
    match requested {
        None => Ok(default),
        Some(n) if (1..=max).contains(&n) => Ok(n),
        Some(n) => {
            warn!(limit = n, max, "Limit out of range");
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

fn time_param(value: Option<&str>) -> Result<Option<NaiveDateTime>, StatusCode> {
    value
        .map(|v| {
            parse_timestamp(v).ok_or_else(|| {
                warn!(value = %v, "Invalid timestamp parameter");
                StatusCode::BAD_REQUEST
            })
        })
        .transpose()
}

fn required_time(value: &str) -> Result<NaiveDateTime, StatusCode> {
    time_param(Some(value))?.ok_or(StatusCode::BAD_REQUEST)
}

fn query_failed(what: &'static str) -> impl FnOnce(MonitorError) -> StatusCode {
    move |e| {
        warn!(error = %e, "Failed to query {what}");
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

// ============================================================================
// Health and triggers
// ============================================================================

/// GET /health - Liveness check; `503` when the datastore is unreachable.
pub async fn health_check(State(state): State<AppState>) -> StatusCode {
    match state.storage.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Health check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HourlyTriggerQuery {
    /// Hour to aggregate; defaults to the previous completed hour.
    pub hour: Option<String>,
}

type TriggerResult<T> = Result<Json<T>, (StatusCode, Json<TriggerFailure>)>;

fn trigger_error(failure: TriggerFailure) -> (StatusCode, Json<TriggerFailure>) {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(failure))
}

/// POST /aggregation/trigger/hourly - Aggregate one hour for every service.
///
/// # Response
///
/// ```json
/// {
///     "status": "success",
///     "hour": "2025-01-15T10:00:00",
///     "services_aggregated": 3,
///     "details": {"kauth": 1, "ksysadmin": 1, "ksyspayment": 1, "nginx_gateway": 0}
/// }
/// ```
#[instrument(skip(state))]
pub async fn trigger_hourly(
    State(state): State<AppState>,
    Query(query): Query<HourlyTriggerQuery>,
) -> TriggerResult<HourlyTriggerResponse> {
    let hour = time_param(query.hour.as_deref())
        .map_err(|status| (status, Json(TriggerFailure::new("invalid hour"))))?;

    triggers::trigger_hourly_aggregation(&state.aggregator, hour)
        .await
        .map(Json)
        .map_err(trigger_error)
}

/// POST /aggregation/trigger/security-analysis - Run every detection rule now.
#[instrument(skip(state))]
pub async fn trigger_security_analysis(
    State(state): State<AppState>,
) -> TriggerResult<SecurityTriggerResponse> {
    triggers::trigger_security_analysis(&state.analyzer)
        .await
        .map(Json)
        .map_err(trigger_error)
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub retention_days: Option<u32>,
}

/// POST /aggregation/trigger/cleanup - Purge old rows now.
#[instrument(skip(state))]
pub async fn trigger_cleanup(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> TriggerResult<CleanupTriggerResponse> {
    triggers::trigger_cleanup(&state.retention, query.retention_days)
        .await
        .map(Json)
        .map_err(trigger_error)
}

// ============================================================================
// Monitoring
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub service: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub service: String,
    pub count: usize,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub metrics: Vec<MetricSnapshot>,
}

/// GET /monitoring/metrics - Snapshots for a service.
///
/// # Query Parameters
///
/// - `service` (required)
/// - `start`, `end` (optional): ISO-8601; the range applies only when both are given
/// - `limit` (optional): 1..=10000, default 1000
#[instrument(skip(state))]
pub async fn get_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<MetricsResponse>, StatusCode> {
    let limit = limit(query.limit, 1000, 10_000)?;
    let start = time_param(query.start.as_deref())?;
    let end = time_param(query.end.as_deref())?;

    let metrics = match (start, end) {
        (Some(start), Some(end)) => {
            state
                .storage
                .metrics_in_range(start, end, Some(&query.service), limit)
                .await
        }
        _ => state.storage.metrics_by_service(&query.service, limit).await,
    }
    .map_err(query_failed("metrics"))?;

    info!(service = %query.service, count = metrics.len(), "Metrics queried");
    Ok(Json(MetricsResponse {
        service: query.service,
        count: metrics.len(),
        start,
        end,
        metrics,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HourlyQuery {
    pub service: String,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HourlyResponse {
    pub service: String,
    pub count: usize,
    pub aggregations: Vec<HourlyMetricAggregation>,
}

/// GET /monitoring/metrics/hourly - Hourly summaries for a service.
#[instrument(skip(state))]
pub async fn get_hourly_aggregations(
    State(state): State<AppState>,
    Query(query): Query<HourlyQuery>,
) -> Result<Json<HourlyResponse>, StatusCode> {
    let start = time_param(query.start.as_deref())?;
    let end = time_param(query.end.as_deref())?;

    let aggregations = match (start, end) {
        (Some(start), Some(end)) => {
            state
                .storage
                .aggregations_in_range(&query.service, start, end)
                .await
        }
        _ => state.storage.aggregations_by_service(&query.service, 100).await,
    }
    .map_err(query_failed("hourly aggregations"))?;

    Ok(Json(HourlyResponse {
        service: query.service,
        count: aggregations.len(),
        aggregations,
    }))
}

#[derive(Debug, Serialize)]
pub struct RateLimitedResponse {
    pub count: usize,
    pub rate_limited_requests: Vec<MetricSnapshot>,
}

/// GET /monitoring/metrics/rate-limited - Requests rejected by the edge limiter.
#[instrument(skip(state))]
pub async fn get_rate_limited(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<RateLimitedResponse>, StatusCode> {
    let limit = limit(query.limit, 100, 1000)?;
    let metrics = state
        .storage
        .rate_limited_metrics(limit)
        .await
        .map_err(query_failed("rate-limited metrics"))?;

    Ok(Json(RateLimitedResponse {
        count: metrics.len(),
        rate_limited_requests: metrics,
    }))
}

#[derive(Debug, Serialize)]
pub struct ErrorRequestsResponse {
    pub count: usize,
    pub error_requests: Vec<MetricSnapshot>,
}

/// GET /monitoring/metrics/errors - Requests with a 4xx or 5xx status.
#[instrument(skip(state))]
pub async fn get_error_requests(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ErrorRequestsResponse>, StatusCode> {
    let limit = limit(query.limit, 100, 1000)?;
    let metrics = state
        .storage
        .error_metrics(limit)
        .await
        .map_err(query_failed("error metrics"))?;

    Ok(Json(ErrorRequestsResponse {
        count: metrics.len(),
        error_requests: metrics,
    }))
}

#[derive(Debug, Serialize)]
pub struct IpMetricsResponse {
    pub remote_ip: String,
    pub count: usize,
    pub metrics: Vec<MetricSnapshot>,
}

/// GET /monitoring/metrics/by-ip/:remote_ip
#[instrument(skip(state))]
pub async fn get_metrics_by_ip(
    State(state): State<AppState>,
    Path(remote_ip): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<IpMetricsResponse>, StatusCode> {
    let limit = limit(query.limit, 100, 1000)?;
    let metrics = state
        .storage
        .metrics_by_ip(&remote_ip, limit)
        .await
        .map_err(query_failed("metrics by IP"))?;

    Ok(Json(IpMetricsResponse {
        remote_ip,
        count: metrics.len(),
        metrics,
    }))
}

#[derive(Debug, Serialize)]
pub struct UserMetricsResponse {
    pub user_id: String,
    pub count: usize,
    pub metrics: Vec<MetricSnapshot>,
}

/// GET /monitoring/metrics/by-user/:user_id
#[instrument(skip(state))]
pub async fn get_metrics_by_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<UserMetricsResponse>, StatusCode> {
    let limit = limit(query.limit, 100, 1000)?;
    let metrics = state
        .storage
        .metrics_by_user(&user_id, limit)
        .await
        .map_err(query_failed("metrics by user"))?;

    Ok(Json(UserMetricsResponse {
        user_id,
        count: metrics.len(),
        metrics,
    }))
}

// ============================================================================
// Security
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ActivitiesResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub count: usize,
    pub activities: Vec<SuspiciousActivity>,
}

impl ActivitiesResponse {
    fn new(activities: Vec<SuspiciousActivity>) -> Self {
        Self {
            remote_ip: None,
            severity: None,
            count: activities.len(),
            activities,
        }
    }
}

/// GET /security/suspicious-activities/recent
#[instrument(skip(state))]
pub async fn get_recent_activities(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ActivitiesResponse>, StatusCode> {
    let limit = limit(query.limit, 50, 500)?;
    let activities = state
        .storage
        .recent_suspicious_activities(limit)
        .await
        .map_err(query_failed("suspicious activities"))?;

    Ok(Json(ActivitiesResponse::new(activities)))
}

/// GET /security/suspicious-activities/by-ip/:remote_ip
#[instrument(skip(state))]
pub async fn get_activities_by_ip(
    State(state): State<AppState>,
    Path(remote_ip): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ActivitiesResponse>, StatusCode> {
    let limit = limit(query.limit, 100, 500)?;
    let activities = state
        .storage
        .suspicious_activities_by_ip(&remote_ip, limit)
        .await
        .map_err(query_failed("suspicious activities by IP"))?;

    Ok(Json(ActivitiesResponse {
        remote_ip: Some(remote_ip),
        ..ActivitiesResponse::new(activities)
    }))
}

/// GET /security/suspicious-activities/by-severity/:severity
///
/// `severity` is one of `low`, `medium`, `high`, `critical`; anything else is
/// a `400`.
#[instrument(skip(state))]
pub async fn get_activities_by_severity(
    State(state): State<AppState>,
    Path(severity): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ActivitiesResponse>, StatusCode> {
    let Some(severity) = Severity::parse(&severity) else {
        warn!(severity = %severity, "Unknown severity");
        return Err(StatusCode::BAD_REQUEST);
    };
    let limit = limit(query.limit, 100, 500)?;

    let activities = state
        .storage
        .suspicious_activities_by_severity(severity, limit)
        .await
        .map_err(query_failed("suspicious activities by severity"))?;

    Ok(Json(ActivitiesResponse {
        severity: Some(severity),
        ..ActivitiesResponse::new(activities)
    }))
}

#[derive(Debug, Serialize)]
pub struct ThreatAssessmentResponse {
    pub assessment: ThreatAssessment,
    pub analyzed_activities: usize,
}

/// GET /security/suspicious-activities/threat-assessment - Threat level over
/// the most recent activities.
#[instrument(skip(state))]
pub async fn get_threat_assessment(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ThreatAssessmentResponse>, StatusCode> {
    let limit = limit(query.limit, 100, 1000)?;
    let activities = state
        .storage
        .recent_suspicious_activities(limit)
        .await
        .map_err(query_failed("suspicious activities"))?;

    let assessment = assess_threat_level(&activities);
    info!(
        threat_level = ?assessment.threat_level,
        analyzed = activities.len(),
        "Threat assessed"
    );

    Ok(Json(ThreatAssessmentResponse {
        assessment,
        analyzed_activities: activities.len(),
    }))
}

#[derive(Debug, Serialize)]
pub struct ViolationsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub count: usize,
    pub violations: Vec<RateLimitViolation>,
}

impl ViolationsResponse {
    fn new(violations: Vec<RateLimitViolation>) -> Self {
        Self {
            remote_ip: None,
            service: None,
            count: violations.len(),
            violations,
        }
    }
}

/// GET /security/rate-limit-violations/recent
#[instrument(skip(state))]
pub async fn get_recent_violations(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ViolationsResponse>, StatusCode> {
    let limit = limit(query.limit, 50, 500)?;
    let violations = state
        .storage
        .recent_violations(limit)
        .await
        .map_err(query_failed("rate-limit violations"))?;

    Ok(Json(ViolationsResponse::new(violations)))
}

/// GET /security/rate-limit-violations/by-ip/:remote_ip
#[instrument(skip(state))]
pub async fn get_violations_by_ip(
    State(state): State<AppState>,
    Path(remote_ip): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ViolationsResponse>, StatusCode> {
    let limit = limit(query.limit, 100, 500)?;
    let violations = state
        .storage
        .violations_by_ip(&remote_ip, limit)
        .await
        .map_err(query_failed("rate-limit violations by IP"))?;

    Ok(Json(ViolationsResponse {
        remote_ip: Some(remote_ip),
        ..ViolationsResponse::new(violations)
    }))
}

/// GET /security/rate-limit-violations/by-service/:service
#[instrument(skip(state))]
pub async fn get_violations_by_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ViolationsResponse>, StatusCode> {
    let limit = limit(query.limit, 100, 500)?;
    let violations = state
        .storage
        .violations_by_service(&service, limit)
        .await
        .map_err(query_failed("rate-limit violations by service"))?;

    Ok(Json(ViolationsResponse {
        service: Some(service),
        ..ViolationsResponse::new(violations)
    }))
}

// ============================================================================
// Health monitoring
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SnapshotsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<NaiveDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<NaiveDateTime>,
    pub count: usize,
    pub snapshots: Vec<SystemHealthSnapshot>,
}

/// GET /health-monitoring/snapshots/latest
#[instrument(skip(state))]
pub async fn get_latest_health(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<SnapshotsResponse>, StatusCode> {
    let limit = limit(query.limit, 10, 100)?;
    let snapshots = state
        .storage
        .latest_health(limit)
        .await
        .map_err(query_failed("health snapshots"))?;

    Ok(Json(SnapshotsResponse {
        start: None,
        end: None,
        count: snapshots.len(),
        snapshots,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HealthRangeQuery {
    pub start: String,
    pub end: String,
    pub limit: Option<i64>,
}

/// GET /health-monitoring/snapshots/history - Snapshots between `start` and `end`.
#[instrument(skip(state))]
pub async fn get_health_history(
    State(state): State<AppState>,
    Query(query): Query<HealthRangeQuery>,
) -> Result<Json<SnapshotsResponse>, StatusCode> {
    let start = required_time(&query.start)?;
    let end = required_time(&query.end)?;
    let limit = limit(query.limit, 1000, 10_000)?;

    let snapshots = state
        .storage
        .health_in_range(start, end, limit)
        .await
        .map_err(query_failed("health history"))?;

    Ok(Json(SnapshotsResponse {
        start: Some(start),
        end: Some(end),
        count: snapshots.len(),
        snapshots,
    }))
}

#[derive(Debug, Serialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Serialize)]
pub struct HealthAnalysisResponse {
    pub time_range: TimeRange,
    pub analysis: HealthAnalysis,
}

/// GET /health-monitoring/analysis - Availability and latency summary.
///
/// `end` defaults to now and `start` to the Unix epoch when omitted.
#[instrument(skip(state))]
pub async fn get_health_analysis(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<HealthAnalysisResponse>, StatusCode> {
    let start = time_param(query.start.as_deref())?.unwrap_or_else(|| from_ts(0));
    let end = time_param(query.end.as_deref())?.unwrap_or_else(|| Utc::now().naive_utc());

    let snapshots = state
        .storage
        .health_in_range(start, end, HEALTH_ANALYSIS_LIMIT)
        .await
        .map_err(query_failed("health history"))?;

    let analysis = analyze_health(&snapshots);
    info!(status = ?analysis.status, snapshots = analysis.total_snapshots, "Health analyzed");

    Ok(Json(HealthAnalysisResponse {
        time_range: TimeRange { start, end },
        analysis,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_bounds() {
        assert_eq!(limit(None, 50, 500), Ok(50));
        assert_eq!(limit(Some(500), 50, 500), Ok(500));
        assert_eq!(limit(Some(0), 50, 500), Err(StatusCode::BAD_REQUEST));
        assert_eq!(limit(Some(501), 50, 500), Err(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_time_param() {
        assert_eq!(time_param(None), Ok(None));
        assert!(time_param(Some("2025-01-15T10:00:00")).unwrap().is_some());
        assert_eq!(
            time_param(Some("2025-01-15T12:00:00+02:00")),
            time_param(Some("2025-01-15T10:00:00"))
        );
        assert_eq!(time_param(Some("yesterday")), Err(StatusCode::BAD_REQUEST));
    }
}
