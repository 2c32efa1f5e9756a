//! Data models for the monitoring pipeline.
//!
//! Every persisted entity carries a time-sortable identifier (UUIDv7) and a
//! naive UTC timestamp. Naive timestamps are what the datastore stores; any
//! offset present in ingested data is normalized away before a record is
//! built.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Service name attributed to requests whose path matches no known prefix.
pub const GATEWAY_SERVICE: &str = "nginx_gateway";

/// URL path prefix to service name mapping used for attribution.
pub const SERVICE_ROUTES: [(&str, &str); 3] = [
    ("/api/auth", "kauth"),
    ("/api/admin", "ksysadmin"),
    ("/api/payment", "ksyspayment"),
];

/// All services that receive hourly aggregations.
pub const TRACKED_SERVICES: [&str; 4] = ["kauth", "ksysadmin", "ksyspayment", GATEWAY_SERVICE];

/// Generate a new time-sortable identifier.
pub fn new_id() -> Uuid {
    Uuid::now_v7()
}

/// Resolve the owning service from a request path.
pub fn service_for_url(url: &str) -> &'static str {
    SERVICE_ROUTES
        .iter()
        .find(|(prefix, _)| url.starts_with(prefix))
        .map(|(_, service)| *service)
        .unwrap_or(GATEWAY_SERVICE)
}

/// One observed HTTP request.
///
/// Written once by the collection cycle and never modified; read by the
/// aggregation and security engines and removed only by retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub id: Uuid,

    /// When the request was served (naive UTC).
    pub timestamp: NaiveDateTime,

    /// Owning service, derived from the URL prefix.
    pub service: String,

    pub remote_ip: String,
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub status: i32,

    /// Whether the edge rejected the request for exceeding its rate limit.
    pub rate_limited: bool,

    pub user_agent: String,

    /// Total time spent at the edge, in milliseconds.
    pub nginx_latency_ms: f64,

    /// Time spent in the backend, in milliseconds.
    ///
    /// `None` when the request never reached a backend. Averages and
    /// percentiles skip these rather than counting them as zero.
    pub backend_latency_ms: Option<f64>,

    pub user_id: Option<String>,
}

/// Hourly summary of one service's traffic.
///
/// There is at most one row per `(service, hour_start)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyMetricAggregation {
    pub id: Uuid,
    pub service: String,

    /// Inclusive start of the hour bucket, truncated to the hour.
    pub hour_start: NaiveDateTime,

    pub total_requests: i64,

    /// Status in `[200, 400)`.
    pub successful_requests: i64,

    /// Status in `[400, 500)`.
    pub client_errors: i64,

    /// Status `>= 500`.
    pub server_errors: i64,

    pub rate_limited_requests: i64,
    pub avg_nginx_latency_ms: f64,
    pub avg_backend_latency_ms: f64,
    pub p95_nginx_latency_ms: f64,
    pub p95_backend_latency_ms: f64,
    pub unique_ips: i64,
}

/// Ordinal classification attached to a detected anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Parse a severity label, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Severity for a burst of failed authentication attempts.
    ///
    /// # Thresholds
    ///
    /// - `critical`: attempts >= 20
    /// - `high`: attempts >= 10
    /// - `medium`: attempts >= 5
    /// - `low`: anything below
    pub fn for_failed_auth(attempts: i64) -> Self {
        if attempts >= 20 {
            Severity::Critical
        } else if attempts >= 10 {
            Severity::High
        } else if attempts >= 5 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Rule-specific payload of a suspicious activity, keyed by activity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "activity_type", content = "details", rename_all = "snake_case")]
pub enum ActivityDetails {
    /// More than half of an IP's requests in the window were errors.
    HighErrorRate {
        /// Error percentage, rounded to 2 decimals.
        error_rate: f64,
        total_requests: i64,
        error_count: i64,
        time_window_minutes: i64,
    },

    /// An IP exceeded the request-count threshold in a short window.
    RapidRequests {
        request_count: i64,
        time_window_seconds: i64,
        threshold: i64,
        requests_per_second: f64,
    },

    /// Repeated 401 responses on authentication endpoints.
    FailedAuthAttempts {
        failed_attempts: i64,
        time_window_minutes: i64,
        threshold: i64,
    },
}

impl ActivityDetails {
    /// The activity type label stored alongside the details.
    pub fn activity_type(&self) -> &'static str {
        match self {
            ActivityDetails::HighErrorRate { .. } => "high_error_rate",
            ActivityDetails::RapidRequests { .. } => "rapid_requests",
            ActivityDetails::FailedAuthAttempts { .. } => "failed_auth_attempts",
        }
    }

    /// Rebuild details from their stored `(activity_type, details)` pair.
    pub fn from_parts(activity_type: &str, details: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::json!({
            "activity_type": activity_type,
            "details": details,
        }))
    }

    /// The rule-specific fields without the type tag.
    pub fn fields(&self) -> serde_json::Result<serde_json::Value> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("details")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }
}

/// A detected anomaly attributed to a remote IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousActivity {
    pub id: Uuid,
    pub timestamp: NaiveDateTime,
    pub remote_ip: String,
    pub severity: Severity,

    #[serde(flatten)]
    pub details: ActivityDetails,
}

impl SuspiciousActivity {
    pub fn new(
        timestamp: NaiveDateTime,
        remote_ip: impl Into<String>,
        severity: Severity,
        details: ActivityDetails,
    ) -> Self {
        Self {
            id: new_id(),
            timestamp,
            remote_ip: remote_ip.into(),
            severity,
            details,
        }
    }

    pub fn activity_type(&self) -> &'static str {
        self.details.activity_type()
    }
}

/// A rate-limit counter observed at or above the violation threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitViolation {
    pub id: Uuid,
    pub timestamp: NaiveDateTime,
    pub service: String,
    pub remote_ip: String,
    pub violation_count: i64,
    pub user_id: Option<String>,
}

/// Liveness of one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// Parse a stored status; anything unrecognised is `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value {
            "healthy" => HealthStatus::Healthy,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

/// Point-in-time health of the datastore, the counter store and the crypto
/// module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealthSnapshot {
    pub id: Uuid,
    pub timestamp: NaiveDateTime,
    pub db_status: HealthStatus,
    pub db_latency_ms: f64,
    pub redis_status: HealthStatus,
    pub redis_latency_ms: f64,
    pub crypto_status: HealthStatus,
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_for_url() {
        assert_eq!(service_for_url("/api/auth/login"), "kauth");
        assert_eq!(service_for_url("/api/admin/users"), "ksysadmin");
        assert_eq!(service_for_url("/api/payment/create"), "ksyspayment");
        assert_eq!(service_for_url("/"), GATEWAY_SERVICE);
        assert_eq!(service_for_url("/api/other"), GATEWAY_SERVICE);
    }

    #[test]
    fn test_failed_auth_severity_escalation() {
        assert_eq!(Severity::for_failed_auth(4), Severity::Low);
        assert_eq!(Severity::for_failed_auth(5), Severity::Medium);
        assert_eq!(Severity::for_failed_auth(9), Severity::Medium);
        assert_eq!(Severity::for_failed_auth(10), Severity::High);
        assert_eq!(Severity::for_failed_auth(19), Severity::High);
        assert_eq!(Severity::for_failed_auth(20), Severity::Critical);
    }

    #[test]
    fn test_severity_ordering_and_parse() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(Severity::parse("HIGH"), Some(Severity::High));
        assert_eq!(Severity::parse("severe"), None);
    }

    #[test]
    fn test_activity_details_split_and_rebuild() {
        let details = ActivityDetails::FailedAuthAttempts {
            failed_attempts: 12,
            time_window_minutes: 15,
            threshold: 5,
        };

        let fields = details.fields().unwrap();
        assert_eq!(fields["failed_attempts"], 12);
        assert!(fields.get("activity_type").is_none());

        let rebuilt = ActivityDetails::from_parts(details.activity_type(), fields).unwrap();
        assert_eq!(rebuilt, details);
    }

    #[test]
    fn test_activity_details_unknown_type_rejected() {
        let result = ActivityDetails::from_parts("port_scan", serde_json::json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn test_suspicious_activity_serializes_flat() {
        let activity = SuspiciousActivity::new(
            chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap().naive_utc(),
            "10.0.0.1",
            Severity::High,
            ActivityDetails::RapidRequests {
                request_count: 80,
                time_window_seconds: 10,
                threshold: 50,
                requests_per_second: 8.0,
            },
        );

        let value = serde_json::to_value(&activity).unwrap();
        assert_eq!(value["activity_type"], "rapid_requests");
        assert_eq!(value["severity"], "high");
        assert_eq!(value["details"]["request_count"], 80);
    }

    #[test]
    fn test_health_status_parse() {
        assert_eq!(HealthStatus::parse("healthy"), HealthStatus::Healthy);
        assert_eq!(HealthStatus::parse("unhealthy"), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::parse("???"), HealthStatus::Unknown);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(1.005_1), 1.01);
        assert_eq!(round2(33.333_33), 33.33);
        assert_eq!(round2(0.0), 0.0);
    }
}
