//! SQLite storage layer for the monitoring pipeline.
//!
//! Five tables back the pipeline:
//!
//! - `metric_snapshots`: one row per observed request
//! - `hourly_metric_aggregations`: one row per `(service, hour_start)`
//! - `suspicious_activities`: detected anomalies, details stored as JSON
//! - `rate_limit_violations`: counters observed over the threshold
//! - `system_health_snapshots`: dependency health over time
//!
//! Timestamps are stored as Unix seconds in INTEGER columns and surfaced as
//! naive UTC [`NaiveDateTime`] values.
//!
//! Writes that must commit together (a collection cycle) go through the
//! free functions taking a `&mut SqliteConnection`, so the caller decides the
//! transaction boundary. Everything else is a method on [`Storage`].

use chrono::{DateTime, NaiveDateTime};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};

use crate::error::{MonitorError, Result};
use crate::model::{
    ActivityDetails, HealthStatus, HourlyMetricAggregation, MetricSnapshot, RateLimitViolation,
    Severity, SuspiciousActivity, SystemHealthSnapshot,
};

const METRIC_COLUMNS: &str = "id, ts, service, remote_ip, request_id, method, url, status, \
     rate_limited, user_agent, nginx_latency_ms, backend_latency_ms, user_id";

const AGGREGATION_COLUMNS: &str = "id, service, hour_start, total_requests, successful_requests, \
     client_errors, server_errors, rate_limited_requests, avg_nginx_latency_ms, \
     avg_backend_latency_ms, p95_nginx_latency_ms, p95_backend_latency_ms, unique_ips";

const ACTIVITY_COLUMNS: &str = "id, ts, remote_ip, activity_type, severity, details";

const VIOLATION_COLUMNS: &str = "id, ts, service, remote_ip, violation_count, user_id";

const HEALTH_COLUMNS: &str =
    "id, ts, db_status, db_latency_ms, redis_status, redis_latency_ms, crypto_status";

/// Convert a naive UTC timestamp to stored Unix seconds.
pub fn to_ts(timestamp: NaiveDateTime) -> i64 {
    timestamp.and_utc().timestamp()
}

/// Convert stored Unix seconds back to a naive UTC timestamp.
pub fn from_ts(ts: i64) -> NaiveDateTime {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

/// The classes of data subject to retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataClass {
    MetricSnapshots,
    HealthSnapshots,
    SuspiciousActivities,
    RateLimitViolations,
    HourlyAggregations,
}

impl DataClass {
    pub const ALL: [DataClass; 5] = [
        DataClass::MetricSnapshots,
        DataClass::HealthSnapshots,
        DataClass::SuspiciousActivities,
        DataClass::RateLimitViolations,
        DataClass::HourlyAggregations,
    ];

    /// Label used in cleanup reports.
    pub fn label(&self) -> &'static str {
        match self {
            DataClass::MetricSnapshots => "metric_snapshots",
            DataClass::HealthSnapshots => "health_snapshots",
            DataClass::SuspiciousActivities => "suspicious_activities",
            DataClass::RateLimitViolations => "rate_violations",
            DataClass::HourlyAggregations => "hourly_aggregations",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            DataClass::MetricSnapshots => "metric_snapshots",
            DataClass::HealthSnapshots => "system_health_snapshots",
            DataClass::SuspiciousActivities => "suspicious_activities",
            DataClass::RateLimitViolations => "rate_limit_violations",
            DataClass::HourlyAggregations => "hourly_metric_aggregations",
        }
    }

    fn time_column(&self) -> &'static str {
        match self {
            DataClass::HourlyAggregations => "hour_start",
            _ => "ts",
        }
    }
}

/// Per-IP request and error totals over a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpErrorCounts {
    pub remote_ip: String,
    pub total: i64,
    pub errors: i64,
}

/// Per-IP request count over a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRequestCount {
    pub remote_ip: String,
    pub count: i64,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:vigil.db?mode=rwc" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");

        // Each connection to an in-memory database sees its own empty
        // database, so keep exactly one alive for the life of the pool.
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options.connect(database_url).await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS metric_snapshots (
                id BLOB PRIMARY KEY,
                ts INTEGER NOT NULL,
                service TEXT NOT NULL,
                remote_ip TEXT NOT NULL,
                request_id TEXT NOT NULL,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                status INTEGER NOT NULL,
                rate_limited INTEGER NOT NULL,
                user_agent TEXT NOT NULL,
                nginx_latency_ms REAL NOT NULL,
                backend_latency_ms REAL,
                user_id TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_metric_snapshots_ts ON metric_snapshots(ts)",
            "CREATE INDEX IF NOT EXISTS idx_metric_snapshots_service_ts ON metric_snapshots(service, ts)",
            "CREATE INDEX IF NOT EXISTS idx_metric_snapshots_ip_ts ON metric_snapshots(remote_ip, ts)",
            "CREATE INDEX IF NOT EXISTS idx_metric_snapshots_user ON metric_snapshots(user_id)",
            r#"
            CREATE TABLE IF NOT EXISTS hourly_metric_aggregations (
                id BLOB PRIMARY KEY,
                service TEXT NOT NULL,
                hour_start INTEGER NOT NULL,
                total_requests INTEGER NOT NULL,
                successful_requests INTEGER NOT NULL,
                client_errors INTEGER NOT NULL,
                server_errors INTEGER NOT NULL,
                rate_limited_requests INTEGER NOT NULL,
                avg_nginx_latency_ms REAL NOT NULL,
                avg_backend_latency_ms REAL NOT NULL,
                p95_nginx_latency_ms REAL NOT NULL,
                p95_backend_latency_ms REAL NOT NULL,
                unique_ips INTEGER NOT NULL
            )
            "#,
            // Enforces one aggregation per service-hour
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS uq_hourly_service_hour
            ON hourly_metric_aggregations(service, hour_start)
            "#,
            "CREATE INDEX IF NOT EXISTS idx_hourly_hour_start ON hourly_metric_aggregations(hour_start)",
            r#"
            CREATE TABLE IF NOT EXISTS suspicious_activities (
                id BLOB PRIMARY KEY,
                ts INTEGER NOT NULL,
                remote_ip TEXT NOT NULL,
                activity_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                details TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_suspicious_ts ON suspicious_activities(ts)",
            "CREATE INDEX IF NOT EXISTS idx_suspicious_ip_ts ON suspicious_activities(remote_ip, ts)",
            "CREATE INDEX IF NOT EXISTS idx_suspicious_severity ON suspicious_activities(severity)",
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_violations (
                id BLOB PRIMARY KEY,
                ts INTEGER NOT NULL,
                service TEXT NOT NULL,
                remote_ip TEXT NOT NULL,
                violation_count INTEGER NOT NULL,
                user_id TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_violations_ts ON rate_limit_violations(ts)",
            "CREATE INDEX IF NOT EXISTS idx_violations_service ON rate_limit_violations(service)",
            "CREATE INDEX IF NOT EXISTS idx_violations_ip_ts ON rate_limit_violations(remote_ip, ts)",
            r#"
            CREATE TABLE IF NOT EXISTS system_health_snapshots (
                id BLOB PRIMARY KEY,
                ts INTEGER NOT NULL,
                db_status TEXT NOT NULL,
                db_latency_ms REAL NOT NULL,
                redis_status TEXT NOT NULL,
                redis_latency_ms REAL NOT NULL,
                crypto_status TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_health_ts ON system_health_snapshots(ts)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Start a transaction on a pooled connection.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Trivial round trip used by the health prober.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================================================================
    // Metric snapshots
    // ========================================================================

    /// Insert snapshots in a single transaction.
    pub async fn record_metric_snapshots(&self, snapshots: &[MetricSnapshot]) -> Result<u64> {
        let mut tx = self.begin().await?;
        let inserted = insert_metric_snapshots(&mut tx, snapshots).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// Snapshots for a service with `start <= ts < end`, oldest first.
    ///
    /// This is the hour-bucket query used by aggregation, so the upper bound
    /// is exclusive.
    pub async fn metrics_in_bucket(
        &self,
        service: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<MetricSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM metric_snapshots
             WHERE service = ? AND ts >= ? AND ts < ?
             ORDER BY ts ASC"
        ))
        .bind(service)
        .bind(to_ts(start))
        .bind(to_ts(end))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(metric_from_row).collect())
    }

    /// Most recent snapshots for a service.
    pub async fn metrics_by_service(&self, service: &str, limit: i64) -> Result<Vec<MetricSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM metric_snapshots
             WHERE service = ? ORDER BY ts DESC LIMIT ?"
        ))
        .bind(service)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(metric_from_row).collect())
    }

    /// Snapshots with `start <= ts <= end`, optionally for one service, newest first.
    pub async fn metrics_in_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        service: Option<&str>,
        limit: i64,
    ) -> Result<Vec<MetricSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM metric_snapshots
             WHERE ts >= ? AND ts <= ? AND (? IS NULL OR service = ?)
             ORDER BY ts DESC LIMIT ?"
        ))
        .bind(to_ts(start))
        .bind(to_ts(end))
        .bind(service)
        .bind(service)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(metric_from_row).collect())
    }

    pub async fn metrics_by_ip(&self, remote_ip: &str, limit: i64) -> Result<Vec<MetricSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM metric_snapshots
             WHERE remote_ip = ? ORDER BY ts DESC LIMIT ?"
        ))
        .bind(remote_ip)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(metric_from_row).collect())
    }

    pub async fn metrics_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<MetricSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM metric_snapshots
             WHERE user_id = ? ORDER BY ts DESC LIMIT ?"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(metric_from_row).collect())
    }

    /// Most recent requests that the edge rejected for rate limiting.
    pub async fn rate_limited_metrics(&self, limit: i64) -> Result<Vec<MetricSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM metric_snapshots
             WHERE rate_limited = 1 ORDER BY ts DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(metric_from_row).collect())
    }

    /// Most recent requests with a status of 400 or above.
    pub async fn error_metrics(&self, limit: i64) -> Result<Vec<MetricSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM metric_snapshots
             WHERE status >= 400 ORDER BY ts DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(metric_from_row).collect())
    }

    /// Per-IP totals since `since`, keeping IPs with at least `min_requests`.
    ///
    /// A request counts as an error when its status is 400 or above.
    pub async fn error_counts_by_ip(
        &self,
        since: NaiveDateTime,
        min_requests: i64,
    ) -> Result<Vec<IpErrorCounts>> {
        let rows = sqlx::query(
            r#"
            SELECT remote_ip,
                   COUNT(*) AS total,
                   SUM(CASE WHEN status >= 400 THEN 1 ELSE 0 END) AS errors
            FROM metric_snapshots
            WHERE ts >= ?
            GROUP BY remote_ip
            HAVING COUNT(*) >= ?
            "#,
        )
        .bind(to_ts(since))
        .bind(min_requests)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| IpErrorCounts {
                remote_ip: r.get("remote_ip"),
                total: r.get("total"),
                errors: r.get::<Option<i64>, _>("errors").unwrap_or(0),
            })
            .collect())
    }

    /// Per-IP request counts since `since`, keeping IPs strictly above `threshold`.
    pub async fn request_counts_above(
        &self,
        since: NaiveDateTime,
        threshold: i64,
    ) -> Result<Vec<IpRequestCount>> {
        let rows = sqlx::query(
            r#"
            SELECT remote_ip, COUNT(*) AS request_count
            FROM metric_snapshots
            WHERE ts >= ?
            GROUP BY remote_ip
            HAVING COUNT(*) > ?
            "#,
        )
        .bind(to_ts(since))
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(ip_count_from_row).collect())
    }

    /// Per-IP counts of 401 responses on URLs matching `url_pattern` (SQL
    /// `LIKE` syntax) since `since`, keeping IPs with at least `threshold`.
    pub async fn failed_auth_counts(
        &self,
        since: NaiveDateTime,
        url_pattern: &str,
        threshold: i64,
    ) -> Result<Vec<IpRequestCount>> {
        let rows = sqlx::query(
            r#"
            SELECT remote_ip, COUNT(*) AS request_count
            FROM metric_snapshots
            WHERE ts >= ? AND url LIKE ? AND status = 401
            GROUP BY remote_ip
            HAVING COUNT(*) >= ?
            "#,
        )
        .bind(to_ts(since))
        .bind(url_pattern)
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(ip_count_from_row).collect())
    }

    // ========================================================================
    // Hourly aggregations
    // ========================================================================

    /// Look up the aggregation row for a service-hour.
    pub async fn find_aggregation(
        &self,
        service: &str,
        hour_start: NaiveDateTime,
    ) -> Result<Option<HourlyMetricAggregation>> {
        let row = sqlx::query(&format!(
            "SELECT {AGGREGATION_COLUMNS} FROM hourly_metric_aggregations
             WHERE service = ? AND hour_start = ?"
        ))
        .bind(service)
        .bind(to_ts(hour_start))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(aggregation_from_row))
    }

    /// Insert an aggregation unless one already exists for its service-hour.
    ///
    /// # Returns
    ///
    /// `true` if the row was inserted, `false` if the unique key was taken.
    pub async fn insert_aggregation(&self, aggregation: &HourlyMetricAggregation) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO hourly_metric_aggregations (
                id, service, hour_start, total_requests, successful_requests,
                client_errors, server_errors, rate_limited_requests,
                avg_nginx_latency_ms, avg_backend_latency_ms,
                p95_nginx_latency_ms, p95_backend_latency_ms, unique_ips
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(service, hour_start) DO NOTHING
            "#,
        )
        .bind(aggregation.id)
        .bind(&aggregation.service)
        .bind(to_ts(aggregation.hour_start))
        .bind(aggregation.total_requests)
        .bind(aggregation.successful_requests)
        .bind(aggregation.client_errors)
        .bind(aggregation.server_errors)
        .bind(aggregation.rate_limited_requests)
        .bind(aggregation.avg_nginx_latency_ms)
        .bind(aggregation.avg_backend_latency_ms)
        .bind(aggregation.p95_nginx_latency_ms)
        .bind(aggregation.p95_backend_latency_ms)
        .bind(aggregation.unique_ips)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Most recent aggregations for a service, newest first.
    pub async fn aggregations_by_service(
        &self,
        service: &str,
        limit: i64,
    ) -> Result<Vec<HourlyMetricAggregation>> {
        let rows = sqlx::query(&format!(
            "SELECT {AGGREGATION_COLUMNS} FROM hourly_metric_aggregations
             WHERE service = ? ORDER BY hour_start DESC LIMIT ?"
        ))
        .bind(service)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(aggregation_from_row).collect())
    }

    /// Aggregations for a service with `start <= hour_start <= end`, newest first.
    pub async fn aggregations_in_range(
        &self,
        service: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<HourlyMetricAggregation>> {
        let rows = sqlx::query(&format!(
            "SELECT {AGGREGATION_COLUMNS} FROM hourly_metric_aggregations
             WHERE service = ? AND hour_start >= ? AND hour_start <= ?
             ORDER BY hour_start DESC"
        ))
        .bind(service)
        .bind(to_ts(start))
        .bind(to_ts(end))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(aggregation_from_row).collect())
    }

    // ========================================================================
    // Suspicious activities
    // ========================================================================

    /// Insert activities in a single transaction.
    pub async fn record_suspicious_activities(&self, activities: &[SuspiciousActivity]) -> Result<u64> {
        let mut tx = self.begin().await?;
        let inserted = insert_suspicious_activities(&mut tx, activities).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn recent_suspicious_activities(&self, limit: i64) -> Result<Vec<SuspiciousActivity>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM suspicious_activities ORDER BY ts DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(activity_from_row).collect()
    }

    pub async fn suspicious_activities_by_ip(
        &self,
        remote_ip: &str,
        limit: i64,
    ) -> Result<Vec<SuspiciousActivity>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM suspicious_activities
             WHERE remote_ip = ? ORDER BY ts DESC LIMIT ?"
        ))
        .bind(remote_ip)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(activity_from_row).collect()
    }

    pub async fn suspicious_activities_by_severity(
        &self,
        severity: Severity,
        limit: i64,
    ) -> Result<Vec<SuspiciousActivity>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM suspicious_activities
             WHERE severity = ? ORDER BY ts DESC LIMIT ?"
        ))
        .bind(severity.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(activity_from_row).collect()
    }

    /// Activities with `ts >= since`, newest first.
    pub async fn suspicious_activities_since(
        &self,
        since: NaiveDateTime,
        limit: i64,
    ) -> Result<Vec<SuspiciousActivity>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTIVITY_COLUMNS} FROM suspicious_activities
             WHERE ts >= ? ORDER BY ts DESC LIMIT ?"
        ))
        .bind(to_ts(since))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(activity_from_row).collect()
    }

    // ========================================================================
    // Rate limit violations
    // ========================================================================

    pub async fn recent_violations(&self, limit: i64) -> Result<Vec<RateLimitViolation>> {
        let rows = sqlx::query(&format!(
            "SELECT {VIOLATION_COLUMNS} FROM rate_limit_violations ORDER BY ts DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(violation_from_row).collect())
    }

    pub async fn violations_by_ip(&self, remote_ip: &str, limit: i64) -> Result<Vec<RateLimitViolation>> {
        let rows = sqlx::query(&format!(
            "SELECT {VIOLATION_COLUMNS} FROM rate_limit_violations
             WHERE remote_ip = ? ORDER BY ts DESC LIMIT ?"
        ))
        .bind(remote_ip)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(violation_from_row).collect())
    }

    pub async fn violations_by_service(
        &self,
        service: &str,
        limit: i64,
    ) -> Result<Vec<RateLimitViolation>> {
        let rows = sqlx::query(&format!(
            "SELECT {VIOLATION_COLUMNS} FROM rate_limit_violations
             WHERE service = ? ORDER BY ts DESC LIMIT ?"
        ))
        .bind(service)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(violation_from_row).collect())
    }

    // ========================================================================
    // Health snapshots
    // ========================================================================

    pub async fn latest_health(&self, limit: i64) -> Result<Vec<SystemHealthSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {HEALTH_COLUMNS} FROM system_health_snapshots ORDER BY ts DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(health_from_row).collect())
    }

    /// Health snapshots with `start <= ts <= end`, newest first.
    pub async fn health_in_range(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        limit: i64,
    ) -> Result<Vec<SystemHealthSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT {HEALTH_COLUMNS} FROM system_health_snapshots
             WHERE ts >= ? AND ts <= ? ORDER BY ts DESC LIMIT ?"
        ))
        .bind(to_ts(start))
        .bind(to_ts(end))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(health_from_row).collect())
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Delete every row of `class` strictly older than `cutoff`.
    ///
    /// # Returns
    ///
    /// The number of rows deleted.
    pub async fn purge_before(&self, class: DataClass, cutoff: NaiveDateTime) -> Result<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE {} < ?",
            class.table(),
            class.time_column()
        ))
        .bind(to_ts(cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Transactional writes
// ============================================================================

pub async fn insert_metric_snapshots(
    conn: &mut SqliteConnection,
    snapshots: &[MetricSnapshot],
) -> Result<u64> {
    let mut inserted = 0;

    for m in snapshots {
        let result = sqlx::query(&format!(
            "INSERT INTO metric_snapshots ({METRIC_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(m.id)
        .bind(to_ts(m.timestamp))
        .bind(&m.service)
        .bind(&m.remote_ip)
        .bind(&m.request_id)
        .bind(&m.method)
        .bind(&m.url)
        .bind(m.status)
        .bind(m.rate_limited)
        .bind(&m.user_agent)
        .bind(m.nginx_latency_ms)
        .bind(m.backend_latency_ms)
        .bind(&m.user_id)
        .execute(&mut *conn)
        .await?;

        inserted += result.rows_affected();
    }

    Ok(inserted)
}

pub async fn insert_rate_limit_violations(
    conn: &mut SqliteConnection,
    violations: &[RateLimitViolation],
) -> Result<u64> {
    let mut inserted = 0;

    for v in violations {
        let result = sqlx::query(&format!(
            "INSERT INTO rate_limit_violations ({VIOLATION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(v.id)
        .bind(to_ts(v.timestamp))
        .bind(&v.service)
        .bind(&v.remote_ip)
        .bind(v.violation_count)
        .bind(&v.user_id)
        .execute(&mut *conn)
        .await?;

        inserted += result.rows_affected();
    }

    Ok(inserted)
}

pub async fn insert_health_snapshot(
    conn: &mut SqliteConnection,
    snapshot: &SystemHealthSnapshot,
) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO system_health_snapshots ({HEALTH_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(snapshot.id)
    .bind(to_ts(snapshot.timestamp))
    .bind(snapshot.db_status.as_str())
    .bind(snapshot.db_latency_ms)
    .bind(snapshot.redis_status.as_str())
    .bind(snapshot.redis_latency_ms)
    .bind(snapshot.crypto_status.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn insert_suspicious_activities(
    conn: &mut SqliteConnection,
    activities: &[SuspiciousActivity],
) -> Result<u64> {
    let mut inserted = 0;

    for a in activities {
        let details = serde_json::to_string(&a.details.fields()?)?;

        let result = sqlx::query(&format!(
            "INSERT INTO suspicious_activities ({ACTIVITY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(a.id)
        .bind(to_ts(a.timestamp))
        .bind(&a.remote_ip)
        .bind(a.activity_type())
        .bind(a.severity.as_str())
        .bind(details)
        .execute(&mut *conn)
        .await?;

        inserted += result.rows_affected();
    }

    Ok(inserted)
}

// ============================================================================
// Row mapping
// ============================================================================

fn metric_from_row(row: &SqliteRow) -> MetricSnapshot {
    MetricSnapshot {
        id: row.get("id"),
        timestamp: from_ts(row.get("ts")),
        service: row.get("service"),
        remote_ip: row.get("remote_ip"),
        request_id: row.get("request_id"),
        method: row.get("method"),
        url: row.get("url"),
        status: row.get("status"),
        rate_limited: row.get("rate_limited"),
        user_agent: row.get("user_agent"),
        nginx_latency_ms: row.get("nginx_latency_ms"),
        backend_latency_ms: row.get("backend_latency_ms"),
        user_id: row.get("user_id"),
    }
}

fn aggregation_from_row(row: &SqliteRow) -> HourlyMetricAggregation {
    HourlyMetricAggregation {
        id: row.get("id"),
        service: row.get("service"),
        hour_start: from_ts(row.get("hour_start")),
        total_requests: row.get("total_requests"),
        successful_requests: row.get("successful_requests"),
        client_errors: row.get("client_errors"),
        server_errors: row.get("server_errors"),
        rate_limited_requests: row.get("rate_limited_requests"),
        avg_nginx_latency_ms: row.get("avg_nginx_latency_ms"),
        avg_backend_latency_ms: row.get("avg_backend_latency_ms"),
        p95_nginx_latency_ms: row.get("p95_nginx_latency_ms"),
        p95_backend_latency_ms: row.get("p95_backend_latency_ms"),
        unique_ips: row.get("unique_ips"),
    }
}

fn activity_from_row(row: &SqliteRow) -> Result<SuspiciousActivity> {
    let severity_label: String = row.get("severity");
    let severity = Severity::parse(&severity_label)
        .ok_or_else(|| MonitorError::InvalidRecord(format!("unknown severity '{severity_label}'")))?;

    let activity_type: String = row.get("activity_type");
    let details_json: String = row.get("details");
    let details = ActivityDetails::from_parts(&activity_type, serde_json::from_str(&details_json)?)?;

    Ok(SuspiciousActivity {
        id: row.get("id"),
        timestamp: from_ts(row.get("ts")),
        remote_ip: row.get("remote_ip"),
        severity,
        details,
    })
}

fn violation_from_row(row: &SqliteRow) -> RateLimitViolation {
    RateLimitViolation {
        id: row.get("id"),
        timestamp: from_ts(row.get("ts")),
        service: row.get("service"),
        remote_ip: row.get("remote_ip"),
        violation_count: row.get("violation_count"),
        user_id: row.get("user_id"),
    }
}

fn health_from_row(row: &SqliteRow) -> SystemHealthSnapshot {
    SystemHealthSnapshot {
        id: row.get("id"),
        timestamp: from_ts(row.get("ts")),
        db_status: HealthStatus::parse(row.get::<&str, _>("db_status")),
        db_latency_ms: row.get("db_latency_ms"),
        redis_status: HealthStatus::parse(row.get::<&str, _>("redis_status")),
        redis_latency_ms: row.get("redis_latency_ms"),
        crypto_status: HealthStatus::parse(row.get::<&str, _>("crypto_status")),
    }
}

fn ip_count_from_row(row: &SqliteRow) -> IpRequestCount {
    IpRequestCount {
        remote_ip: row.get("remote_ip"),
        count: row.get("request_count"),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{Duration, NaiveDateTime};

    use crate::model::{MetricSnapshot, new_id};

    /// A 200 GET against the gateway; tests override what they care about.
    pub fn snapshot(service: &str, remote_ip: &str, timestamp: NaiveDateTime) -> MetricSnapshot {
        MetricSnapshot {
            id: new_id(),
            timestamp,
            service: service.to_string(),
            remote_ip: remote_ip.to_string(),
            request_id: new_id().to_string(),
            method: "GET".to_string(),
            url: "/".to_string(),
            status: 200,
            rate_limited: false,
            user_agent: "test-agent".to_string(),
            nginx_latency_ms: 10.0,
            backend_latency_ms: Some(5.0),
            user_id: None,
        }
    }

    /// Current time truncated to whole seconds, matching stored precision.
    pub fn now() -> NaiveDateTime {
        let now = chrono::Utc::now().naive_utc();
        now - Duration::nanoseconds(i64::from(now.and_utc().timestamp_subsec_nanos()))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{now, snapshot};
    use super::*;
    use crate::model::new_id;
    use chrono::Duration;

    async fn setup_test_storage() -> Storage {
        Storage::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_query_metrics() {
        let storage = setup_test_storage().await;
        let now = now();

        let mut m = snapshot("kauth", "10.0.0.1", now);
        m.backend_latency_ms = None;
        m.user_id = Some("user-1".to_string());
        storage.record_metric_snapshots(&[m.clone()]).await.unwrap();

        let by_service = storage.metrics_by_service("kauth", 10).await.unwrap();
        assert_eq!(by_service, vec![m.clone()]);

        let by_user = storage.metrics_by_user("user-1", 10).await.unwrap();
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].backend_latency_ms, None);

        assert!(storage.metrics_by_ip("10.0.0.2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bucket_query_is_half_open() {
        let storage = setup_test_storage().await;
        let start = now() - Duration::hours(3);
        let end = start + Duration::hours(1);

        storage
            .record_metric_snapshots(&[
                snapshot("kauth", "10.0.0.1", start),
                snapshot("kauth", "10.0.0.1", end - Duration::seconds(1)),
                snapshot("kauth", "10.0.0.1", end),
                snapshot("ksysadmin", "10.0.0.1", start),
            ])
            .await
            .unwrap();

        let bucket = storage.metrics_in_bucket("kauth", start, end).await.unwrap();
        assert_eq!(bucket.len(), 2);
        assert!(bucket.iter().all(|m| m.timestamp < end));
    }

    #[tokio::test]
    async fn test_error_and_rate_limited_subsets() {
        let storage = setup_test_storage().await;
        let now = now();

        let ok = snapshot("kauth", "10.0.0.1", now);
        let mut not_found = snapshot("kauth", "10.0.0.1", now);
        not_found.status = 404;
        let mut limited = snapshot("kauth", "10.0.0.2", now);
        limited.status = 429;
        limited.rate_limited = true;

        storage
            .record_metric_snapshots(&[ok, not_found, limited])
            .await
            .unwrap();

        assert_eq!(storage.error_metrics(10).await.unwrap().len(), 2);
        let limited = storage.rate_limited_metrics(10).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].remote_ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_error_counts_by_ip() {
        let storage = setup_test_storage().await;
        let now = now();

        let mut batch = Vec::new();
        for i in 0..10 {
            let mut m = snapshot("kauth", "10.0.0.1", now);
            m.status = if i < 7 { 500 } else { 200 };
            batch.push(m);
        }
        batch.push(snapshot("kauth", "10.0.0.2", now));
        storage.record_metric_snapshots(&batch).await.unwrap();

        let counts = storage
            .error_counts_by_ip(now - Duration::minutes(5), 10)
            .await
            .unwrap();

        assert_eq!(
            counts,
            vec![IpErrorCounts {
                remote_ip: "10.0.0.1".to_string(),
                total: 10,
                errors: 7,
            }]
        );
    }

    #[tokio::test]
    async fn test_aggregation_unique_per_service_hour() {
        let storage = setup_test_storage().await;
        let hour = from_ts(1_700_000_000 - 1_700_000_000 % 3600);

        let aggregation = HourlyMetricAggregation {
            id: new_id(),
            service: "kauth".to_string(),
            hour_start: hour,
            total_requests: 3,
            successful_requests: 3,
            client_errors: 0,
            server_errors: 0,
            rate_limited_requests: 0,
            avg_nginx_latency_ms: 1.5,
            avg_backend_latency_ms: 1.0,
            p95_nginx_latency_ms: 2.0,
            p95_backend_latency_ms: 1.0,
            unique_ips: 1,
        };

        assert!(storage.insert_aggregation(&aggregation).await.unwrap());

        let duplicate = HourlyMetricAggregation {
            id: new_id(),
            total_requests: 99,
            ..aggregation.clone()
        };
        assert!(!storage.insert_aggregation(&duplicate).await.unwrap());

        let stored = storage.find_aggregation("kauth", hour).await.unwrap().unwrap();
        assert_eq!(stored, aggregation);
    }

    #[tokio::test]
    async fn test_suspicious_activity_round_trip() {
        let storage = setup_test_storage().await;
        let activity = SuspiciousActivity::new(
            now(),
            "10.0.0.9",
            Severity::Critical,
            ActivityDetails::FailedAuthAttempts {
                failed_attempts: 25,
                time_window_minutes: 15,
                threshold: 5,
            },
        );

        storage
            .record_suspicious_activities(&[activity.clone()])
            .await
            .unwrap();

        let by_severity = storage
            .suspicious_activities_by_severity(Severity::Critical, 10)
            .await
            .unwrap();
        assert_eq!(by_severity, vec![activity.clone()]);

        let by_ip = storage.suspicious_activities_by_ip("10.0.0.9", 10).await.unwrap();
        assert_eq!(by_ip.len(), 1);
        assert!(storage
            .suspicious_activities_by_severity(Severity::Low, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_purge_before_is_strict() {
        let storage = setup_test_storage().await;
        let cutoff = now() - Duration::days(1);

        storage
            .record_metric_snapshots(&[
                snapshot("kauth", "10.0.0.1", cutoff - Duration::seconds(1)),
                snapshot("kauth", "10.0.0.1", cutoff),
            ])
            .await
            .unwrap();

        let deleted = storage
            .purge_before(DataClass::MetricSnapshots, cutoff)
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(storage.metrics_by_service("kauth", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ping() {
        let storage = setup_test_storage().await;
        assert!(storage.ping().await.is_ok());
    }
}
