//! Hourly aggregation of raw metric snapshots.
//!
//! Each `(service, hour)` is summarized at most once. A summary is built only
//! from snapshots with `hour_start <= timestamp < hour_start + 1h`, and once
//! written it is never recomputed, so re-running an hour is a no-op.
//!
//! # Percentiles
//!
//! p95 uses the nearest-rank rule: sort ascending and take the value at index
//! `floor(n * 0.95)`, clamped to the last element. Requests that never
//! reached a backend are left out of the backend mean and percentile.

use std::collections::{BTreeMap, HashSet};

use chrono::{Duration, NaiveDateTime};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::model::{HourlyMetricAggregation, MetricSnapshot, new_id, round2};
use crate::storage::{Storage, from_ts, to_ts};

/// Result of [`Aggregator::aggregate_and_persist`].
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationOutcome {
    /// A new summary was computed and stored.
    Created(HourlyMetricAggregation),
    /// A summary for this service-hour was already stored.
    AlreadyExists,
    /// No snapshots fell in the hour; nothing was stored.
    NoData,
}

impl AggregationOutcome {
    /// Whether the hour now has a stored summary.
    pub fn is_success(&self) -> bool {
        !matches!(self, AggregationOutcome::NoData)
    }
}

/// Result of [`Aggregator::aggregate_multiple_hours`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationRun {
    /// Per service, the number of hours that now have a stored summary.
    pub succeeded: BTreeMap<String, u32>,
    /// Service-hours that could not be processed.
    pub failures: u32,
}

/// Truncate a timestamp to the start of its hour.
pub fn truncate_to_hour(timestamp: NaiveDateTime) -> NaiveDateTime {
    let ts = to_ts(timestamp);
    from_ts(ts - ts.rem_euclid(3600))
}

/// Nearest-rank 95th percentile. Returns 0.0 for an empty slice.
pub fn p95(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let index = (sorted.len() * 95 / 100).min(sorted.len() - 1);
    sorted[index]
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Build the summary for one service-hour from its snapshots.
///
/// Returns `None` for an empty slice.
pub fn summarize(
    service: &str,
    hour_start: NaiveDateTime,
    snapshots: &[MetricSnapshot],
) -> Option<HourlyMetricAggregation> {
    if snapshots.is_empty() {
        return None;
    }

    let count = |pred: fn(&MetricSnapshot) -> bool| {
        snapshots.iter().filter(|m| pred(m)).count() as i64
    };

    let nginx: Vec<f64> = snapshots.iter().map(|m| m.nginx_latency_ms).collect();
    let backend: Vec<f64> = snapshots.iter().filter_map(|m| m.backend_latency_ms).collect();
    let unique_ips: HashSet<&str> = snapshots.iter().map(|m| m.remote_ip.as_str()).collect();

    Some(HourlyMetricAggregation {
        id: new_id(),
        service: service.to_string(),
        hour_start,
        total_requests: snapshots.len() as i64,
        successful_requests: count(|m| (200..400).contains(&m.status)),
        client_errors: count(|m| (400..500).contains(&m.status)),
        server_errors: count(|m| m.status >= 500),
        rate_limited_requests: count(|m| m.rate_limited),
        avg_nginx_latency_ms: round2(mean(&nginx)),
        avg_backend_latency_ms: round2(mean(&backend)),
        p95_nginx_latency_ms: round2(p95(&nginx)),
        p95_backend_latency_ms: round2(p95(&backend)),
        unique_ips: unique_ips.len() as i64,
    })
}

/// Computes and stores hourly summaries.
#[derive(Clone)]
pub struct Aggregator {
    storage: Storage,
}

impl Aggregator {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Compute the summary for a service-hour without storing it.
    ///
    /// `hour_start` is truncated to the hour first. Returns `None` when no
    /// snapshots fall in the hour.
    pub async fn aggregate_hour(
        &self,
        service: &str,
        hour_start: NaiveDateTime,
    ) -> Result<Option<HourlyMetricAggregation>> {
        let hour_start = truncate_to_hour(hour_start);
        let hour_end = hour_start + Duration::hours(1);

        let snapshots = self
            .storage
            .metrics_in_bucket(service, hour_start, hour_end)
            .await?;

        let aggregation = summarize(service, hour_start, &snapshots);
        match &aggregation {
            Some(a) => debug!(
                service,
                hour = %hour_start,
                total_requests = a.total_requests,
                unique_ips = a.unique_ips,
                "Aggregated hour"
            ),
            None => debug!(service, hour = %hour_start, "No metrics for hour"),
        }
        Ok(aggregation)
    }

    /// Compute and store the summary for a service-hour unless one exists.
    pub async fn aggregate_and_persist(
        &self,
        service: &str,
        hour_start: NaiveDateTime,
    ) -> Result<AggregationOutcome> {
        let hour_start = truncate_to_hour(hour_start);

        if self.storage.find_aggregation(service, hour_start).await?.is_some() {
            debug!(service, hour = %hour_start, "Aggregation already exists");
            return Ok(AggregationOutcome::AlreadyExists);
        }

        let Some(aggregation) = self.aggregate_hour(service, hour_start).await? else {
            return Ok(AggregationOutcome::NoData);
        };

        // A concurrent run may have stored the row since the check above
        if !self.storage.insert_aggregation(&aggregation).await? {
            return Ok(AggregationOutcome::AlreadyExists);
        }

        info!(
            service,
            hour = %hour_start,
            total_requests = aggregation.total_requests,
            "Persisted hourly aggregation"
        );
        Ok(AggregationOutcome::Created(aggregation))
    }

    /// Aggregate every hour in `[start_hour, end_hour)` for every service.
    ///
    /// A failure for one service-hour is logged and counted in
    /// [`AggregationRun::failures`]; the remaining service-hours still run.
    pub async fn aggregate_multiple_hours(
        &self,
        services: &[&str],
        start_hour: NaiveDateTime,
        end_hour: NaiveDateTime,
    ) -> AggregationRun {
        let start_hour = truncate_to_hour(start_hour);
        let end_hour = truncate_to_hour(end_hour);

        let mut run = AggregationRun {
            succeeded: services.iter().map(|s| (s.to_string(), 0)).collect(),
            failures: 0,
        };

        let mut hour = start_hour;
        while hour < end_hour {
            for service in services {
                match self.aggregate_and_persist(service, hour).await {
                    Ok(outcome) if outcome.is_success() => {
                        *run.succeeded.entry(service.to_string()).or_default() += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(service, hour = %hour, error = %e, "Aggregation failed");
                        run.failures += 1;
                    }
                }
            }
            hour += Duration::hours(1);
        }

        info!(
            start = %start_hour,
            end = %end_hour,
            succeeded = ?run.succeeded,
            failures = run.failures,
            "Aggregation run completed"
        );
        run
    }
}
