//! On-demand runs of the periodic engines.
//!
//! These back the `/aggregation/trigger/*` endpoints. Failures come back as a
//! [`TriggerFailure`] with a fixed message; the underlying error is logged
//! and never returned to the caller.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::aggregation::{Aggregator, truncate_to_hour};
use crate::model::TRACKED_SERVICES;
use crate::retention::RetentionEngine;
use crate::security::SecurityAnalyzer;

const SUCCESS: &str = "success";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{detail}")]
pub struct TriggerFailure {
    pub status: &'static str,
    pub detail: &'static str,
}

impl TriggerFailure {
    pub fn new(detail: &'static str) -> Self {
        Self {
            status: "error",
            detail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourlyTriggerResponse {
    pub status: &'static str,
    pub hour: NaiveDateTime,
    /// Service-hours that now have a stored summary.
    pub services_aggregated: u32,
    pub details: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityTriggerResponse {
    pub status: &'static str,
    pub suspicious_activities_detected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupTriggerResponse {
    pub status: &'static str,
    pub total_deleted: u64,
    pub details: BTreeMap<&'static str, u64>,
}

/// Aggregate one hour for every tracked service. Defaults to the previous
/// completed hour; a given hour is truncated to its start.
pub async fn trigger_hourly_aggregation(
    aggregator: &Aggregator,
    hour: Option<NaiveDateTime>,
) -> Result<HourlyTriggerResponse, TriggerFailure> {
    let hour = match hour {
        Some(hour) => truncate_to_hour(hour),
        None => truncate_to_hour(Utc::now().naive_utc()) - Duration::hours(1),
    };

    let run = aggregator
        .aggregate_multiple_hours(&TRACKED_SERVICES, hour, hour + Duration::hours(1))
        .await;

    if run.failures > 0 {
        error!(%hour, failures = run.failures, "Triggered aggregation failed");
        return Err(TriggerFailure::new("hourly aggregation failed"));
    }

    let services_aggregated = run.succeeded.values().sum();
    info!(%hour, services_aggregated, "Triggered aggregation completed");

    Ok(HourlyTriggerResponse {
        status: SUCCESS,
        hour,
        services_aggregated,
        details: run.succeeded,
    })
}

pub async fn trigger_security_analysis(
    analyzer: &SecurityAnalyzer,
) -> Result<SecurityTriggerResponse, TriggerFailure> {
    match analyzer.run_analysis().await {
        Ok(detected) => Ok(SecurityTriggerResponse {
            status: SUCCESS,
            suspicious_activities_detected: detected,
        }),
        Err(e) => {
            error!(error = %e, "Triggered security analysis failed");
            Err(TriggerFailure::new("security analysis failed"))
        }
    }
}

/// Purge every class, optionally overriding the retention period in days.
pub async fn trigger_cleanup(
    engine: &RetentionEngine,
    retention_days: Option<u32>,
) -> Result<CleanupTriggerResponse, TriggerFailure> {
    let report = engine.run_full_cleanup(retention_days).await;

    if !report.failed.is_empty() {
        error!(failed = ?report.failed, "Triggered cleanup failed");
        return Err(TriggerFailure::new("cleanup failed"));
    }

    Ok(CleanupTriggerResponse {
        status: SUCCESS,
        total_deleted: report.total_deleted,
        details: report.deleted,
    })
}
