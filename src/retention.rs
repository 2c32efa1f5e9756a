//! Age-based purging of monitoring data.
//!
//! Raw classes (metric snapshots, health snapshots, suspicious activities and
//! rate-limit violations) are kept for N days. Hourly aggregations are kept
//! four times as long.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::storage::{DataClass, Storage};

/// Hourly aggregations outlive raw data by this factor.
pub const AGGREGATION_RETENTION_MULTIPLIER: i64 = 4;

/// Outcome of a full cleanup run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub retention_days: u32,
    /// Rows deleted per class, keyed by class label.
    pub deleted: BTreeMap<&'static str, u64>,
    pub total_deleted: u64,
    /// Classes whose delete failed; they report zero in `deleted`.
    pub failed: Vec<&'static str>,
}

/// How long rows of `class` are kept given the raw retention in days.
pub fn horizon(class: DataClass, retention_days: u32) -> Duration {
    let days = i64::from(retention_days);
    match class {
        DataClass::HourlyAggregations => Duration::days(days * AGGREGATION_RETENTION_MULTIPLIER),
        _ => Duration::days(days),
    }
}

#[derive(Clone)]
pub struct RetentionEngine {
    storage: Storage,
    retention_days: u32,
}

impl RetentionEngine {
    pub fn new(storage: Storage, retention_days: u32) -> Self {
        Self {
            storage,
            retention_days,
        }
    }

    /// Purge every class. `retention_days` overrides the configured value
    /// when given and non-zero.
    pub async fn run_full_cleanup(&self, retention_days: Option<u32>) -> CleanupReport {
        self.run_full_cleanup_at(Utc::now().naive_utc(), retention_days)
            .await
    }

    /// Purge every class relative to `now`.
    ///
    /// Cutoffs are computed once up front so every class is measured against
    /// the same instant. Each class is purged on its own; a failure is logged
    /// and the remaining classes still run.
    pub async fn run_full_cleanup_at(
        &self,
        now: NaiveDateTime,
        retention_days: Option<u32>,
    ) -> CleanupReport {
        let days = retention_days
            .filter(|d| *d > 0)
            .unwrap_or(self.retention_days);

        let cutoffs: Vec<(DataClass, NaiveDateTime)> = DataClass::ALL
            .iter()
            .map(|class| (*class, now - horizon(*class, days)))
            .collect();

        let mut deleted = BTreeMap::new();
        let mut failed = Vec::new();

        for (class, cutoff) in cutoffs {
            let count = match self.storage.purge_before(class, cutoff).await {
                Ok(count) => {
                    if count > 0 {
                        info!(class = class.label(), deleted = count, %cutoff, "Purged old rows");
                    }
                    count
                }
                Err(e) => {
                    error!(class = class.label(), error = %e, "Retention cleanup failed");
                    failed.push(class.label());
                    0
                }
            };
            deleted.insert(class.label(), count);
        }

        let total_deleted: u64 = deleted.values().sum();
        info!(total_deleted, retention_days = days, "Cleanup completed");

        CleanupReport {
            retention_days: days,
            deleted,
            total_deleted,
            failed,
        }
    }
}
