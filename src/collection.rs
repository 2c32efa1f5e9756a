//! One collection cycle: tail the access log, scan rate-limit counters and
//! probe dependencies, then persist everything in a single transaction.

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{error, info};

use crate::collectors::{AccessLogTailer, Collection, HealthProber, ViolationScanner};
use crate::error::Result;
use crate::model::{MetricSnapshot, RateLimitViolation, SystemHealthSnapshot};
use crate::storage::{self, Storage};

/// Per-source counts from one committed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub metrics: u64,
    pub violations: u64,
    pub health_snapshots: u64,
    /// Sources that could not be read this cycle.
    pub failed_sources: Vec<&'static str>,
}

pub struct CollectionOrchestrator {
    storage: Storage,
    tailer: AccessLogTailer,
    scanner: ViolationScanner,
    prober: HealthProber,
    violation_threshold: i64,
}

impl CollectionOrchestrator {
    pub fn new(
        storage: Storage,
        tailer: AccessLogTailer,
        scanner: ViolationScanner,
        prober: HealthProber,
        violation_threshold: i64,
    ) -> Self {
        Self {
            storage,
            tailer,
            scanner,
            prober,
            violation_threshold,
        }
    }

    /// Run one cycle.
    ///
    /// Collectors run in order (log, counters, health) before the transaction
    /// opens. If persisting fails the transaction is rolled back, the tailer
    /// offset stays where it was and the error is returned; the same log
    /// lines are read again next cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let batch = self.tailer.read_batch().await;
        let violations = self.scanner.collect_violations(self.violation_threshold).await;
        let health = self.prober.poll().await;

        let mut failed_sources = Vec::new();
        if batch.records.is_failed() {
            failed_sources.push("access_log");
        }
        if violations.is_failed() {
            failed_sources.push("rate_limit_counters");
        }

        let mut tx = self.storage.begin().await?;

        match persist(&mut tx, &batch.records, &violations, &health).await {
            Ok((metrics, violations)) => {
                tx.commit().await?;
                self.tailer.commit_offset(batch.end_offset);

                let report = CycleReport {
                    metrics,
                    violations,
                    health_snapshots: 1,
                    failed_sources,
                };
                info!(
                    metrics = report.metrics,
                    violations = report.violations,
                    failed_sources = ?report.failed_sources,
                    "Collection cycle committed"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Collection cycle failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    error!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn persist(
    conn: &mut SqliteConnection,
    metrics: &Collection<MetricSnapshot>,
    violations: &Collection<RateLimitViolation>,
    health: &SystemHealthSnapshot,
) -> Result<(u64, u64)> {
    let metric_count = storage::insert_metric_snapshots(conn, metrics.items()).await?;
    let violation_count = storage::insert_rate_limit_violations(conn, violations.items()).await?;
    storage::insert_health_snapshot(conn, health).await?;
    Ok((metric_count, violation_count))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::MIN_MASTER_KEY_LEN;
    use crate::counters::CounterStore;
    use crate::counters::test_support::MemoryCounterStore;
    use crate::crypto::AesGcmCipher;

    const LINE: &str = r#"{"timestamp":"2025-01-15T10:30:00+00:00","url":"/api/payment/charge","remote_ip":"10.0.0.7","request_id":"r","method":"POST","status":201,"rate_limited":false,"user_agent":"ua","nginx_latency_s":0.2,"backend_latency_s":0.1,"user_id":"u-1"}"#;

    async fn orchestrator(log: &NamedTempFile, counters: Arc<dyn CounterStore>) -> (Storage, CollectionOrchestrator) {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let cipher = Arc::new(AesGcmCipher::new(&"k".repeat(MIN_MASTER_KEY_LEN)).unwrap());
        let prober = HealthProber::new(storage.clone(), counters.clone(), cipher, Duration::from_secs(5));

        let orchestrator = CollectionOrchestrator::new(
            storage.clone(),
            AccessLogTailer::new(log.path()),
            ViolationScanner::new(counters),
            prober,
            5,
        );
        (storage, orchestrator)
    }

    #[tokio::test]
    async fn test_cycle_persists_all_sources() {
        let mut log = NamedTempFile::new().unwrap();
        writeln!(log, "{LINE}").unwrap();
        writeln!(log, "{LINE}").unwrap();

        let counters = Arc::new(MemoryCounterStore::with(&[("rate_limit:kauth:10.0.0.9:login", 8, 60)]));
        let (storage, mut orchestrator) = orchestrator(&log, counters).await;

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.metrics, 2);
        assert_eq!(report.violations, 1);
        assert_eq!(report.health_snapshots, 1);
        assert!(report.failed_sources.is_empty());

        let stored = storage.metrics_by_service("ksyspayment", 10).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].user_id.as_deref(), Some("u-1"));
        assert_eq!(storage.violations_by_ip("10.0.0.9", 10).await.unwrap().len(), 1);
        assert_eq!(storage.latest_health(10).await.unwrap().len(), 1);

        // Nothing new on the second cycle but health is still recorded
        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.metrics, 0);
        assert_eq!(storage.latest_health(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_source_still_commits_others() {
        let mut log = NamedTempFile::new().unwrap();
        writeln!(log, "{LINE}").unwrap();

        let (storage, mut orchestrator) = orchestrator(&log, Arc::new(MemoryCounterStore::failing())).await;

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.metrics, 1);
        assert_eq!(report.failed_sources, vec!["rate_limit_counters"]);

        let health = storage.latest_health(1).await.unwrap();
        assert_eq!(health[0].redis_status, crate::model::HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_offset() {
        let mut log = NamedTempFile::new().unwrap();
        writeln!(log, "{LINE}").unwrap();

        let (storage, mut orchestrator) = orchestrator(&log, Arc::new(MemoryCounterStore::default())).await;
        storage.close().await;

        assert!(orchestrator.run_cycle().await.is_err());
        assert_eq!(orchestrator.tailer.offset(), 0);
    }

    #[tokio::test]
    async fn test_late_insert_failure_rolls_back_earlier_rows() {
        let mut log = NamedTempFile::new().unwrap();
        writeln!(log, "{LINE}").unwrap();
        writeln!(log, "{LINE}").unwrap();

        let counters = Arc::new(MemoryCounterStore::with(&[("rate_limit:kauth:10.0.0.9:login", 8, 60)]));
        let (storage, mut orchestrator) = orchestrator(&log, counters).await;

        // Metrics and violations insert fine; the health snapshot, written last, fails
        let mut tx = storage.begin().await.unwrap();
        sqlx::query("DROP TABLE system_health_snapshots")
            .execute(&mut *tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(orchestrator.run_cycle().await.is_err());
        assert_eq!(orchestrator.tailer.offset(), 0);
        assert!(storage.metrics_by_service("ksyspayment", 10).await.unwrap().is_empty());
        assert!(storage.violations_by_ip("10.0.0.9", 10).await.unwrap().is_empty());
    }
}
