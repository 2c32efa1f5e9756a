//! Active health probes for the datastore, the counter store and the crypto
//! module, plus the summary computed over a window of snapshots.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::counters::CounterStore;
use crate::crypto::Cipher;
use crate::error::{MonitorError, Result};
use crate::model::{HealthStatus, SystemHealthSnapshot, new_id, round2};
use crate::storage::Storage;

const CRYPTO_PROBE_TEXT: &[u8] = b"health_check_test";
const CRYPTO_PROBE_CONTEXT: &str = "health_check";

/// Availability below which a dependency counts as degraded.
const DEGRADED_BELOW: f64 = 0.95;

/// Availability below which a dependency counts as unhealthy.
const UNHEALTHY_BELOW: f64 = 0.5;

pub struct HealthProber {
    storage: Storage,
    counters: Arc<dyn CounterStore>,
    cipher: Arc<dyn Cipher>,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(
        storage: Storage,
        counters: Arc<dyn CounterStore>,
        cipher: Arc<dyn Cipher>,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            counters,
            cipher,
            timeout,
        }
    }

    /// Probe every dependency once.
    ///
    /// Never fails: a probe that errors or times out is reported unhealthy
    /// with the latency measured up to that point.
    pub async fn poll(&self) -> SystemHealthSnapshot {
        let (db_status, db_latency_ms) = self.probe("database", self.storage.ping()).await;
        let (redis_status, redis_latency_ms) = self.probe("redis", self.counters.ping()).await;
        let (crypto_status, _) = self
            .probe("crypto", async { self.crypto_round_trip() })
            .await;

        info!(
            db = db_status.as_str(),
            db_latency_ms,
            redis = redis_status.as_str(),
            redis_latency_ms,
            crypto = crypto_status.as_str(),
            "Health poll completed"
        );

        SystemHealthSnapshot {
            id: new_id(),
            timestamp: Utc::now().naive_utc(),
            db_status,
            db_latency_ms,
            redis_status,
            redis_latency_ms,
            crypto_status,
        }
    }

    async fn probe<F>(&self, dependency: &'static str, check: F) -> (HealthStatus, f64)
    where
        F: Future<Output = Result<()>>,
    {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, check).await;
        let latency_ms = round2(started.elapsed().as_secs_f64() * 1000.0);

        let status = match outcome {
            Ok(Ok(())) => HealthStatus::Healthy,
            Ok(Err(e)) => {
                warn!(dependency, error = %e, "Health probe failed");
                HealthStatus::Unhealthy
            }
            Err(_) => {
                warn!(dependency, timeout = ?self.timeout, "Health probe timed out");
                HealthStatus::Unhealthy
            }
        };

        (status, latency_ms)
    }

    fn crypto_round_trip(&self) -> Result<()> {
        let sealed = self.cipher.encrypt(CRYPTO_PROBE_TEXT, CRYPTO_PROBE_CONTEXT)?;
        let opened = self.cipher.decrypt(&sealed, CRYPTO_PROBE_CONTEXT)?;

        if opened != CRYPTO_PROBE_TEXT {
            return Err(MonitorError::Crypto(
                "round trip returned different plaintext".to_string(),
            ));
        }
        Ok(())
    }
}

/// Overall health across a window of snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Summary of a window of health snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthAnalysis {
    pub status: OverallHealth,
    /// Percentage of snapshots with a healthy database, 2 decimals.
    pub db_availability: f64,
    pub redis_availability: f64,
    pub avg_db_latency: f64,
    pub avg_redis_latency: f64,
    pub total_snapshots: usize,
}

/// Summarize availability and latency over `snapshots`.
///
/// The status is `unhealthy` if either dependency was healthy in under half
/// the snapshots, `degraded` if under 95%, and `unknown` for an empty window.
pub fn analyze_health(snapshots: &[SystemHealthSnapshot]) -> HealthAnalysis {
    if snapshots.is_empty() {
        return HealthAnalysis {
            status: OverallHealth::Unknown,
            db_availability: 0.0,
            redis_availability: 0.0,
            avg_db_latency: 0.0,
            avg_redis_latency: 0.0,
            total_snapshots: 0,
        };
    }

    let total = snapshots.len() as f64;
    let share = |healthy: usize| healthy as f64 / total;

    let db = share(
        snapshots
            .iter()
            .filter(|s| s.db_status == HealthStatus::Healthy)
            .count(),
    );
    let redis = share(
        snapshots
            .iter()
            .filter(|s| s.redis_status == HealthStatus::Healthy)
            .count(),
    );

    let worst = db.min(redis);
    let status = if worst < UNHEALTHY_BELOW {
        OverallHealth::Unhealthy
    } else if worst < DEGRADED_BELOW {
        OverallHealth::Degraded
    } else {
        OverallHealth::Healthy
    };

    HealthAnalysis {
        status,
        db_availability: round2(db * 100.0),
        redis_availability: round2(redis * 100.0),
        avg_db_latency: round2(snapshots.iter().map(|s| s.db_latency_ms).sum::<f64>() / total),
        avg_redis_latency: round2(
            snapshots.iter().map(|s| s.redis_latency_ms).sum::<f64>() / total,
        ),
        total_snapshots: snapshots.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_MASTER_KEY_LEN;
    use crate::counters::RedisCounterStore;
    use crate::counters::test_support::MemoryCounterStore;
    use crate::crypto::AesGcmCipher;
    use async_trait::async_trait;

    struct BrokenCipher;

    impl Cipher for BrokenCipher {
        fn encrypt(&self, plaintext: &[u8], _context: &str) -> Result<Vec<u8>> {
            Ok(plaintext.to_vec())
        }

        fn decrypt(&self, _ciphertext: &[u8], _context: &str) -> Result<Vec<u8>> {
            Ok(b"something else".to_vec())
        }
    }

    struct HangingStore;

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn scan_keys(&self, _pattern: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn get(&self, _key: &str) -> Result<Option<i64>> {
            Ok(None)
        }
        async fn ttl(&self, _key: &str) -> Result<i64> {
            Ok(-2)
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn ping(&self) -> Result<()> {
            std::future::pending().await
        }
    }

    fn cipher() -> Arc<dyn Cipher> {
        Arc::new(AesGcmCipher::new(&"k".repeat(MIN_MASTER_KEY_LEN)).unwrap())
    }

    fn snapshot(db: HealthStatus, redis: HealthStatus, latency: f64) -> SystemHealthSnapshot {
        SystemHealthSnapshot {
            id: new_id(),
            timestamp: Utc::now().naive_utc(),
            db_status: db,
            db_latency_ms: latency,
            redis_status: redis,
            redis_latency_ms: latency,
            crypto_status: HealthStatus::Healthy,
        }
    }

    #[tokio::test]
    async fn test_all_dependencies_healthy() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let prober = HealthProber::new(
            storage,
            Arc::new(MemoryCounterStore::default()),
            cipher(),
            Duration::from_secs(5),
        );

        let snapshot = prober.poll().await;
        assert_eq!(snapshot.db_status, HealthStatus::Healthy);
        assert_eq!(snapshot.redis_status, HealthStatus::Healthy);
        assert_eq!(snapshot.crypto_status, HealthStatus::Healthy);
        assert!(snapshot.db_latency_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_failures_reported_unhealthy() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let prober = HealthProber::new(
            storage,
            Arc::new(MemoryCounterStore::failing()),
            Arc::new(BrokenCipher),
            Duration::from_secs(5),
        );

        let snapshot = prober.poll().await;
        assert_eq!(snapshot.db_status, HealthStatus::Healthy);
        assert_eq!(snapshot.redis_status, HealthStatus::Unhealthy);
        assert_eq!(snapshot.crypto_status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_closed_pool_is_unhealthy() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        storage.close().await;
        let prober = HealthProber::new(
            storage,
            Arc::new(MemoryCounterStore::default()),
            cipher(),
            Duration::from_secs(5),
        );

        assert_eq!(prober.poll().await.db_status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_unhealthy() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let prober = HealthProber::new(
            storage,
            Arc::new(HangingStore),
            cipher(),
            Duration::from_millis(50),
        );

        let snapshot = prober.poll().await;
        assert_eq!(snapshot.redis_status, HealthStatus::Unhealthy);
        assert!(snapshot.redis_latency_ms >= 50.0);
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_unhealthy() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let counters = Arc::new(RedisCounterStore::new("redis://127.0.0.1:1").unwrap());
        let prober = HealthProber::new(storage, counters, cipher(), Duration::from_secs(2));

        let snapshot = prober.poll().await;
        assert_eq!(snapshot.redis_status, HealthStatus::Unhealthy);
        assert_eq!(snapshot.db_status, HealthStatus::Healthy);
    }

    #[test]
    fn test_analyze_empty_is_unknown() {
        let analysis = analyze_health(&[]);
        assert_eq!(analysis.status, OverallHealth::Unknown);
        assert_eq!(analysis.total_snapshots, 0);
    }

    #[test]
    fn test_analyze_thresholds() {
        use HealthStatus::{Healthy, Unhealthy};

        let all_good: Vec<_> = (0..20).map(|_| snapshot(Healthy, Healthy, 2.0)).collect();
        let analysis = analyze_health(&all_good);
        assert_eq!(analysis.status, OverallHealth::Healthy);
        assert_eq!(analysis.db_availability, 100.0);
        assert_eq!(analysis.avg_db_latency, 2.0);

        // 19 of 20 is exactly 95%
        let mut one_bad = all_good.clone();
        one_bad[0].redis_status = Unhealthy;
        assert_eq!(analyze_health(&one_bad).status, OverallHealth::Healthy);

        let mut two_bad = one_bad.clone();
        two_bad[1].redis_status = Unhealthy;
        let analysis = analyze_health(&two_bad);
        assert_eq!(analysis.status, OverallHealth::Degraded);
        assert_eq!(analysis.redis_availability, 90.0);

        let mostly_down: Vec<_> = (0..4)
            .map(|i| snapshot(if i == 0 { Healthy } else { Unhealthy }, Healthy, 1.0))
            .collect();
        let analysis = analyze_health(&mostly_down);
        assert_eq!(analysis.status, OverallHealth::Unhealthy);
        assert_eq!(analysis.db_availability, 25.0);
    }
}
