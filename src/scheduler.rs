//! Background loops driving the pipeline.
//!
//! Each loop owns one [`Job`] and runs it on a [`Cadence`]. A loop moves
//! through `Idle -> Running -> Sleeping -> Running -> ...` until its
//! cancellation token fires, then settles in `Cancelled`.
//!
//! Cancelling interrupts a sleep but never a running job: the in-flight cycle
//! finishes and no new one starts. [`Scheduler::shutdown`] waits for every
//! loop to reach that point, so the caller can close the shared pool after it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregation::{Aggregator, truncate_to_hour};
use crate::collection::CollectionOrchestrator;
use crate::collectors::ViolationScanner;
use crate::error::{MonitorError, Result};
use crate::model::TRACKED_SERVICES;
use crate::retention::RetentionEngine;
use crate::security::SecurityAnalyzer;

/// Default delays for the pipeline loops.
pub const COLLECTION_RETRY: Duration = Duration::from_secs(60);
pub const AGGREGATION_RETRY: Duration = Duration::from_secs(5 * 60);
pub const SECURITY_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const SECURITY_RETRY: Duration = Duration::from_secs(5 * 60);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const CLEANUP_RETRY: Duration = Duration::from_secs(60 * 60);

/// One unit of periodic work.
#[async_trait]
pub trait Job: Send + 'static {
    fn name(&self) -> &'static str;

    async fn run(&mut self) -> Result<()>;
}

/// When a loop runs its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Immediately, then every interval after each run completes.
    Every(Duration),
    /// At each wall-clock hour boundary, starting with the next one.
    Hourly,
}

impl Cadence {
    fn initial_delay(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Cadence::Every(_) => Duration::ZERO,
            Cadence::Hourly => until_next_hour(now),
        }
    }

    fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Cadence::Every(interval) => *interval,
            Cadence::Hourly => until_next_hour(now),
        }
    }
}

/// Time from `now` to the next hour boundary. Exactly on a boundary, the
/// next one is a full hour away.
pub fn until_next_hour(now: DateTime<Utc>) -> Duration {
    let into_hour = Duration::from_secs(now.timestamp().rem_euclid(3600) as u64)
        + Duration::from_nanos(u64::from(now.timestamp_subsec_nanos()));
    Duration::from_secs(3600).saturating_sub(into_hour)
}

/// Cadence plus the delay used after a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSpec {
    pub cadence: Cadence,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Sleeping,
    Cancelled,
}

struct LoopHandle {
    name: &'static str,
    token: CancellationToken,
    state: watch::Receiver<LoopState>,
    task: JoinHandle<()>,
}

/// Owns the pipeline's background loops.
#[derive(Default)]
pub struct Scheduler {
    loops: Vec<LoopHandle>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a loop running `job` on `spec`.
    pub fn start<J: Job>(&mut self, job: J, spec: LoopSpec) {
        let name = job.name();
        let token = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(LoopState::Idle);

        let task = tokio::spawn(run_loop(job, spec, token.clone(), state_tx));

        info!(job = name, ?spec, "Started background loop");
        self.loops.push(LoopHandle {
            name,
            token,
            state: state_rx,
            task,
        });
    }

    /// Current state of the loop running the named job.
    pub fn state(&self, name: &str) -> Option<LoopState> {
        self.loops
            .iter()
            .find(|l| l.name == name)
            .map(|l| *l.state.borrow())
    }

    pub fn states(&self) -> Vec<(&'static str, LoopState)> {
        self.loops.iter().map(|l| (l.name, *l.state.borrow())).collect()
    }

    /// Signal every loop to stop. Returns without waiting.
    pub fn stop(&self) {
        for l in &self.loops {
            l.token.cancel();
        }
    }

    /// Stop every loop and wait for in-flight runs to finish.
    pub async fn shutdown(self) {
        self.stop();

        for l in self.loops {
            if let Err(e) = l.task.await {
                error!(job = l.name, error = %e, "Background loop panicked");
            }
        }
        info!("All background loops stopped");
    }
}

async fn run_loop<J: Job>(
    mut job: J,
    spec: LoopSpec,
    token: CancellationToken,
    state: watch::Sender<LoopState>,
) {
    let name = job.name();
    let mut delay = spec.cadence.initial_delay(Utc::now());

    loop {
        if !delay.is_zero() {
            state.send_replace(LoopState::Sleeping);
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if token.is_cancelled() {
            break;
        }

        state.send_replace(LoopState::Running);
        delay = match job.run().await {
            Ok(()) => spec.cadence.next_delay(Utc::now()),
            Err(e) => {
                warn!(job = name, error = %e, retry_in = ?spec.retry_delay, "Job failed, retrying");
                spec.retry_delay
            }
        };
    }

    state.send_replace(LoopState::Cancelled);
    info!(job = name, "Background loop stopped");
}

// ============================================================================
// Pipeline jobs
// ============================================================================

#[async_trait]
impl Job for CollectionOrchestrator {
    fn name(&self) -> &'static str {
        "collection"
    }

    async fn run(&mut self) -> Result<()> {
        self.run_cycle().await.map(|_| ())
    }
}

/// Aggregates the previous completed hour for every tracked service.
pub struct HourlyAggregationJob {
    aggregator: Aggregator,
}

impl HourlyAggregationJob {
    pub fn new(aggregator: Aggregator) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl Job for HourlyAggregationJob {
    fn name(&self) -> &'static str {
        "aggregation"
    }

    async fn run(&mut self) -> Result<()> {
        let current_hour = truncate_to_hour(Utc::now().naive_utc());
        let previous_hour = current_hour - chrono::Duration::hours(1);

        let run = self
            .aggregator
            .aggregate_multiple_hours(&TRACKED_SERVICES, previous_hour, current_hour)
            .await;

        if run.failures > 0 {
            return Err(MonitorError::PartialFailure(format!(
                "{} service-hours failed to aggregate",
                run.failures
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Job for SecurityAnalyzer {
    fn name(&self) -> &'static str {
        "security_analysis"
    }

    async fn run(&mut self) -> Result<()> {
        self.run_analysis().await.map(|_| ())
    }
}

/// Purges old rows and clears expired rate-limit counters.
pub struct CleanupJob {
    retention: RetentionEngine,
    scanner: ViolationScanner,
}

impl CleanupJob {
    pub fn new(retention: RetentionEngine, scanner: ViolationScanner) -> Self {
        Self { retention, scanner }
    }
}

#[async_trait]
impl Job for CleanupJob {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    async fn run(&mut self) -> Result<()> {
        let report = self.retention.run_full_cleanup(None).await;
        self.scanner.clear_expired_keys().await;

        if !report.failed.is_empty() {
            return Err(MonitorError::PartialFailure(format!(
                "cleanup failed for {}",
                report.failed.join(", ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;

    use super::*;

    #[derive(Clone, Default)]
    struct Counters {
        started: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    struct FakeJob {
        counters: Counters,
        fail_first: usize,
        work: Duration,
    }

    #[async_trait]
    impl Job for FakeJob {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn run(&mut self) -> Result<()> {
            let n = self.counters.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.counters.finished.fetch_add(1, Ordering::SeqCst);

            if n < self.fail_first {
                return Err(MonitorError::PartialFailure("simulated".to_string()));
            }
            Ok(())
        }
    }

    fn every(secs: u64, retry: u64) -> LoopSpec {
        LoopSpec {
            cadence: Cadence::Every(Duration::from_secs(secs)),
            retry_delay: Duration::from_secs(retry),
        }
    }

    #[test]
    fn test_until_next_hour() {
        let at = |h, m, s| Utc.with_ymd_and_hms(2025, 1, 15, h, m, s).unwrap();

        assert_eq!(until_next_hour(at(10, 59, 30)), Duration::from_secs(30));
        assert_eq!(until_next_hour(at(10, 0, 0)), Duration::from_secs(3600));
        assert_eq!(until_next_hour(at(23, 15, 0)), Duration::from_secs(45 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_interval() {
        let counters = Counters::default();
        let mut scheduler = Scheduler::new();
        scheduler.start(
            FakeJob {
                counters: counters.clone(),
                fail_first: 0,
                work: Duration::ZERO,
            },
            every(30, 60),
        );

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(counters.finished.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.state("fake"), Some(LoopState::Sleeping));

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_uses_retry_delay() {
        let counters = Counters::default();
        let mut scheduler = Scheduler::new();
        scheduler.start(
            FakeJob {
                counters: counters.clone(),
                fail_first: 1,
                work: Duration::ZERO,
            },
            every(30, 60),
        );

        // Failed at 0s, so the next run waits for the 60s retry
        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(counters.finished.load(Ordering::SeqCst), 1);

        // Retry at 60s succeeds, then back to the 30s interval
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(counters.finished.load(Ordering::SeqCst), 3);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_lets_running_job_finish() {
        let counters = Counters::default();
        let mut scheduler = Scheduler::new();
        scheduler.start(
            FakeJob {
                counters: counters.clone(),
                fail_first: 0,
                work: Duration::from_secs(10),
            },
            every(30, 60),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.state("fake"), Some(LoopState::Running));

        scheduler.shutdown().await;
        assert_eq!(counters.started.load(Ordering::SeqCst), 1);
        assert_eq!(counters.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pipeline_jobs_report_storage_failures() {
        use crate::counters::test_support::MemoryCounterStore;
        use crate::storage::Storage;

        let storage = Storage::new("sqlite::memory:").await.unwrap();

        let mut aggregation = HourlyAggregationJob::new(Aggregator::new(storage.clone()));
        let mut cleanup = CleanupJob::new(
            RetentionEngine::new(storage.clone(), 30),
            ViolationScanner::new(Arc::new(MemoryCounterStore::default())),
        );
        assert!(aggregation.run().await.is_ok());
        assert!(cleanup.run().await.is_ok());

        storage.close().await;
        assert!(matches!(
            aggregation.run().await,
            Err(MonitorError::PartialFailure(_))
        ));
        assert!(matches!(cleanup.run().await, Err(MonitorError::PartialFailure(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_sleep() {
        let counters = Counters::default();
        let mut scheduler = Scheduler::new();
        scheduler.start(
            FakeJob {
                counters: counters.clone(),
                fail_first: 0,
                work: Duration::ZERO,
            },
            every(3600, 60),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(scheduler.state("fake"), Some(LoopState::Cancelled));
        assert_eq!(scheduler.states(), vec![("fake", LoopState::Cancelled)]);
        assert_eq!(counters.finished.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }
}
