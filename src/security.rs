//! Rule-based detection of suspicious traffic.
//!
//! Three independent rules run over recent metric snapshots, each with its
//! own lookback window:
//!
//! | Rule                   | Window | Flags an IP when                         | Severity   |
//! |------------------------|--------|------------------------------------------|------------|
//! | `high_error_rate`      | 60 min | >= 10 requests and > 50% are errors      | medium     |
//! | `rapid_requests`       | 10 s   | > 50 requests                            | high       |
//! | `failed_auth_attempts` | 15 min | >= 5 responses of 401 on `/auth/` URLs   | escalating |
//!
//! The rules share no state. Their findings are stored together once all
//! three have run.

use chrono::{Duration, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{ActivityDetails, Severity, SuspiciousActivity, round2};
use crate::storage::{IpErrorCounts, IpRequestCount, Storage};

/// Windows and thresholds for the detection rules.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionConfig {
    pub error_rate_window_minutes: i64,
    /// IPs with fewer requests in the window are ignored.
    pub error_rate_min_requests: i64,
    /// Error percentage that must be exceeded (strictly).
    pub error_rate_percent: f64,

    pub rapid_window_seconds: i64,
    /// Request count that must be exceeded (strictly).
    pub rapid_threshold: i64,

    pub failed_auth_window_minutes: i64,
    /// Minimum 401 count that is flagged.
    pub failed_auth_threshold: i64,
    /// SQL `LIKE` pattern selecting authentication URLs.
    pub auth_url_pattern: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            error_rate_window_minutes: 60,
            error_rate_min_requests: 10,
            error_rate_percent: 50.0,
            rapid_window_seconds: 10,
            rapid_threshold: 50,
            failed_auth_window_minutes: 15,
            failed_auth_threshold: 5,
            auth_url_pattern: "%/auth/%".to_string(),
        }
    }
}

/// Flag an IP whose error percentage exceeds the configured limit.
pub fn classify_error_rate(
    counts: &IpErrorCounts,
    config: &DetectionConfig,
    now: NaiveDateTime,
) -> Option<SuspiciousActivity> {
    if counts.total < config.error_rate_min_requests || counts.total == 0 {
        return None;
    }

    let error_rate = counts.errors as f64 / counts.total as f64 * 100.0;
    if error_rate <= config.error_rate_percent {
        return None;
    }

    Some(SuspiciousActivity::new(
        now,
        &counts.remote_ip,
        Severity::Medium,
        ActivityDetails::HighErrorRate {
            error_rate: round2(error_rate),
            total_requests: counts.total,
            error_count: counts.errors,
            time_window_minutes: config.error_rate_window_minutes,
        },
    ))
}

/// Flag an IP whose request count in the short window exceeds the limit.
pub fn classify_rapid_requests(
    counts: &IpRequestCount,
    config: &DetectionConfig,
    now: NaiveDateTime,
) -> Option<SuspiciousActivity> {
    if counts.count <= config.rapid_threshold {
        return None;
    }

    let window = config.rapid_window_seconds.max(1);
    Some(SuspiciousActivity::new(
        now,
        &counts.remote_ip,
        Severity::High,
        ActivityDetails::RapidRequests {
            request_count: counts.count,
            time_window_seconds: config.rapid_window_seconds,
            threshold: config.rapid_threshold,
            requests_per_second: round2(counts.count as f64 / window as f64),
        },
    ))
}

/// Flag an IP with repeated failed logins; severity escalates with the count.
pub fn classify_failed_auth(
    counts: &IpRequestCount,
    config: &DetectionConfig,
    now: NaiveDateTime,
) -> Option<SuspiciousActivity> {
    if counts.count < config.failed_auth_threshold {
        return None;
    }

    Some(SuspiciousActivity::new(
        now,
        &counts.remote_ip,
        Severity::for_failed_auth(counts.count),
        ActivityDetails::FailedAuthAttempts {
            failed_attempts: counts.count,
            time_window_minutes: config.failed_auth_window_minutes,
            threshold: config.failed_auth_threshold,
        },
    ))
}

/// Runs the detection rules and stores what they find.
#[derive(Clone)]
pub struct SecurityAnalyzer {
    storage: Storage,
    config: DetectionConfig,
}

impl SecurityAnalyzer {
    pub fn new(storage: Storage, config: DetectionConfig) -> Self {
        Self { storage, config }
    }

    pub async fn detect_high_error_rate(
        &self,
        now: NaiveDateTime,
    ) -> Result<Vec<SuspiciousActivity>> {
        let since = now - Duration::minutes(self.config.error_rate_window_minutes);
        let counts = self
            .storage
            .error_counts_by_ip(since, self.config.error_rate_min_requests)
            .await?;

        Ok(counts
            .iter()
            .filter_map(|c| classify_error_rate(c, &self.config, now))
            .collect())
    }

    pub async fn detect_rapid_requests(
        &self,
        now: NaiveDateTime,
    ) -> Result<Vec<SuspiciousActivity>> {
        let since = now - Duration::seconds(self.config.rapid_window_seconds);
        let counts = self
            .storage
            .request_counts_above(since, self.config.rapid_threshold)
            .await?;

        Ok(counts
            .iter()
            .filter_map(|c| classify_rapid_requests(c, &self.config, now))
            .collect())
    }

    pub async fn detect_failed_auth_attempts(
        &self,
        now: NaiveDateTime,
    ) -> Result<Vec<SuspiciousActivity>> {
        let since = now - Duration::minutes(self.config.failed_auth_window_minutes);
        let counts = self
            .storage
            .failed_auth_counts(
                since,
                &self.config.auth_url_pattern,
                self.config.failed_auth_threshold,
            )
            .await?;

        Ok(counts
            .iter()
            .filter_map(|c| classify_failed_auth(c, &self.config, now))
            .collect())
    }

    /// Run every rule against the current time and store the findings.
    pub async fn run_analysis(&self) -> Result<usize> {
        self.run_analysis_at(Utc::now().naive_utc()).await
    }

    /// Run every rule with windows ending at `now` and store the findings in
    /// one transaction.
    ///
    /// # Returns
    ///
    /// The number of activities stored. Zero is the normal case.
    pub async fn run_analysis_at(&self, now: NaiveDateTime) -> Result<usize> {
        let high_error = self.detect_high_error_rate(now).await?;
        let rapid = self.detect_rapid_requests(now).await?;
        let failed_auth = self.detect_failed_auth_attempts(now).await?;

        let (high_error_count, rapid_count, failed_auth_count) =
            (high_error.len(), rapid.len(), failed_auth.len());

        let activities: Vec<SuspiciousActivity> =
            high_error.into_iter().chain(rapid).chain(failed_auth).collect();

        if activities.is_empty() {
            debug!("No suspicious activity detected");
            return Ok(0);
        }

        self.storage.record_suspicious_activities(&activities).await?;

        warn!(
            total = activities.len(),
            high_error = high_error_count,
            rapid_requests = rapid_count,
            failed_auth = failed_auth_count,
            "Recorded suspicious activities"
        );
        Ok(activities.len())
    }
}

/// Overall threat level across a set of activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// Per-severity tallies and the threat level they imply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreatAssessment {
    pub threat_level: ThreatLevel,
    pub critical_count: usize,
    pub high_count: usize,
    pub medium_count: usize,
    pub low_count: usize,
    pub total_activities: usize,
}

/// Reduce a set of activities to a threat level.
///
/// Any critical activity makes the level critical; otherwise five or more
/// high make it high, then ten or more medium make it medium, and anything
/// else is low. An empty set is `none`.
pub fn assess_threat_level(activities: &[SuspiciousActivity]) -> ThreatAssessment {
    let tally = |severity: Severity| activities.iter().filter(|a| a.severity == severity).count();

    let critical_count = tally(Severity::Critical);
    let high_count = tally(Severity::High);
    let medium_count = tally(Severity::Medium);
    let low_count = tally(Severity::Low);

    let threat_level = if activities.is_empty() {
        ThreatLevel::None
    } else if critical_count > 0 {
        ThreatLevel::Critical
    } else if high_count >= 5 {
        ThreatLevel::High
    } else if medium_count >= 10 {
        ThreatLevel::Medium
    } else {
        ThreatLevel::Low
    };

    ThreatAssessment {
        threat_level,
        critical_count,
        high_count,
        medium_count,
        low_count,
        total_activities: activities.len(),
    }
}
