//! Rate-limit violation scanner.
//!
//! The edge keeps one counter per `(service, ip, endpoint)` under keys named
//! `rate_limit:{service}:{ip}:{endpoint...}`. Counters at or above the
//! threshold become [`RateLimitViolation`] records.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::Collection;
use crate::counters::CounterStore;
use crate::model::{RateLimitViolation, new_id};

const KEY_PREFIX: &str = "rate_limit";
const KEY_PATTERN: &str = "rate_limit:*";

/// Components of a rate-limit counter key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitKey {
    pub service: String,
    pub remote_ip: String,
    /// Everything after the IP, colons included. May be empty.
    pub endpoint: String,
}

/// Split a counter key into its components.
///
/// Returns `None` unless the key has the `rate_limit` prefix and non-empty
/// service and IP segments.
pub fn parse_rate_limit_key(key: &str) -> Option<RateLimitKey> {
    let mut parts = key.splitn(4, ':');

    if parts.next()? != KEY_PREFIX {
        return None;
    }
    let service = parts.next().filter(|s| !s.is_empty())?;
    let remote_ip = parts.next().filter(|s| !s.is_empty())?;
    let endpoint = parts.next().unwrap_or_default();

    Some(RateLimitKey {
        service: service.to_string(),
        remote_ip: remote_ip.to_string(),
        endpoint: endpoint.to_string(),
    })
}

pub struct ViolationScanner {
    store: Arc<dyn CounterStore>,
}

impl ViolationScanner {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Collect every counter at or above `threshold`.
    ///
    /// Malformed keys and keys whose value can't be read are skipped.
    pub async fn collect_violations(&self, threshold: i64) -> Collection<RateLimitViolation> {
        let keys = match self.store.scan_keys(KEY_PATTERN).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to scan rate limit keys");
                return Collection::failed(e.to_string());
            }
        };

        let mut violations = Vec::new();

        for key in keys {
            let Some(parsed) = parse_rate_limit_key(&key) else {
                warn!(key = %key, "Skipping malformed rate limit key");
                continue;
            };

            let count = match self.store.get(&key).await {
                Ok(Some(count)) => count,
                // Expired between scan and read
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read rate limit counter");
                    continue;
                }
            };

            if count < threshold {
                continue;
            }

            violations.push(RateLimitViolation {
                id: new_id(),
                timestamp: Utc::now().naive_utc(),
                service: parsed.service,
                remote_ip: parsed.remote_ip,
                violation_count: count,
                user_id: None,
            });
        }

        if !violations.is_empty() {
            info!(count = violations.len(), threshold, "Collected rate limit violations");
        }

        Collection::from_items(violations)
    }

    /// Delete counters whose TTL reports no time remaining.
    ///
    /// # Returns
    ///
    /// The number of keys deleted. Failures are logged and stop nothing.
    pub async fn clear_expired_keys(&self) -> usize {
        let keys = match self.store.scan_keys(KEY_PATTERN).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Failed to scan rate limit keys for cleanup");
                return 0;
            }
        };

        let mut cleared = 0;
        for key in keys {
            match self.store.ttl(&key).await {
                Ok(0) => match self.store.delete(&key).await {
                    Ok(()) => cleared += 1,
                    Err(e) => warn!(key = %key, error = %e, "Failed to delete expired key"),
                },
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "Failed to read key TTL"),
            }
        }

        if cleared > 0 {
            info!(count = cleared, "Cleared expired rate limit keys");
        }
        cleared
    }
}
